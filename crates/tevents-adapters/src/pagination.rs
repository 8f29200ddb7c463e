//! Cursor-following page stream over a [`PageFetcher`].

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::{AdapterError, FeedPage, PageFetcher};

struct Cursor {
    fetcher: Arc<dyn PageFetcher>,
    run_id: Uuid,
    next: Option<String>,
    seen: HashSet<String>,
}

/// Yields pages in feed order starting at `start_url`.
///
/// The stream ends after the page whose cursor is absent, or right after the
/// first error. A cursor pointing at an already-visited URL is reported as a
/// malformed page instead of being followed.
pub fn paginate(
    fetcher: Arc<dyn PageFetcher>,
    run_id: Uuid,
    start_url: impl Into<String>,
) -> BoxStream<'static, Result<FeedPage, AdapterError>> {
    let cursor = Cursor {
        fetcher,
        run_id,
        next: Some(start_url.into()),
        seen: HashSet::new(),
    };

    stream::unfold(cursor, |mut cursor| async move {
        let url = cursor.next.take()?;
        if !cursor.seen.insert(url.clone()) {
            let err = AdapterError::Malformed {
                url,
                reason: "pagination cursor points at an already visited page".to_string(),
            };
            return Some((Err(err), cursor));
        }

        match cursor.fetcher.fetch_page(cursor.run_id, &url).await {
            Ok(page) => {
                cursor.next = page.next_page.clone();
                Some((Ok(page), cursor))
            }
            Err(err) => Some((Err(err), cursor)),
        }
    })
    .boxed()
}
