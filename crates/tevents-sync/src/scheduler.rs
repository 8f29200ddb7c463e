use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::pass::{PassMode, PassReport, SyncPipeline};

/// Owns the single in-flight flag guarding a [`SyncPipeline`].
///
/// A trigger that arrives while a pass is running is dropped, never queued.
#[derive(Clone)]
pub struct SyncScheduler {
    pipeline: Arc<SyncPipeline>,
    in_flight: Arc<AtomicBool>,
}

struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncScheduler {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pipeline(&self) -> &Arc<SyncPipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<InFlightGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(Arc::clone(&self.in_flight)))
    }

    /// Runs an incremental pass unless one is already in flight.
    pub async fn trigger(&self) -> Option<PassReport> {
        self.trigger_mode(PassMode::Incremental).await
    }

    /// Clears the store and repopulates it, under the same guard.
    pub async fn trigger_reset(&self) -> Option<PassReport> {
        self.trigger_mode(PassMode::Reset).await
    }

    async fn trigger_mode(&self, mode: PassMode) -> Option<PassReport> {
        let Some(_guard) = self.try_acquire() else {
            warn!(?mode, "sync pass already in flight; trigger skipped");
            return None;
        };
        Some(self.pipeline.run(mode, chrono::Utc::now()).await)
    }

    /// Installs a cron job that calls [`trigger`](Self::trigger) and starts it.
    pub async fn start(&self, cron: &str) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let this = self.clone();
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let this = this.clone();
            Box::pin(async move {
                let _report = this.trigger().await;
            })
        })
        .with_context(|| format!("creating sync job for cron {cron}"))?;
        sched.add(job).await.context("adding sync job")?;
        sched.start().await.context("starting scheduler")?;
        info!(cron, "sync job scheduled");
        Ok(sched)
    }
}
