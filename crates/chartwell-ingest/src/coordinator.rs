//! Import coordinator
//!
//! Resolves sources, keeps at most one live job per (source, file), bounds how
//! many jobs run at once and records the last sync of every successful job.

use chartwell_common::{FileReference, SourceId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::jobs::{JobHandle, JobSnapshot, JobState, ProcessingTaskFactory};
use crate::sources::SourceRegistry;

type JobKey = (SourceId, FileReference);

#[derive(Default)]
struct LiveJobs {
    jobs: Mutex<HashMap<JobKey, CancellationToken>>,
}

impl LiveJobs {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, CancellationToken>> {
        // A panicked holder cannot leave the map half-updated.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a job's entry when its task ends, including by panic
struct LiveEntry {
    jobs: Arc<LiveJobs>,
    key: JobKey,
}

impl Drop for LiveEntry {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.key);
    }
}

pub struct ImportCoordinator {
    registry: Arc<dyn SourceRegistry>,
    factory: ProcessingTaskFactory,
    slots: Arc<Semaphore>,
    live: Arc<LiveJobs>,
}

impl ImportCoordinator {
    pub fn new(registry: Arc<dyn SourceRegistry>, factory: ProcessingTaskFactory) -> Self {
        let permits = factory.pipeline().max_concurrent_jobs.max(1);
        Self {
            registry,
            factory,
            slots: Arc::new(Semaphore::new(permits)),
            live: Arc::new(LiveJobs::default()),
        }
    }

    /// Jobs submitted and not yet finished, queued ones included
    pub fn live_jobs(&self) -> usize {
        self.live.lock().len()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Start importing `file` for the source
    ///
    /// The returned handle's job waits for a free slot before it runs.
    pub async fn submit(&self, source_id: &SourceId, file: FileReference, is_first_import: bool) -> Result<JobHandle> {
        let source = self.registry.get_source(source_id).await?;
        if !source.is_active() {
            return Err(IngestError::InactiveSource(source.id.to_string()));
        }

        let key = (source.id.clone(), file.clone());
        let (job, entry) = {
            let mut live = self.live.lock();
            if live.contains_key(&key) {
                return Err(IngestError::JobAlreadyRunning {
                    source_id: source.id.to_string(),
                    file: file.to_string(),
                });
            }

            let job = self.factory.create_job(&source, file, is_first_import)?;
            live.insert(key.clone(), job.cancellation_token());
            (
                job,
                LiveEntry {
                    jobs: Arc::clone(&self.live),
                    key,
                },
            )
        };

        let receiver = job.subscribe();
        let cancel = job.cancellation_token();
        let waiting = cancel.clone();
        let slots = Arc::clone(&self.slots);
        let registry = Arc::clone(&self.registry);

        debug!(job_id = %job.id(), source_id = %source.id, "Queued import job");

        let task = tokio::spawn(async move {
            let _entry = entry;
            let permit = tokio::select! {
                permit = slots.acquire_owned() => permit.ok(),
                _ = waiting.cancelled() => None,
            };

            let snapshot = job.run().await;
            drop(permit);

            if snapshot.state == JobState::Succeeded {
                let at = snapshot.finished_at.unwrap_or_else(chrono::Utc::now);
                match registry.mark_synced(&snapshot.source_id, at).await {
                    Ok(()) => info!(source_id = %snapshot.source_id, "Recorded source sync"),
                    Err(e) => warn!(
                        source_id = %snapshot.source_id,
                        error = %e,
                        "Import succeeded but recording the sync failed"
                    ),
                }
            }

            snapshot
        });

        Ok(JobHandle::new(receiver, cancel, task))
    }

    /// Cancel every live job; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let live = self.live.lock();
        for token in live.values() {
            token.cancel();
        }
        info!("Cancelled {} live import jobs", live.len());
        live.len()
    }

    /// Wait for `handle`, cancelling every live job once `shutdown` resolves
    ///
    /// The job has reached a terminal state when this returns. The flag is
    /// true when shutdown fired first.
    pub async fn wait_or_cancel<F>(&self, handle: JobHandle, shutdown: F) -> (JobSnapshot, bool)
    where
        F: Future<Output = ()>,
    {
        let wait = handle.wait();
        tokio::pin!(wait);

        tokio::select! {
            snapshot = &mut wait => (snapshot, false),
            () = shutdown => {
                warn!("Shutdown requested; cancelling import jobs");
                self.cancel_all();
                (wait.await, true)
            },
        }
    }
}
