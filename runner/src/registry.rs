use crate::{
    batch::BatchRecord,
    database::{JobStore, StoreError},
    job::{BatchId, FailureReason, Job, JobFailure, JobId, JobStatus},
};
use itertools::Itertools;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown job {0}")]
    UnknownJob(JobId),
    #[error("Unknown batch {0}")]
    UnknownBatch(BatchId),
    #[error("Job {0} is still running")]
    Busy(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Process wide table of jobs and batches.
///
/// Every mutation runs as a closure under the write lock, so readers only ever see complete
/// records. Snapshots are clones and never alias the stored record.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    batches: RwLock<HashMap<BatchId, BatchRecord>>,
    store: Option<Arc<dyn JobStore>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a store, loaded with everything the store holds as it is. Unfinished
    /// jobs may belong to another live runner, see `recover_interrupted`.
    pub fn with_store(store: Arc<dyn JobStore>) -> Result<Self, RegistryError> {
        let jobs = store
            .load_jobs()?
            .into_iter()
            .map(|job| (job.id, job))
            .collect::<HashMap<_, _>>();
        let batches = store
            .load_batches()?
            .into_iter()
            .map(|batch| (batch.id, batch))
            .collect::<HashMap<_, _>>();

        info!(
            jobs = jobs.len(),
            batches = batches.len(),
            "Restored registry from store"
        );

        Ok(Self {
            jobs: RwLock::new(jobs),
            batches: RwLock::new(batches),
            store: Some(store),
        })
    }

    /// Fail every unfinished job as interrupted and write it back. Only valid while no other
    /// runner uses the store.
    pub fn recover_interrupted(&self) -> Result<usize, RegistryError> {
        let mut jobs = self.jobs.write();
        let mut recovered = 0;

        for job in jobs.values_mut().filter(|job| !job.is_terminal()) {
            warn!(job = %job.id, status = %job.status, "Job was interrupted by a restart");
            let failure = JobFailure::new(
                FailureReason::Interrupted,
                format!("runner stopped while the job was {}", job.status),
            );
            if let Err(e) = job.fail(failure) {
                warn!(job = %job.id, "Failed to mark job as interrupted: {e}");
                continue;
            }
            if let Some(ref store) = self.store {
                store.save_job(job)?;
            }
            recovered += 1;
        }

        Ok(recovered)
    }

    fn persist(&self, job: &Job) {
        if let Some(ref store) = self.store {
            if let Err(e) = store.save_job(job) {
                error!(job = %job.id, "Failed to persist job: {e}");
            }
        }
    }

    pub fn insert(&self, job: Job) -> JobId {
        let id = job.id;
        self.persist(&job);
        self.jobs.write().insert(id, job);

        id
    }

    pub fn get(&self, id: JobId) -> Result<Job, RegistryError> {
        self.jobs
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownJob(id))
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.read().contains_key(&id)
    }

    /// Apply `update` atomically. Reaching a terminal state is persisted before the lock is
    /// released, a reader that sees a finished job can rely on the store having it too.
    pub fn update<R>(
        &self,
        id: JobId,
        update: impl FnOnce(&mut Job) -> R,
    ) -> Result<R, RegistryError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(RegistryError::UnknownJob(id))?;
        let was_terminal = job.is_terminal();

        let result = update(job);

        if !was_terminal && job.is_terminal() {
            self.persist(job);
        }

        Ok(result)
    }

    /// all jobs ordered by creation time
    pub fn list(&self) -> Vec<Job> {
        self.jobs
            .read()
            .values()
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .collect()
    }

    /// snapshots of the given jobs in the given order, unknown ids are skipped
    pub fn select(&self, ids: &[JobId]) -> Vec<Job> {
        let jobs = self.jobs.read();
        ids.iter().filter_map(|id| jobs.get(id).cloned()).collect()
    }

    /// Remove a terminal or never started job
    pub fn remove(&self, id: JobId) -> Result<Job, RegistryError> {
        let job = {
            let mut jobs = self.jobs.write();
            match jobs.get(&id) {
                None => return Err(RegistryError::UnknownJob(id)),
                Some(job) if !job.is_terminal() && job.status != JobStatus::Queued => {
                    return Err(RegistryError::Busy(id))
                }
                Some(_) => {}
            }
            jobs.remove(&id).ok_or(RegistryError::UnknownJob(id))?
        };

        if let Some(ref store) = self.store {
            store.delete_job(id)?;
        }

        Ok(job)
    }

    pub fn insert_batch(&self, batch: BatchRecord) -> BatchId {
        let id = batch.id;
        if let Some(ref store) = self.store {
            if let Err(e) = store.save_batch(&batch) {
                error!(batch = %id, "Failed to persist batch: {e}");
            }
        }
        self.batches.write().insert(id, batch);

        id
    }

    pub fn batch(&self, id: BatchId) -> Result<BatchRecord, RegistryError> {
        self.batches
            .read()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::UnknownBatch(id))
    }

    pub fn batches(&self) -> Vec<BatchRecord> {
        self.batches
            .read()
            .values()
            .cloned()
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at))
            .collect()
    }

    /// Forget a job inside its batch, the batch goes away with its last member
    pub fn detach_from_batch(&self, batch: BatchId, job: JobId) -> Result<(), RegistryError> {
        let emptied = {
            let mut batches = self.batches.write();
            let Some(record) = batches.get_mut(&batch) else {
                return Ok(());
            };
            record.remove_member(job);

            if record.members.is_empty() {
                batches.remove(&batch);
                None
            } else {
                Some(record.clone())
            }
        };

        if let Some(ref store) = self.store {
            match emptied {
                Some(record) => store.save_batch(&record)?,
                None => store.delete_batch(batch)?,
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobConfig, MeshOrigin};
    use std::{path::Path, sync::Barrier, thread};

    fn job(dir: &Path) -> Job {
        let geometry = dir.join("wheel.stl");
        std::fs::write(&geometry, "solid\n").unwrap();
        Job::new(JobConfig::new("wheel", geometry))
    }

    #[test]
    fn updates_are_atomic_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let id = registry.insert(job(dir.path()));

        let snapshot = registry.get(id).unwrap();
        registry
            .update(id, |job| job.transition(JobStatus::Preparing))
            .unwrap()
            .unwrap();

        // the snapshot taken before is unaffected
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Preparing);

        let barrier = Arc::new(Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        registry
                            .update(id, |job| job.raise_progress(job.progress + 1))
                            .unwrap();
                        let seen = registry.get(id).unwrap();
                        assert!(!(seen.status == JobStatus::Complete && seen.result.is_none()));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.get(id).unwrap().progress, 100);
    }

    #[test]
    fn running_jobs_cannot_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new();
        let id = registry.insert(job(dir.path()));

        registry
            .update(id, |job| {
                job.mesh = MeshOrigin::Generated;
                job.transition(JobStatus::Preparing)
            })
            .unwrap()
            .unwrap();
        assert!(matches!(registry.remove(id), Err(RegistryError::Busy(_))));

        registry
            .update(id, |job| {
                job.fail(JobFailure::new(FailureReason::Cancelled, "test"))
            })
            .unwrap()
            .unwrap();
        registry.remove(id).unwrap();
        assert!(matches!(
            registry.get(id),
            Err(RegistryError::UnknownJob(_))
        ));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn a_second_registry_leaves_running_jobs_alone() {
        use crate::database::sqlite::SharedConnection;

        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("wheelflow.db");
        let open = || -> Arc<dyn JobStore> {
            let store = SharedConnection::load(&database).unwrap();
            store.init().unwrap();
            Arc::new(store)
        };

        let running = JobRegistry::with_store(open()).unwrap();
        let id = running.insert(job(dir.path()));
        running
            .update(id, |job| job.transition(JobStatus::Preparing))
            .unwrap()
            .unwrap();

        let viewer = JobRegistry::with_store(open()).unwrap();
        assert_eq!(viewer.get(id).unwrap().status, JobStatus::Queued);
        assert!(viewer.get(id).unwrap().error.is_none());
        assert_eq!(running.get(id).unwrap().status, JobStatus::Preparing);

        drop(running);
        let restarted = JobRegistry::with_store(open()).unwrap();
        assert_eq!(restarted.recover_interrupted().unwrap(), 1);
        assert_eq!(
            restarted.get(id).unwrap().error.map(|failure| failure.reason),
            Some(FailureReason::Interrupted)
        );

        let reopened = JobRegistry::with_store(open()).unwrap();
        assert_eq!(reopened.get(id).unwrap().status, JobStatus::Failed);
        assert_eq!(reopened.recover_interrupted().unwrap(), 0);
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new();
        let first = registry.insert(job(dir.path()));
        thread::sleep(std::time::Duration::from_millis(2));
        let second = registry.insert(job(dir.path()));

        let ids = registry.list().into_iter().map(|job| job.id).collect_vec();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(
            registry
                .select(&[second, JobId::new(), first])
                .into_iter()
                .map(|job| job.id)
                .collect_vec(),
            vec![second, first]
        );
    }
}
