use crate::{
    batch::{
        BatchCoordinator, BatchMember, BatchRecord, BatchSnapshot, BatchSummary, JobLauncher, Sweep,
    },
    config::RunnerConfig,
    database::{self, RunnerLock, StoreError},
    executors::{CancelToken, Executor, LocalExecutor},
    ingest::ConvergenceHistory,
    job::{
        BatchId, ConfigurationError, FailureReason, Job, JobConfig, JobFailure, JobId, JobStatus,
    },
    pipeline::{JobPipeline, MeshSource},
    registry::{JobRegistry, RegistryError},
    workspace::{WorkspaceError, WorkspaceManager},
};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::{
    collections::HashMap,
    io,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// cadence of the `wait_*` helpers
const WAIT_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("Failed to open the job store: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to build the worker pool: {0}")]
    Pool(#[from] ThreadPoolBuildError),
    #[error("Failed to start the coordinator of batch {batch}: {source}")]
    Coordinator { batch: BatchId, source: io::Error },
    #[error("Gave up waiting for {0}")]
    WaitTimeout(String),
    #[error("This runner only inspects the store and cannot start jobs")]
    ReadOnly,
}

/// How a process uses the job store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Runs jobs. Holds the runner lock for its lifetime.
    Drive,
    /// Only reads and deletes. Unfinished jobs are left to the runner that owns them and cannot
    /// be deleted.
    Inspect,
}

/// Caller facing surface: submission, queries, cancellation and deletion of jobs and batches.
///
/// Job pipelines run on a pool bounded by `max_concurrent_jobs`, every batch gets a coordinator
/// thread of its own that only waits for pool tasks. Queries never wait for a running job.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    pipeline: JobPipeline,
    access: Access,
    _lock: Option<RunnerLock>,
    pool: ThreadPool,
    history_limit: usize,
    /// cancellation tokens of jobs that have not finished yet
    jobs: Mutex<HashMap<JobId, CancelToken>>,
    /// cancellation tokens of batches whose coordinator is still running
    batches: Mutex<HashMap<BatchId, CancelToken>>,
}

impl Inner {
    fn registry(&self) -> &JobRegistry {
        self.pipeline.registry()
    }

    fn enqueue(&self, config: JobConfig) -> JobId {
        let mut job = Job::new(config);
        job.convergence = ConvergenceHistory::with_limit(self.history_limit);

        let id = self.registry().insert(job);
        self.jobs.lock().insert(id, CancelToken::new());
        debug!(job = %id, "Queued job");

        id
    }

    fn token(&self, id: JobId) -> CancelToken {
        self.jobs.lock().entry(id).or_default().clone()
    }
}

impl JobLauncher for Arc<Inner> {
    fn launch(&self, id: JobId, source: MeshSource) -> Receiver<JobStatus> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let token = self.token(id);
        let inner = Arc::clone(self);

        self.pool.spawn(move || {
            let status = match inner.pipeline.run(id, source, &token) {
                Ok(status) => status,
                Err(e) => {
                    error!(job = %id, "Job pipeline aborted: {e}");
                    inner
                        .registry()
                        .get(id)
                        .map(|job| job.status)
                        .unwrap_or(JobStatus::Failed)
                }
            };

            inner.jobs.lock().remove(&id);
            // nobody listens for single jobs
            let _ = sender.send(status);
        });

        receiver
    }

    fn release(&self, id: JobId) {
        self.jobs.lock().remove(&id);
    }
}

impl Orchestrator {
    /// Orchestrator running stages through `executor`. With a database configured, jobs and
    /// batches of earlier runs are restored from it.
    pub fn new(config: &RunnerConfig, executor: Arc<dyn Executor>) -> Result<Self, OrchestratorError> {
        Self::with_access(config, executor, Access::Drive)
    }

    /// Orchestrator running the engine as local subprocesses
    pub fn load(config: &RunnerConfig) -> Result<Self, OrchestratorError> {
        Self::new(config, Arc::new(LocalExecutor::load(config)))
    }

    /// Read only view of the store, for looking at jobs another process may be running
    pub fn inspect(config: &RunnerConfig) -> Result<Self, OrchestratorError> {
        Self::with_access(config, Arc::new(LocalExecutor::load(config)), Access::Inspect)
    }

    pub fn with_access(
        config: &RunnerConfig,
        executor: Arc<dyn Executor>,
        access: Access,
    ) -> Result<Self, OrchestratorError> {
        let (registry, lock) = match config.database {
            Some(ref database) => {
                let store = database::open(database)?;

                // held exclusively only while no runner is alive, so nobody else owns the
                // unfinished jobs loaded under it
                let sole = RunnerLock::try_exclusive(&database.path)?;
                let registry = JobRegistry::with_store(store)?;
                match sole {
                    Some(_) => {
                        let recovered = registry.recover_interrupted()?;
                        if recovered > 0 {
                            warn!(recovered, "Failed jobs interrupted by an earlier shutdown");
                        }
                    }
                    None => info!("Another runner is using the store, leaving its jobs alone"),
                }
                drop(sole);

                let lock = match access {
                    Access::Drive => Some(RunnerLock::shared(&database.path)?),
                    Access::Inspect => None,
                };
                info!(path = ?database.path, jobs = registry.list().len(), "Restored job registry");

                (registry, lock)
            }
            None => (JobRegistry::new(), None),
        };

        let threads = config.worker_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("wheelflow-job-{index}"))
            .build()?;
        info!(threads, "Started job worker pool");

        let pipeline = JobPipeline::new(
            Arc::new(registry),
            WorkspaceManager::new(&config.workspace_root),
            config.engine.clone(),
            executor,
            config.log_tail_lines,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                pipeline,
                access,
                _lock: lock,
                pool,
                history_limit: config.history_limit,
                jobs: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn registry(&self) -> &JobRegistry {
        self.inner.registry()
    }

    fn check_drives(&self) -> Result<(), OrchestratorError> {
        match self.inner.access {
            Access::Drive => Ok(()),
            Access::Inspect => Err(OrchestratorError::ReadOnly),
        }
    }

    /// Validate `config` and start its pipeline. Invalid configurations are rejected before
    /// anything is created.
    #[instrument(skip_all, level = "info", fields(name = %config.name))]
    pub fn submit_job(&self, config: JobConfig) -> Result<JobId, OrchestratorError> {
        self.check_drives()?;
        let config = config.seal()?;
        let id = self.inner.enqueue(config);

        drop(self.inner.launch(id, MeshSource::Generate));
        info!(job = %id, "Submitted job");

        Ok(id)
    }

    /// One job per sweep value on top of `base`. The first job meshes, the others adopt its mesh.
    #[instrument(skip_all, level = "info", fields(name = %base.name, parameter = %sweep.parameter))]
    pub fn submit_batch(&self, base: JobConfig, sweep: Sweep) -> Result<BatchId, OrchestratorError> {
        self.check_drives()?;
        sweep.validate()?;

        let batch = BatchId::new();
        let configs = sweep
            .configs(&base, batch)
            .into_iter()
            .map(JobConfig::seal)
            .collect::<Result<Vec<_>, _>>()?;

        let mut record = BatchRecord::new(batch, base.name, sweep.parameter);
        for (config, value) in configs.into_iter().zip(sweep.values) {
            let job = self.inner.enqueue(config);
            record.members.push(BatchMember { job, value });
        }
        self.registry().insert_batch(record.clone());

        let cancel = CancelToken::new();
        self.inner.batches.lock().insert(batch, cancel.clone());

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("wheelflow-batch-{batch}"))
            .spawn(move || {
                let coordinator = BatchCoordinator {
                    registry: inner.registry(),
                    workspaces: inner.pipeline.workspaces(),
                    launcher: &inner,
                    cancel,
                };
                coordinator.run(&record);
                inner.batches.lock().remove(&record.id);
            });

        if let Err(source) = spawned {
            self.inner.batches.lock().remove(&batch);
            return Err(OrchestratorError::Coordinator { batch, source });
        }
        info!(batch = %batch, "Submitted batch");

        Ok(batch)
    }

    pub fn get_job(&self, id: JobId) -> Result<Job, OrchestratorError> {
        Ok(self.registry().get(id)?)
    }

    pub fn get_batch(&self, id: BatchId) -> Result<BatchSnapshot, OrchestratorError> {
        let record = self.registry().batch(id)?;
        let members = self.registry().select(&record.job_ids());

        Ok(BatchSnapshot::new(&record, &members))
    }

    pub fn get_batch_results(&self, id: BatchId) -> Result<BatchSummary, OrchestratorError> {
        let record = self.registry().batch(id)?;
        let members = self.registry().select(&record.job_ids());

        Ok(BatchSummary::new(&record, &members))
    }

    pub fn get_convergence(&self, id: JobId) -> Result<ConvergenceHistory, OrchestratorError> {
        Ok(self.registry().get(id)?.convergence)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.registry().list()
    }

    pub fn list_batches(&self) -> Vec<BatchSnapshot> {
        self.registry()
            .batches()
            .iter()
            .map(|record| BatchSnapshot::new(record, &self.registry().select(&record.job_ids())))
            .collect()
    }

    /// Remove a finished or never started job together with its workspace
    #[instrument(skip(self), level = "info")]
    pub fn delete_job(&self, id: JobId) -> Result<(), OrchestratorError> {
        if self.inner.access == Access::Inspect && !self.registry().get(id)?.is_terminal() {
            return Err(RegistryError::Busy(id).into());
        }
        let job = self.registry().remove(id)?;
        if let Some(token) = self.inner.jobs.lock().remove(&id) {
            // a queued job may still sit in the pool queue
            token.cancel();
        }

        self.inner.pipeline.workspaces().cleanup(id)?;
        if let Some(batch) = job.config.batch {
            self.registry().detach_from_batch(batch, id)?;
        }
        info!("Deleted job");

        Ok(())
    }

    /// Request cancellation of a job. A running stage is stopped, a queued job fails right away.
    /// Returns false when the job had already finished.
    #[instrument(skip(self), level = "info")]
    pub fn cancel_job(&self, id: JobId) -> Result<bool, OrchestratorError> {
        if self.registry().get(id)?.is_terminal() {
            return Ok(false);
        }

        if let Some(token) = self.inner.jobs.lock().get(&id) {
            token.cancel();
        }

        let failed = self.registry().update(id, |job| {
            if job.status != JobStatus::Queued {
                return Ok(());
            }
            job.fail(JobFailure::new(
                FailureReason::Cancelled,
                "cancelled before the job started",
            ))
        })?;
        if let Err(e) = failed {
            warn!(job = %id, "Failed to fail the queued job: {e}");
        }
        info!("Cancellation requested");

        Ok(true)
    }

    /// Stop the running members of a batch and keep the rest from starting.
    /// Returns false when the batch coordinator had already finished.
    #[instrument(skip(self), level = "info")]
    pub fn cancel_batch(&self, id: BatchId) -> Result<bool, OrchestratorError> {
        let record = self.registry().batch(id)?;

        let Some(token) = self.inner.batches.lock().get(&id).cloned() else {
            return Ok(false);
        };
        token.cancel();

        for job in self.registry().select(&record.job_ids()) {
            if job.is_terminal() {
                continue;
            }
            if let Err(e) = self.cancel_job(job.id) {
                warn!(job = %job.id, "Failed to cancel batch member: {e}");
            }
        }

        Ok(true)
    }

    /// Block until the job is terminal, `None` waits forever
    pub fn wait_job(&self, id: JobId, timeout: Option<Duration>) -> Result<Job, OrchestratorError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let job = self.get_job(id)?;
            if job.is_terminal() {
                return Ok(job);
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(OrchestratorError::WaitTimeout(format!("job {id}")));
            }

            thread::sleep(WAIT_INTERVAL);
        }
    }

    /// Block until the coordinator of the batch is done, `None` waits forever
    pub fn wait_batch(
        &self,
        id: BatchId,
        timeout: Option<Duration>,
    ) -> Result<BatchSnapshot, OrchestratorError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let coordinating = self.inner.batches.lock().contains_key(&id);
            let snapshot = self.get_batch(id)?;
            if !coordinating {
                return Ok(snapshot);
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return Err(OrchestratorError::WaitTimeout(format!("batch {id}")));
            }

            thread::sleep(WAIT_INTERVAL);
        }
    }
}
