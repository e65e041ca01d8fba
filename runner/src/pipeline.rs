use crate::{
    case,
    config::EngineConfig,
    executors::{
        log_tail, CancelToken, Executor, StageEvent, StageMonitor, StageRequest, StageStatus,
    },
    ingest::{forces, CoefficientTail},
    job::{
        progress, FailureReason, JobConfig, JobError, JobFailure, JobId, JobStatus, MeshOrigin,
        Stage,
    },
    registry::{JobRegistry, RegistryError},
    workspace::{copy_artifact, Workspace, WorkspaceManager},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Stages backed by an engine subprocess, in execution order
const ENGINE_STAGES: [Stage; 3] = [Stage::Mesh, Stage::Solve, Stage::PostProcess];

/// window and tolerance of the drag coefficient used to flag a run as converged
const SETTLED_WINDOW: usize = 50;
const SETTLED_TOLERANCE: f64 = 0.01;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Cannot resume a job at the {0} stage")]
    NotResumable(Stage),
}

/// Where a job gets its discretization artifact from
#[derive(Debug, Clone)]
pub enum MeshSource {
    /// run the mesh stage
    Generate,
    /// copy the artifact of a completed donor, falling back to `Generate` if that fails
    Adopt { donor: JobId, from: Workspace },
}

/// Drives jobs through their stages. The pipeline is the only writer of a job while it runs.
pub struct JobPipeline {
    registry: Arc<JobRegistry>,
    workspaces: WorkspaceManager,
    engine: EngineConfig,
    executor: Arc<dyn Executor>,
    log_tail_lines: usize,
}

/// Feeds stage progress and solver output into the registry while a stage runs
struct StageProgress<'a> {
    registry: &'a JobRegistry,
    id: JobId,
    target: u64,
    tail: Option<CoefficientTail>,
}

impl StageProgress<'_> {
    fn ingest(&mut self, finished: bool) {
        let Some(ref mut tail) = self.tail else {
            return;
        };

        let samples = match if finished { tail.finish() } else { tail.poll() } {
            Ok(samples) => samples,
            Err(e) => {
                // the next poll gets another chance
                warn!(job = %self.id, "Failed to read solver output: {e}");
                return;
            }
        };
        if samples.is_empty() {
            return;
        }

        let fields = tail.fields().to_vec();
        let target = self.target;

        let update = self.registry.update(self.id, |job| {
            job.convergence.set_fields(&fields);
            let accepted = samples
                .into_iter()
                .filter(|sample| job.convergence.push(sample.clone()))
                .count();

            if let Some(latest) = job.convergence.latest() {
                let reached = progress::solving(latest.iteration, target);
                job.raise_progress(reached);
            }
            job.touch();

            accepted
        });

        match update {
            Ok(accepted) => debug!(job = %self.id, accepted, "Ingested convergence samples"),
            Err(e) => warn!(job = %self.id, "Failed to record convergence samples: {e}"),
        }
    }
}

impl StageMonitor for StageProgress<'_> {
    fn on_event(&mut self, stage: Stage, event: &StageEvent) {
        info!(job = %self.id, stage = %stage, event = %event.name, "Stage reported progress");

        if let Some(progress) = event.progress {
            if let Err(e) = self.registry.update(self.id, |job| job.raise_progress(progress)) {
                warn!(job = %self.id, "Failed to record stage event: {e}");
            }
        }
    }

    fn on_tick(&mut self, _stage: Stage) {
        self.ingest(false);
    }
}

impl JobPipeline {
    pub fn new(
        registry: Arc<JobRegistry>,
        workspaces: WorkspaceManager,
        engine: EngineConfig,
        executor: Arc<dyn Executor>,
        log_tail_lines: usize,
    ) -> Self {
        Self {
            registry,
            workspaces,
            engine,
            executor,
            log_tail_lines,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Run a queued job to a terminal state and return that state.
    ///
    /// Failures of the job itself are recorded on the job, errors are reserved for jobs that are
    /// unknown to the registry.
    #[instrument(skip(self, source, cancel), level = "info")]
    pub fn run(
        &self,
        id: JobId,
        source: MeshSource,
        cancel: &CancelToken,
    ) -> Result<JobStatus, PipelineError> {
        let job = self.registry.get(id)?;
        if job.is_terminal() {
            debug!(job = %id, status = %job.status, "Job finished before it was started");
            return Ok(job.status);
        }
        if cancel.is_cancelled() {
            return self.fail(
                id,
                JobFailure::new(FailureReason::Cancelled, "cancelled before start"),
            );
        }

        if let Some(status) = self.advance(id, JobStatus::Preparing)? {
            return Ok(status);
        }
        info!(job = %id, name = %job.name, "Preparing case");

        let (workspace, adopted) = match self.prepare(id, &job.config, source) {
            Ok(prepared) => prepared,
            Err(failure) => return self.fail(id, failure),
        };
        debug!(job = %id, path = ?workspace.root(), adopted, "Case prepared");

        self.resume(id, if adopted { Stage::Solve } else { Stage::Mesh }, cancel)
    }

    /// Continue a prepared job at `from`, running every later stage as well.
    pub fn resume(
        &self,
        id: JobId,
        from: Stage,
        cancel: &CancelToken,
    ) -> Result<JobStatus, PipelineError> {
        if from == Stage::Prepare {
            return Err(PipelineError::NotResumable(from));
        }

        let job = self.registry.get(id)?;
        let workspace = self.workspaces.workspace(id);

        for stage in ENGINE_STAGES.into_iter().skip_while(|stage| *stage != from) {
            if cancel.is_cancelled() {
                return self.fail(
                    id,
                    JobFailure::new(FailureReason::Cancelled, "cancelled between stages")
                        .in_stage(stage),
                );
            }

            if let Some(status) = self.advance(id, stage.status())? {
                return Ok(status);
            }

            if let Err(failure) = self.run_stage(id, stage, &workspace, &job.config, cancel) {
                return self.fail(id, failure);
            }

            self.registry.update(id, |job| match stage {
                Stage::Mesh => {
                    job.mesh = MeshOrigin::Generated;
                    job.raise_progress(progress::MESHED);
                    job.touch();
                }
                Stage::Solve => {
                    job.raise_progress(progress::SOLVED);
                    job.touch();
                }
                _ => {}
            })?;
        }

        self.finish(id, &workspace)
    }

    /// Move to `next`. Returns the state of the job if someone else already finished it.
    fn advance(&self, id: JobId, next: JobStatus) -> Result<Option<JobStatus>, PipelineError> {
        match self.registry.update(id, |job| job.transition(next))? {
            Ok(()) => Ok(None),
            Err(JobError::Terminal(status)) => Ok(Some(status)),
            Err(e) => Err(e.into()),
        }
    }

    fn prepare(
        &self,
        id: JobId,
        config: &JobConfig,
        source: MeshSource,
    ) -> Result<(Workspace, bool), JobFailure> {
        let workspace_failure = |detail: String| {
            JobFailure::new(FailureReason::WorkspaceError, detail).in_stage(Stage::Prepare)
        };

        let workspace = self
            .workspaces
            .create_workspace(id)
            .map_err(|e| workspace_failure(e.to_string()))?;
        self.registry
            .update(id, |job| job.workspace = Some(workspace.root().to_path_buf()))
            .map_err(|e| workspace_failure(e.to_string()))?;

        let adopted = match source {
            MeshSource::Generate => false,
            MeshSource::Adopt { donor, from } => match copy_artifact(&from, &workspace) {
                Ok(report) => {
                    info!(job = %id, donor = %donor, files = report.files, "Adopted donor mesh");
                    self.registry
                        .update(id, |job| {
                            job.mesh = MeshOrigin::Adopted { donor };
                            job.touch();
                        })
                        .map_err(|e| workspace_failure(e.to_string()))?;
                    true
                }
                Err(e) => {
                    warn!(job = %id, donor = %donor, "Failed to adopt donor mesh, meshing on our own: {e}");
                    false
                }
            },
        };

        if !adopted {
            case::write_mesh_config(&workspace, config)
                .map_err(|e| workspace_failure(e.to_string()))?;
        }
        case::write_flow_config(&workspace, config)
            .map_err(|e| workspace_failure(e.to_string()))?;

        Ok((workspace, adopted))
    }

    fn request(
        &self,
        stage: Stage,
        workspace: &Workspace,
        config: &JobConfig,
        cancel: &CancelToken,
    ) -> Option<StageRequest> {
        let command = self.engine.command(stage)?;

        let mut args = command.params.clone();
        let mut env = self.engine.env.clone();
        env.insert(
            String::from("WHEELFLOW_CASE"),
            workspace.root().to_string_lossy().into_owned(),
        );
        env.insert(String::from("WHEELFLOW_STAGE"), stage.name().to_owned());

        if stage == Stage::Solve && config.gpu_acceleration {
            args.extend(self.engine.gpu.params.iter().cloned());
            env.extend(self.engine.gpu.env.clone());
        }

        Some(StageRequest {
            stage,
            exec: command.exec.clone(),
            args,
            env,
            workdir: workspace.root().to_path_buf(),
            log: workspace.stage_log(stage),
            timeout: command.timeout(),
            events: command.events.clone(),
            cancel: cancel.clone(),
        })
    }

    #[instrument(skip(self, workspace, config, cancel), level = "info")]
    fn run_stage(
        &self,
        id: JobId,
        stage: Stage,
        workspace: &Workspace,
        config: &JobConfig,
        cancel: &CancelToken,
    ) -> Result<(), JobFailure> {
        let Some(request) = self.request(stage, workspace, config, cancel) else {
            return Ok(());
        };

        let mut monitor = StageProgress {
            registry: &self.registry,
            id,
            target: config.target_iterations,
            tail: (stage == Stage::Solve).then(|| {
                CoefficientTail::new(
                    workspace.output_dir().join(&self.engine.output.coefficients),
                    &self.engine.output.fields,
                )
            }),
        };

        info!(job = %id, stage = %stage, "Starting stage");
        let outcome = self.executor.run(&request, &mut monitor);

        if stage == Stage::Solve {
            // whatever the solver managed to write is kept, nothing arrives afterwards
            monitor.ingest(true);
            if let Err(e) = self.registry.update(id, |job| job.convergence.freeze()) {
                warn!(job = %id, "Failed to freeze convergence history: {e}");
            }
        }

        let outcome = outcome.map_err(|e| {
            JobFailure::new(FailureReason::StageFailed, e.to_string())
                .in_stage(stage)
                .with_log(&request.log)
        })?;

        let tail = || log_tail(&outcome.log, self.log_tail_lines);
        let failure = match outcome.status {
            StageStatus::Succeeded => {
                info!(job = %id, stage = %stage, ms = %outcome.duration_ms(), "Stage finished");
                return Ok(());
            }
            StageStatus::Failed(Some(code)) => JobFailure::new(
                FailureReason::StageFailed,
                format!("exited with code {code}\n{}", tail()),
            ),
            StageStatus::Failed(None) => JobFailure::new(
                FailureReason::StageFailed,
                format!("terminated by a signal\n{}", tail()),
            ),
            StageStatus::TimedOut => JobFailure::new(
                FailureReason::StageTimeout,
                format!(
                    "exceeded its timeout of {}s\n{}",
                    request.timeout.unwrap_or_default().as_secs(),
                    tail()
                ),
            ),
            StageStatus::Cancelled => {
                JobFailure::new(FailureReason::Cancelled, "cancelled while running")
            }
        };

        Err(failure.in_stage(stage).with_log(outcome.log))
    }

    fn finish(&self, id: JobId, workspace: &Workspace) -> Result<JobStatus, PipelineError> {
        let config = self.registry.get(id)?.config;

        let mut result =
            match forces::extract(&workspace.output_dir(), &self.engine.output, &config) {
                Ok(result) => result,
                Err(e) => {
                    return self.fail(
                        id,
                        JobFailure::new(FailureReason::ResultsUnavailable, e.to_string())
                            .in_stage(Stage::PostProcess),
                    )
                }
            };

        if let Some(coefficients) = result.coefficients.available() {
            info!(job = %id, cd = coefficients.cd, cl = coefficients.cl, "Job complete");
        } else {
            info!(job = %id, drag = result.forces.drag, "Job complete without coefficients");
        }

        let completed = self.registry.update(id, |job| {
            result.converged =
                job.convergence
                    .is_settled("Cd", SETTLED_WINDOW, SETTLED_TOLERANCE);
            job.complete(result)
        })?;

        match completed {
            Ok(()) => Ok(JobStatus::Complete),
            Err(JobError::Terminal(status)) => Ok(status),
            Err(e) => Err(e.into()),
        }
    }

    fn fail(&self, id: JobId, failure: JobFailure) -> Result<JobStatus, PipelineError> {
        error!(job = %id, reason = %failure.reason, "Job failed: {}", failure.detail);

        match self.registry.update(id, |job| job.fail(failure))? {
            Ok(()) => Ok(JobStatus::Failed),
            Err(JobError::Terminal(status)) => Ok(status),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
