use crate::{
    executors::CancelToken,
    job::{BatchId, ConfigurationError, FailureReason, Job, JobConfig, JobFailure, JobId, JobStatus},
    pipeline::MeshSource,
    registry::JobRegistry,
    workspace::WorkspaceManager,
};
use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use tracing::{info, instrument, warn};

/// The scalar varied across the members of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepParameter {
    #[default]
    Incidence,
    Speed,
}

impl SweepParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incidence => "incidence",
            Self::Speed => "speed",
        }
    }

    fn apply(&self, config: JobConfig, value: f64) -> JobConfig {
        match self {
            Self::Incidence => config.with_incidence(value),
            Self::Speed => config.with_speed(value),
        }
    }

    fn label(&self, value: f64) -> String {
        match self {
            Self::Incidence => format!("yaw {value}°"),
            Self::Speed => format!("{value} m/s"),
        }
    }
}

impl Display for SweepParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub parameter: SweepParameter,
    pub values: Vec<f64>,
}

impl Sweep {
    pub fn incidence(values: impl Into<Vec<f64>>) -> Self {
        Self {
            parameter: SweepParameter::Incidence,
            values: values.into(),
        }
    }

    pub fn speed(values: impl Into<Vec<f64>>) -> Self {
        Self {
            parameter: SweepParameter::Speed,
            values: values.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.values.is_empty() {
            return Err(ConfigurationError::EmptySweep);
        }
        if let Some(value) = self.values.iter().find(|value| !value.is_finite()) {
            return Err(ConfigurationError::InvalidSweepValue(*value));
        }

        Ok(())
    }

    /// one configuration per sweep value, in sweep order
    pub fn configs(&self, base: &JobConfig, batch: BatchId) -> Vec<JobConfig> {
        self.values
            .iter()
            .map(|value| {
                let mut config = self.parameter.apply(base.clone(), *value);
                config.name = format!("{} ({})", base.name, self.parameter.label(*value));
                config.batch = Some(batch);
                config
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchMember {
    pub job: JobId,
    pub value: f64,
}

/// Ordered group of jobs sharing one geometry, the first member is the mesh donor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub name: String,
    pub parameter: SweepParameter,
    pub members: Vec<BatchMember>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(id: BatchId, name: impl Into<String>, parameter: SweepParameter) -> Self {
        Self {
            id,
            name: name.into(),
            parameter,
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn donor(&self) -> Option<JobId> {
        self.members.first().map(|member| member.job)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.members.iter().map(|member| member.job).collect()
    }

    pub fn remove_member(&mut self, job: JobId) {
        self.members.retain(|member| member.job != job);
    }
}

/// Aggregate state of a batch, displayed as `running_<i>_of_<n>`, `complete` or `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum BatchStatus {
    Running { current: usize, total: usize },
    Complete,
    Failed,
}

impl BatchStatus {
    /// Derive the batch state from its members, donor first.
    ///
    /// A failed donor fails the batch right away since the dependents will never start. Otherwise
    /// the batch runs until every member is terminal and fails if any of them did.
    pub fn of(members: &[Job]) -> Self {
        let total = members.len();

        if members
            .first()
            .map_or(false, |donor| donor.status == JobStatus::Failed)
        {
            return Self::Failed;
        }

        let finished = members.iter().filter(|job| job.is_terminal()).count();
        if finished < total {
            return Self::Running {
                current: finished + 1,
                total,
            };
        }

        if members.iter().any(|job| job.status == JobStatus::Failed) {
            Self::Failed
        } else {
            Self::Complete
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running { .. })
    }
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { current, total } => write!(f, "running_{current}_of_{total}"),
            Self::Complete => f.write_str("complete"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

impl From<BatchStatus> for String {
    fn from(status: BatchStatus) -> Self {
        status.to_string()
    }
}

/// What `get-batch` hands out
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub name: String,
    pub parameter: SweepParameter,
    pub status: BatchStatus,
    pub members: Vec<JobId>,
    pub created_at: DateTime<Utc>,
}

impl BatchSnapshot {
    pub fn new(record: &BatchRecord, members: &[Job]) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            parameter: record.parameter,
            status: BatchStatus::of(members),
            members: record.job_ids(),
            created_at: record.created_at,
        }
    }
}

/// One row of the batch result table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberResult {
    pub job: JobId,
    pub name: String,
    pub value: f64,
    pub status: JobStatus,
    #[serde(rename = "Cd")]
    pub cd: Option<f64>,
    #[serde(rename = "Cl")]
    pub cl: Option<f64>,
    #[serde(rename = "Cs")]
    pub cs: Option<f64>,
    #[serde(rename = "Cm")]
    pub cm: Option<f64>,
    pub drag_n: Option<f64>,
    pub lift_n: Option<f64>,
    pub side_n: Option<f64>,
    #[serde(rename = "CdA_m2")]
    pub cda_m2: Option<f64>,
    pub error: Option<String>,
}

/// Aggregated results of all members of a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch: BatchId,
    pub name: String,
    pub parameter: SweepParameter,
    pub status: BatchStatus,
    pub members: Vec<MemberResult>,
    #[serde(rename = "avg_Cd")]
    pub avg_cd: Option<f64>,
    pub avg_drag_n: Option<f64>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

impl BatchSummary {
    pub fn new(record: &BatchRecord, jobs: &[Job]) -> Self {
        let members = record
            .members
            .iter()
            .filter_map(|member| {
                let job = jobs.iter().find(|job| job.id == member.job)?;
                let result = job.result.as_ref();
                let coefficients = result.and_then(|result| result.coefficients.available());

                Some(MemberResult {
                    job: job.id,
                    name: job.name.clone(),
                    value: member.value,
                    status: job.status,
                    cd: coefficients.map(|c| c.cd),
                    cl: coefficients.map(|c| c.cl),
                    cs: coefficients.map(|c| c.cs),
                    cm: coefficients.and_then(|c| c.cm),
                    drag_n: result.map(|result| result.forces.drag),
                    lift_n: result.map(|result| result.forces.lift),
                    side_n: result.map(|result| result.forces.side),
                    cda_m2: result
                        .and_then(|result| result.drag_area)
                        .map(|area| area.m2),
                    error: job.error.as_ref().map(ToString::to_string),
                })
            })
            .collect_vec();

        Self {
            batch: record.id,
            name: record.name.clone(),
            parameter: record.parameter,
            status: BatchStatus::of(jobs),
            avg_cd: mean(members.iter().filter_map(|member| member.cd)),
            avg_drag_n: mean(members.iter().filter_map(|member| member.drag_n)),
            completed: members
                .iter()
                .filter(|member| member.status == JobStatus::Complete)
                .count(),
            failed: members
                .iter()
                .filter(|member| member.status == JobStatus::Failed)
                .count(),
            total: members.len(),
            members,
        }
    }
}

/// Starts job pipelines somewhere else and reports their final state
pub trait JobLauncher: Send + Sync {
    fn launch(&self, id: JobId, source: MeshSource) -> Receiver<JobStatus>;

    /// `id` will not be launched by this batch, whatever was kept for it can go
    fn release(&self, _id: JobId) {}
}

/// Runs the donor of a batch, then every dependent on the donor's mesh
pub struct BatchCoordinator<'a> {
    pub registry: &'a JobRegistry,
    pub workspaces: &'a WorkspaceManager,
    pub launcher: &'a dyn JobLauncher,
    pub cancel: CancelToken,
}

impl BatchCoordinator<'_> {
    fn wait(&self, id: JobId, receiver: Receiver<JobStatus>) -> JobStatus {
        receiver.recv().unwrap_or_else(|_| {
            warn!(job = %id, "Job task ended without reporting a status");
            self.registry
                .get(id)
                .map(|job| job.status)
                .unwrap_or(JobStatus::Failed)
        })
    }

    /// fail every member that has not left `queued` yet
    fn cancel_unstarted(&self, members: &[JobId]) {
        for id in members {
            let cancelled = self.registry.update(*id, |job| {
                if job.status != JobStatus::Queued {
                    return Ok(());
                }
                job.fail(JobFailure::new(
                    FailureReason::Cancelled,
                    "batch cancelled before the job started",
                ))
            });

            match cancelled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(job = %id, "Failed to cancel unstarted member: {e}"),
                Err(e) => warn!(job = %id, "Failed to cancel unstarted member: {e}"),
            }
            self.launcher.release(*id);
        }
    }

    #[instrument(skip_all, level = "info", fields(batch = %batch.id))]
    pub fn run(&self, batch: &BatchRecord) -> BatchStatus {
        let members = batch.job_ids();
        let Some((donor, dependents)) = members.split_first() else {
            return BatchStatus::Complete;
        };

        if self.cancel.is_cancelled() {
            self.cancel_unstarted(&members);
            return self.status(&members);
        }

        info!(donor = %donor, dependents = dependents.len(), "Running mesh donor");
        let donor_status = self.wait(*donor, self.launcher.launch(*donor, MeshSource::Generate));

        if donor_status != JobStatus::Complete {
            warn!(donor = %donor, status = %donor_status, "Mesh donor did not complete, dependents stay queued");
            if self.cancel.is_cancelled() {
                self.cancel_unstarted(dependents);
            } else {
                for id in dependents {
                    self.launcher.release(*id);
                }
            }
            return self.status(&members);
        }

        let donor_job = match self.registry.get(*donor) {
            Ok(job) => job,
            Err(e) => {
                warn!(donor = %donor, "Mesh donor vanished: {e}");
                for id in dependents {
                    self.launcher.release(*id);
                }
                return self.status(&members);
            }
        };
        let donor_workspace = self.workspaces.workspace(*donor);

        let mut running = Vec::with_capacity(dependents.len());
        for (index, id) in dependents.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.cancel_unstarted(&dependents[index..]);
                break;
            }

            let source = match self.registry.get(*id) {
                Ok(job) if job.config.same_geometry(&donor_job.config) => MeshSource::Adopt {
                    donor: *donor,
                    from: donor_workspace.clone(),
                },
                Ok(_) => {
                    warn!(job = %id, "Geometry differs from the mesh donor, meshing on its own");
                    MeshSource::Generate
                }
                // deleted while waiting for the donor
                Err(_) => continue,
            };

            running.push((*id, self.launcher.launch(*id, source)));
        }

        for (id, receiver) in running {
            let status = self.wait(id, receiver);
            info!(job = %id, status = %status, "Batch member finished");
        }

        let status = self.status(&members);
        info!(status = %status, "Batch finished");

        status
    }

    fn status(&self, members: &[JobId]) -> BatchStatus {
        BatchStatus::of(&self.registry.select(members))
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod batch_test;
