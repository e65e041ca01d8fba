use crate::ingest::{forces::JobResult, ConvergenceHistory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt::{self, Display},
    fs::File,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use uuid::Uuid;

/// Share of the overall progress reached when a status is entered
pub mod progress {
    pub const PREPARING: u8 = 5;
    pub const MESHING: u8 = 10;
    pub const MESHED: u8 = 40;
    pub const SOLVED: u8 = 90;
    pub const POST_PROCESSING: u8 = 95;
    pub const COMPLETE: u8 = 100;

    /// linear interpolation of the solve stage between MESHED and SOLVED
    pub fn solving(iteration: u64, target: u64) -> u8 {
        if target == 0 {
            return MESHED;
        }

        let span = u128::from(SOLVED - MESHED);
        let done = u128::from(iteration.min(target));

        MESHED + (span * done / u128::from(target)) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a job, `Complete` and `Failed` are absorbing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Preparing,
    Meshing,
    Solving,
    PostProcessing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check an edge of the state machine.
    ///
    /// `Preparing -> Solving` is only legal for a job whose mesh was adopted from a batch donor,
    /// and such a job may never enter `Meshing`.
    pub fn can_transition_to(&self, next: JobStatus, mesh: &MeshOrigin) -> bool {
        use JobStatus::*;

        match (self, next) {
            (current, Failed) => !current.is_terminal(),
            (Queued, Preparing)
            | (Solving, PostProcessing)
            | (PostProcessing, Complete) => true,
            (Preparing, Meshing) => !mesh.is_adopted(),
            (Meshing, Solving) => !mesh.is_adopted(),
            (Preparing, Solving) => mesh.is_adopted(),
            _ => false,
        }
    }

    /// progress floor applied when the status is entered
    pub fn progress_floor(&self) -> u8 {
        match self {
            Self::Queued | Self::Failed => 0,
            Self::Preparing => progress::PREPARING,
            Self::Meshing => progress::MESHING,
            Self::Solving => progress::MESHED,
            Self::PostProcessing => progress::POST_PROCESSING,
            Self::Complete => progress::COMPLETE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Meshing => "meshing",
            Self::Solving => "solving",
            Self::PostProcessing => "post-processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Self::Queued,
            "preparing" => Self::Preparing,
            "meshing" => Self::Meshing,
            "solving" => Self::Solving,
            "post-processing" => Self::PostProcessing,
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            other => return Err(JobError::UnknownStatus(other.to_owned())),
        })
    }
}

/// One phase of the pipeline, all but `Prepare` are backed by an engine subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Prepare,
    Mesh,
    Solve,
    PostProcess,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Mesh => "mesh",
            Self::Solve => "solve",
            Self::PostProcess => "post-process",
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Prepare => JobStatus::Preparing,
            Self::Mesh => JobStatus::Meshing,
            Self::Solve => JobStatus::Solving,
            Self::PostProcess => JobStatus::PostProcessing,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the discretization artifact of a job comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MeshOrigin {
    #[default]
    Pending,
    Generated,
    Adopted {
        donor: JobId,
    },
}

impl MeshOrigin {
    pub fn is_adopted(&self) -> bool {
        matches!(self, Self::Adopted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Basic,
    #[default]
    Standard,
    Pro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroundType {
    #[default]
    Moving,
    Slip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    None,
    #[default]
    Mrf,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroundConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: GroundType,
}

impl Default for GroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: GroundType::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AirProperties {
    /// kg/m³
    #[serde(default = "default_density")]
    pub density: f64,
    /// m²/s
    #[serde(default = "default_viscosity")]
    pub kinematic_viscosity: f64,
}

impl Default for AirProperties {
    fn default() -> Self {
        Self {
            density: default_density(),
            kinematic_viscosity: default_viscosity(),
        }
    }
}

/// Immutable parameter snapshot of a job, everything needed to regenerate its case files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,
    pub geometry: PathBuf,
    // filled in by `seal`, compared between batch members before a mesh is reused
    #[serde(default)]
    pub geometry_fingerprint: Option<String>,
    /// m/s
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// yaw angle in degrees
    #[serde(default)]
    pub incidence: f64,
    #[serde(default)]
    pub quality: Quality,
    #[serde(default)]
    pub ground: GroundConfig,
    #[serde(default)]
    pub rotation: Rotation,
    /// m
    #[serde(default = "default_wheel_radius")]
    pub wheel_radius: f64,
    /// m²
    #[serde(default = "default_reference_area")]
    pub reference_area: f64,
    #[serde(default)]
    pub air: AirProperties,
    #[serde(default = "default_target_iterations")]
    pub target_iterations: u64,
    /// named surface regions the engine reports forces for separately
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub gpu_acceleration: bool,
    #[serde(default)]
    pub batch: Option<BatchId>,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Job name must not be empty")]
    EmptyName,
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("Reference area must not be negative, got {0}")]
    NegativeReferenceArea(f64),
    #[error("Target iteration count must be positive")]
    NoIterations,
    #[error("Geometry file {0:?} not found")]
    MissingGeometry(PathBuf),
    #[error("Failed to read geometry file {path:?}: {source}")]
    UnreadableGeometry { path: PathBuf, source: io::Error },
    #[error("Region name {0:?} must be a non-empty identifier")]
    InvalidRegion(String),
    #[error("A sweep needs at least one value")]
    EmptySweep,
    #[error("Sweep value {0} is not a finite number")]
    InvalidSweepValue(f64),
}

impl JobConfig {
    pub fn new(name: impl Into<String>, geometry: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            geometry: geometry.into(),
            geometry_fingerprint: None,
            speed: default_speed(),
            incidence: 0.0,
            quality: Quality::default(),
            ground: GroundConfig::default(),
            rotation: Rotation::default(),
            wheel_radius: default_wheel_radius(),
            reference_area: default_reference_area(),
            air: AirProperties::default(),
            target_iterations: default_target_iterations(),
            regions: Vec::new(),
            gpu_acceleration: false,
            batch: None,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_incidence(mut self, incidence: f64) -> Self {
        self.incidence = incidence;
        self
    }

    pub fn with_reference_area(mut self, area: f64) -> Self {
        self.reference_area = area;
        self
    }

    pub fn with_target_iterations(mut self, iterations: u64) -> Self {
        self.target_iterations = iterations;
        self
    }

    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_gpu(mut self, enabled: bool) -> Self {
        self.gpu_acceleration = enabled;
        self
    }

    /// reject inconsistent parameters before anything touches the disk
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName);
        }

        for (field, value) in [
            ("speed", self.speed),
            ("wheel_radius", self.wheel_radius),
            ("air.density", self.air.density),
            ("air.kinematic_viscosity", self.air.kinematic_viscosity),
        ] {
            if !value.is_finite() {
                return Err(ConfigurationError::NotFinite { field });
            }
            if value <= 0.0 {
                return Err(ConfigurationError::NonPositive { field, value });
            }
        }

        if !self.incidence.is_finite() {
            return Err(ConfigurationError::NotFinite { field: "incidence" });
        }
        if !self.reference_area.is_finite() {
            return Err(ConfigurationError::NotFinite {
                field: "reference_area",
            });
        }
        if self.reference_area < 0.0 {
            return Err(ConfigurationError::NegativeReferenceArea(
                self.reference_area,
            ));
        }
        if self.target_iterations == 0 {
            return Err(ConfigurationError::NoIterations);
        }

        if let Some(region) = self.regions.iter().find(|region| !is_identifier(region)) {
            return Err(ConfigurationError::InvalidRegion(region.clone()));
        }

        if !self.geometry.is_file() {
            return Err(ConfigurationError::MissingGeometry(self.geometry.clone()));
        }

        Ok(())
    }

    /// Validate and record the geometry fingerprint, the result is what gets stored on the job
    pub fn seal(mut self) -> Result<Self, ConfigurationError> {
        self.validate()?;
        self.geometry_fingerprint = Some(fingerprint(&self.geometry)?);

        Ok(self)
    }

    /// angular velocity of the rolling wheel in rad/s
    pub fn omega(&self) -> f64 {
        self.speed / self.wheel_radius
    }

    pub fn reference_length(&self) -> f64 {
        self.wheel_radius * 2.0
    }

    pub fn reynolds(&self) -> f64 {
        self.speed * self.reference_length() / self.air.kinematic_viscosity
    }

    /// q = ½·ρ·U²
    pub fn dynamic_pressure(&self) -> f64 {
        0.5 * self.air.density * self.speed * self.speed
    }

    pub fn drag_axis(&self) -> [f64; 3] {
        let yaw = self.incidence.to_radians();
        [yaw.cos(), yaw.sin(), 0.0]
    }

    pub fn side_axis(&self) -> [f64; 3] {
        let yaw = self.incidence.to_radians();
        [-yaw.sin(), yaw.cos(), 0.0]
    }

    pub fn lift_axis(&self) -> [f64; 3] {
        [0.0, 0.0, 1.0]
    }

    /// inflow velocity vector in m/s
    pub fn inflow(&self) -> [f64; 3] {
        self.drag_axis().map(|component| component * self.speed)
    }

    /// true if both configurations refer to the same geometry content
    pub fn same_geometry(&self, other: &JobConfig) -> bool {
        match (&self.geometry_fingerprint, &other.geometry_fingerprint) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => false,
        }
    }
}

/// SHA-256 over the geometry file contents
pub fn fingerprint(path: &Path) -> Result<String, ConfigurationError> {
    let unreadable = |source| ConfigurationError::UnreadableGeometry {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(unreadable)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(unreadable)?;

    Ok(format!("{:x}", hasher.finalize()))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// machine usable classification of a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    StageFailed,
    StageTimeout,
    Cancelled,
    WorkspaceError,
    ResultsUnavailable,
    Interrupted,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageFailed => "stage failed",
            Self::StageTimeout => "stage timeout",
            Self::Cancelled => "cancelled",
            Self::WorkspaceError => "workspace error",
            Self::ResultsUnavailable => "results unavailable",
            Self::Interrupted => "interrupted",
        }
    }
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub stage: Option<Stage>,
    pub detail: String,
    /// full log of the failing stage
    pub log_path: Option<PathBuf>,
}

impl JobFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            stage: None,
            detail: detail.into(),
            log_path: None,
        }
    }

    pub fn in_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "{} in {stage}: {}", self.reason, self.detail)?,
            None => write!(f, "{}: {}", self.reason, self.detail)?,
        }
        if let Some(ref path) = self.log_path {
            write!(f, " (log: {})", path.display())?;
        }

        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JobError {
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Job is already {0}")]
    Terminal(JobStatus),
    #[error("Unknown job status {0:?}")]
    UnknownStatus(String),
}

/// One simulation attempt as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub config: JobConfig,
    pub status: JobStatus,
    pub progress: u8,
    pub result: Option<JobResult>,
    #[serde(default)]
    pub convergence: ConvergenceHistory,
    pub error: Option<JobFailure>,
    #[serde(default)]
    pub mesh: MeshOrigin,
    pub workspace: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(config: JobConfig) -> Self {
        let now = Utc::now();

        Self {
            id: JobId::new(),
            name: config.name.clone(),
            config,
            status: JobStatus::Queued,
            progress: 0,
            result: None,
            convergence: ConvergenceHistory::default(),
            error: None,
            mesh: MeshOrigin::Pending,
            workspace: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move along one edge of the state machine. Failing and completing have their own entry
    /// points since they carry data that must land together with the status.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), JobError> {
        if matches!(next, JobStatus::Complete | JobStatus::Failed) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.check_edge(next)?;

        self.status = next;
        self.raise_progress(next.progress_floor());
        self.touch();

        Ok(())
    }

    /// progress never moves backwards
    pub fn raise_progress(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(progress::COMPLETE));
    }

    pub fn complete(&mut self, result: JobResult) -> Result<(), JobError> {
        self.check_edge(JobStatus::Complete)?;

        self.result = Some(result);
        self.status = JobStatus::Complete;
        self.progress = progress::COMPLETE;
        self.touch();

        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure) -> Result<(), JobError> {
        self.check_edge(JobStatus::Failed)?;

        self.error = Some(failure);
        self.status = JobStatus::Failed;
        self.touch();

        Ok(())
    }

    fn check_edge(&self, next: JobStatus) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::Terminal(self.status));
        }
        if !self.status.can_transition_to(next, &self.mesh) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_speed() -> f64 {
    13.9
}

fn default_density() -> f64 {
    1.225
}

fn default_viscosity() -> f64 {
    1.48e-5
}

fn default_wheel_radius() -> f64 {
    0.325
}

fn default_reference_area() -> f64 {
    0.0225
}

fn default_target_iterations() -> u64 {
    500
}

#[cfg(test)]
#[path = "job_test.rs"]
mod job_test;
