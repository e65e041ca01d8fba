use crate::job::Stage;
use globset::GlobBuilder;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("File {0:?} not found")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

/// Top level configuration of the runner, usually loaded from `wheelflow.yaml`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    /// Directory holding one case directory per job
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Upper bound for concurrently running job pipelines, 0 selects the number of CPUs
    #[serde(default)]
    pub max_concurrent_jobs: usize,
    /// Cadence of subprocess supervision and solver output polling
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Retained convergence samples per job before thinning kicks in, 0 disables thinning
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Lines of the stage log attached to a failed job
    #[serde(default = "default_log_tail")]
    pub log_tail_lines: usize,
    /// Time between SIGTERM and SIGKILL when a stage is stopped
    #[serde(default = "default_grace")]
    pub termination_grace_ms: u64,

    #[serde(default, alias = "db")]
    pub database: Option<DatabaseConfig>,

    pub engine: EngineConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

/// The external engine, one command per stage
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub mesh: StageCommand,
    pub solve: StageCommand,
    pub post_process: StageCommand,
    /// extra environment for every stage
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub output: OutputLayout,
}

impl EngineConfig {
    pub fn command(&self, stage: Stage) -> Option<&StageCommand> {
        match stage {
            Stage::Prepare => None,
            Stage::Mesh => Some(&self.mesh),
            Stage::Solve => Some(&self.solve),
            Stage::PostProcess => Some(&self.post_process),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageCommand {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    /// Maximum wall clock time in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// stdout markers reported as stage sub-events
    #[serde(default)]
    pub events: Vec<EventMarker>,
}

impl StageCommand {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EventMarker {
    /// substring looked for in each stdout line
    pub marker: String,
    pub name: String,
    /// overall job progress once the event was seen
    #[serde(default)]
    pub progress: Option<u8>,
}

/// Solve stage additions when a job requests the GPU linear solver
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct GpuConfig {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Files the solver writes below `solver-output/`
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OutputLayout {
    #[serde(default = "default_coefficients")]
    pub coefficients: PathBuf,
    #[serde(default = "default_forces")]
    pub forces: PathBuf,
    #[serde(default = "default_moments")]
    pub moments: PathBuf,
    /// glob of per-region force files, `*` stands for the region name
    #[serde(default = "default_regions")]
    pub regions: String,
    /// value columns of the coefficient file when it carries no header
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            coefficients: default_coefficients(),
            forces: default_forces(),
            moments: default_moments(),
            regions: default_regions(),
            fields: default_fields(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn worker_threads(&self) -> usize {
        if self.max_concurrent_jobs == 0 {
            num_cpus::get()
        } else {
            self.max_concurrent_jobs
        }
    }

    /// Check everything that can be checked before the first job runs. Every problem is logged,
    /// the return value tells whether any of them was an error.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for (name, command) in [
            ("mesh", &self.engine.mesh),
            ("solve", &self.engine.solve),
            ("post_process", &self.engine.post_process),
        ] {
            match check_executable(&command.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "engine.{name}.exec ({}) is not executable",
                        command.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to find engine.{name}.exec ({}): {e}",
                        command.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if command.timeout == Some(0) {
                error!("engine.{name}.timeout cannot be 0, leave it out to disable the timeout");
                contains_error = true;
            }

            for event in command.events.iter() {
                if event.marker.trim().is_empty() {
                    error!("engine.{name}.events.{} has an empty marker", event.name);
                    contains_error = true;
                }
                if event.progress.map_or(false, |progress| progress > 100) {
                    error!(
                        "engine.{name}.events.{}.progress must be within 0..=100",
                        event.name
                    );
                    contains_error = true;
                }
            }
        }

        if let Err(e) = GlobBuilder::new(&self.engine.output.regions).build() {
            error!(
                "engine.output.regions ({}) is not a valid glob: {e}",
                self.engine.output.regions
            );
            contains_error = true;
        }
        if self.engine.output.regions.matches('*').count() != 1 {
            warn!("engine.output.regions should contain exactly one '*' standing for the region name");
        }

        if self.engine.output.fields.is_empty() {
            error!("engine.output.fields cannot be empty, at least the drag coefficient is needed");
            contains_error = true;
        } else if !self.engine.output.fields.iter().any(|field| field == "Cd") {
            warn!("engine.output.fields contains no 'Cd' column");
        }

        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms is 0, falling back to 1ms");
        }

        if self.workspace_root.exists() && !self.workspace_root.is_dir() {
            error!(
                "workspace_root ({}) exists but is not a directory",
                self.workspace_root.to_string_lossy()
            );
            contains_error = true;
        }

        contains_error
    }
}

static DEFAULT_FIELDS: Lazy<Vec<String>> =
    Lazy::new(|| ["Cm", "Cd", "Cl"].into_iter().map(String::from).collect());

fn default_workspace_root() -> PathBuf {
    PathBuf::from("cases")
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_history_limit() -> usize {
    crate::ingest::DEFAULT_HISTORY_LIMIT
}

fn default_log_tail() -> usize {
    20
}

fn default_grace() -> u64 {
    2000
}

fn default_database_path() -> PathBuf {
    PathBuf::from("wheelflow.db")
}

fn default_coefficients() -> PathBuf {
    PathBuf::from("forceCoeffs.dat")
}

fn default_forces() -> PathBuf {
    PathBuf::from("forces.dat")
}

fn default_moments() -> PathBuf {
    PathBuf::from("moments.dat")
}

fn default_regions() -> String {
    String::from("forces_*.dat")
}

fn default_fields() -> Vec<String> {
    DEFAULT_FIELDS.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn yaml(dir: &Path, solve_mode: u32) -> String {
        let mesh = script(dir, "mesh.sh", 0o755);
        let solve = script(dir, "solve.sh", solve_mode);
        let post = script(dir, "post.sh", 0o755);

        format!(
            "workspace_root: {root}
max_concurrent_jobs: 2
engine:
  mesh:
    exec: {mesh}
    timeout: 600
    events:
      - marker: Finished meshing
        name: meshed
        progress: 35
  solve:
    exec: {solve}
    params: [-solver, incompressibleFluid]
  post_process:
    exec: {post}
",
            root = dir.join("cases").display(),
            mesh = mesh.display(),
            solve = solve.display(),
            post = post.display(),
        )
    }

    #[test]
    fn parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: RunnerConfig = serde_yaml::from_str(&yaml(dir.path(), 0o755)).unwrap();

        assert_eq!(config.worker_threads(), 2);
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.engine.output.fields, vec!["Cm", "Cd", "Cl"]);
        assert_eq!(config.engine.mesh.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.engine.solve.timeout(), None);
        assert_eq!(config.engine.mesh.events[0].progress, Some(35));
        assert!(config.database.is_none());
        assert!(!config.preflight_checks());
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let content = yaml(dir.path(), 0o755) + "unknown: 1\n";

        assert!(serde_yaml::from_str::<RunnerConfig>(&content).is_err());
    }

    #[test]
    fn preflight_flags_non_executable_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config: RunnerConfig = serde_yaml::from_str(&yaml(dir.path(), 0o644)).unwrap();

        assert!(config.preflight_checks());
        assert!(!check_executable(&config.engine.solve.exec).unwrap());
        assert!(matches!(
            check_executable(&dir.path().join("missing")),
            Err(ConfigErrors::FileNotFound(_))
        ));
    }

    #[test]
    fn invalid_region_glob_fails_preflight_not_loading() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: RunnerConfig = serde_yaml::from_str(&yaml(dir.path(), 0o755)).unwrap();
        config.engine.output.regions = "forces_[*.dat".to_owned();

        assert!(config.preflight_checks());
    }
}
