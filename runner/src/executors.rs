pub mod local;

use crate::{config::EventMarker, job::Stage};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;

pub use local::LocalExecutor;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {exec:?}: {source}")]
    Spawn {
        exec: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open stage log {path:?}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for the stage process: {0}")]
    Wait(#[source] io::Error),
    #[error("Failed to signal the stage process: {0}")]
    Signal(#[from] nix::Error),
}

/// Shared flag a running stage checks between wait slices
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything needed to launch one external stage
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: Stage,
    pub exec: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// case directory, used as working directory of the subprocess
    pub workdir: PathBuf,
    /// stdout and stderr end up here as they are produced
    pub log: PathBuf,
    pub timeout: Option<Duration>,
    pub events: Vec<EventMarker>,
    pub cancel: CancelToken,
}

/// A configured stdout marker that was seen while the stage ran
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub name: String,
    pub progress: Option<u8>,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    /// non-zero exit, `None` if the process was killed by a signal
    Failed(Option<i32>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub log: PathBuf,
    pub duration: Duration,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

/// Hooks invoked by an executor while a stage runs
pub trait StageMonitor {
    fn on_event(&mut self, _stage: Stage, _event: &StageEvent) {}

    /// called once per poll interval while the subprocess is alive
    fn on_tick(&mut self, _stage: Stage) {}
}

/// Monitor that ignores everything
pub struct Unmonitored;

impl StageMonitor for Unmonitored {}

/// Runs a single external stage to completion. Implementations never retry and guarantee the
/// subprocess is gone once `run` returns.
pub trait Executor: Send + Sync {
    fn run(
        &self,
        request: &StageRequest,
        monitor: &mut dyn StageMonitor,
    ) -> Result<StageOutcome, ExecutorError>;
}

/// last `lines` lines of a stage log, empty if the log cannot be read
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(file) = File::open(path) else {
        return String::new();
    };

    let all = BufReader::new(file)
        .split(b'\n')
        .filter_map(Result::ok)
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect::<Vec<_>>();

    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solve.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();

        assert_eq!(log_tail(&path, 2), "c\nd");
        assert_eq!(log_tail(&path, 10), "a\nb\nc\nd");
        assert_eq!(log_tail(&dir.path().join("absent.log"), 2), "");
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
