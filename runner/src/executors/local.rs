use super::{
    Executor, ExecutorError, StageEvent, StageMonitor, StageOutcome, StageRequest, StageStatus,
};
use crate::config::{EventMarker, RunnerConfig};
use crossbeam_channel::Sender;
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    fs::{self, File},
    io::{BufRead, BufReader, Read, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// Executor running stages as child processes of this process
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    poll_interval: Duration,
    grace: Duration,
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl LocalExecutor {
    pub fn new(poll_interval: Duration, grace: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            grace,
        }
    }

    pub fn load(config: &RunnerConfig) -> Self {
        Self::new(config.poll_interval(), config.termination_grace())
    }

    /// SIGTERM the whole process group, SIGKILL whatever is left after the grace period
    fn terminate(&self, child: &mut Child, group: Pid) -> Result<ExitStatus, ExecutorError> {
        signal_group(group, Signal::SIGTERM)?;

        if let Some(status) = child.wait_timeout(self.grace).map_err(ExecutorError::Wait)? {
            return Ok(status);
        }

        debug!(pid = %group, "Stage did not stop within the grace period, killing it");
        signal_group(group, Signal::SIGKILL)?;
        child.wait().map_err(ExecutorError::Wait)
    }

    fn supervise(
        &self,
        request: &StageRequest,
        child: &mut Child,
        group: Pid,
        events: &crossbeam_channel::Receiver<StageEvent>,
        monitor: &mut dyn StageMonitor,
    ) -> Result<Ending, ExecutorError> {
        let deadline = request.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            let slice = match deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.poll_interval),
                None => self.poll_interval,
            };

            if let Some(status) = child.wait_timeout(slice).map_err(ExecutorError::Wait)? {
                return Ok(Ending::Exited(status));
            }

            for event in events.try_iter() {
                monitor.on_event(request.stage, &event);
            }
            monitor.on_tick(request.stage);

            if request.cancel.is_cancelled() {
                info!(stage = %request.stage, "Cancelling running stage");
                self.terminate(child, group)?;
                return Ok(Ending::Cancelled);
            }

            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                warn!(stage = %request.stage, "Stage exceeded its timeout");
                self.terminate(child, group)?;
                return Ok(Ending::TimedOut);
            }
        }
    }
}

impl Executor for LocalExecutor {
    #[instrument(skip_all, level = "debug", fields(stage = %request.stage))]
    fn run(
        &self,
        request: &StageRequest,
        monitor: &mut dyn StageMonitor,
    ) -> Result<StageOutcome, ExecutorError> {
        let start = Instant::now();
        let outcome = |status, exit_code| StageOutcome {
            stage: request.stage,
            status,
            exit_code,
            log: request.log.clone(),
            duration: start.elapsed(),
        };

        if request.cancel.is_cancelled() {
            return Ok(outcome(StageStatus::Cancelled, None));
        }

        let log_error = |source| ExecutorError::Log {
            path: request.log.clone(),
            source,
        };
        if let Some(parent) = request.log.parent() {
            fs::create_dir_all(parent).map_err(log_error)?;
        }
        let log = Arc::new(Mutex::new(File::create(&request.log).map_err(log_error)?));

        debug!(
            "Launching {} {:?} in {}",
            request.exec.display(),
            request.args,
            request.workdir.display()
        );

        let mut child = Command::new(&request.exec)
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group so termination reaches everything the engine forks
            .process_group(0)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                exec: request.exec.clone(),
                source,
            })?;
        let group = Pid::from_raw(child.id() as i32);

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(copy_output(
                stdout,
                log.clone(),
                Some((request.events.clone(), sender)),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(copy_output(stderr, log.clone(), None));
        }

        let ending = match self.supervise(request, &mut child, group, &receiver, monitor) {
            Ok(ending) => ending,
            Err(e) => {
                // never leave a running process behind, whatever went wrong
                let _ = signal_group(group, Signal::SIGKILL);
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        // stragglers that outlived the engine itself would keep the pipes open
        signal_group(group, Signal::SIGKILL)?;
        for reader in readers {
            if reader.join().is_err() {
                warn!(stage = %request.stage, "Log reader thread panicked");
            }
        }
        for event in receiver.try_iter() {
            monitor.on_event(request.stage, &event);
        }

        let (status, exit_code) = match ending {
            Ending::Exited(status) if status.success() => (StageStatus::Succeeded, Some(0)),
            Ending::Exited(status) => {
                if let Some(signal) = status.signal() {
                    note(&log, &format!("terminated by signal {signal}"));
                }
                (StageStatus::Failed(status.code()), status.code())
            }
            Ending::TimedOut => {
                note(
                    &log,
                    &format!(
                        "stage timed out after {}s",
                        request.timeout.unwrap_or_default().as_secs()
                    ),
                );
                (StageStatus::TimedOut, None)
            }
            Ending::Cancelled => {
                note(&log, "stage cancelled");
                (StageStatus::Cancelled, None)
            }
        };

        if let Err(e) = log.lock().flush() {
            warn!(stage = %request.stage, "Failed to flush stage log: {e}");
        }

        let outcome = outcome(status, exit_code);
        debug!(
            "Finished in {} ms | status: {:?}",
            outcome.duration_ms(),
            outcome.status
        );

        Ok(outcome)
    }
}

fn signal_group(group: Pid, signal: Signal) -> Result<(), ExecutorError> {
    match killpg(group, signal) {
        // group already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn note(log: &Mutex<File>, message: &str) {
    if let Err(e) = writeln!(log.lock(), "[wheelflow-runner] {message}") {
        warn!("Failed to write to stage log: {e}");
    }
}

/// Copy a pipe into the shared log line by line, reporting configured markers on the way
fn copy_output<R: Read + Send + 'static>(
    pipe: R,
    log: Arc<Mutex<File>>,
    markers: Option<(Vec<EventMarker>, Sender<StageEvent>)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    trace!("Stage output closed: {e}");
                    break;
                }
            }

            if let Err(e) = log.lock().write_all(&buffer) {
                warn!("Failed to write to stage log: {e}");
            }

            if let Some((ref markers, ref sender)) = markers {
                let line = String::from_utf8_lossy(&buffer);
                for marker in markers.iter().filter(|m| line.contains(m.marker.as_str())) {
                    // the receiver is gone once the stage was decided, nothing left to report
                    let _ = sender.send(StageEvent {
                        name: marker.name.clone(),
                        progress: marker.progress,
                        line: line.trim_end().to_owned(),
                    });
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "local_test.rs"]
mod local_test;
