/// Render watchdog: the poll loop and restart state machine.
///
/// Every `time_limit` the output directory is scanned. If the newest frame is
/// the end frame the run is complete. Otherwise, if the newest frame is older
/// than `time_limit`, the renderer is killed and relaunched from the frame
/// after it.
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::notify::CompletionNotifier;
use crate::scanner::{FrameObservation, FrameScanner, ScanError};
use crate::signals::ShutdownSignal;
use crate::stall::{Progress, StallDetector};
use crate::status::{GuardState, StatusData, StatusFile};
use crate::supervisor::{
    LaunchSpec, ProcessControl, ProcessSupervisor, SupervisorError, LAUNCH_GRACE,
    TERMINATION_GRACE,
};
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Give up after this many scans in a row fail with an I/O error.
const MAX_CONSECUTIVE_SCAN_ERRORS: u32 = 5;

/// Mutable loop state, owned by the watchdog for the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderState {
    /// Newest frame seen so far. Kept across polls that find nothing.
    pub highest_observed_frame: Option<u32>,
    /// When the last poll was evaluated.
    pub last_evaluated_at: SystemTime,
    restart_count: u32,
    last_restart_at: Option<SystemTime>,
}

impl RenderState {
    pub fn new(now: SystemTime) -> Self {
        Self {
            highest_observed_frame: None,
            last_evaluated_at: now,
            restart_count: 0,
            last_restart_at: None,
        }
    }

    /// Number of stall-triggered restarts. Never decreases.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    fn observe(&mut self, observation: Option<&FrameObservation>, now: SystemTime) {
        if let Some(obs) = observation {
            self.highest_observed_frame = Some(obs.frame);
        }
        self.last_evaluated_at = now;
    }

    fn record_restart(&mut self, at: SystemTime) {
        self.restart_count += 1;
        self.last_restart_at = Some(at);
    }
}

/// What a single poll decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No frame files yet; keep polling.
    AwaitFrames,
    /// Newest frame is within the time limit.
    Continue { frame: u32 },
    /// Newest frame is the end frame.
    Complete { frame: u32 },
    /// Newest frame is too old; relaunch from `resume_from`.
    Restart {
        frame: u32,
        resume_from: u32,
        age: Duration,
    },
}

/// Decide what to do with a poll's observation.
///
/// Completion is checked before staleness: the end frame stays on disk long
/// after the renderer exits and must never read as a stall.
pub fn evaluate(
    observation: Option<&FrameObservation>,
    end_frame: u32,
    detector: &StallDetector,
    now: SystemTime,
) -> Decision {
    let Some(obs) = observation else {
        return Decision::AwaitFrames;
    };

    if obs.frame == end_frame {
        return Decision::Complete { frame: obs.frame };
    }

    match detector.evaluate(obs.modified, now) {
        Progress::Progressing => Decision::Continue { frame: obs.frame },
        Progress::Stalled { age } => Decision::Restart {
            frame: obs.frame,
            resume_from: obs.frame.saturating_add(1),
            age,
        },
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The end frame was rendered.
    Completed,
    /// SIGINT or SIGTERM received.
    Shutdown,
}

/// Summary of the run, returned to main.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub restart_count: u32,
    pub final_frame: Option<u32>,
    pub exit_reason: ExitReason,
    pub finished_at: DateTime<Local>,
}

/// Errors that end a watchdog run.
#[derive(Debug)]
pub enum WatchdogError {
    /// The output directory does not exist (checked before the loop starts).
    OutputDirMissing { path: PathBuf },
    /// Scanning the output directory kept failing.
    Scan(ScanError),
    /// Terminating or relaunching the renderer failed.
    Supervisor(SupervisorError),
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::OutputDirMissing { path } => {
                write!(f, "output directory {} doesn't exist", path.display())
            }
            WatchdogError::Scan(e) => write!(f, "{e}"),
            WatchdogError::Supervisor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WatchdogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchdogError::OutputDirMissing { .. } => None,
            WatchdogError::Scan(e) => Some(e),
            WatchdogError::Supervisor(e) => Some(e),
        }
    }
}

impl From<ScanError> for WatchdogError {
    fn from(e: ScanError) -> Self {
        WatchdogError::Scan(e)
    }
}

impl From<SupervisorError> for WatchdogError {
    fn from(e: SupervisorError) -> Self {
        WatchdogError::Supervisor(e)
    }
}

/// Supervises one render: owns the scanner, stall detector, process supervisor
/// and the loop state.
pub struct RenderWatchdog<C, P, N> {
    clock: C,
    scanner: FrameScanner,
    detector: StallDetector,
    supervisor: ProcessSupervisor<P>,
    notifier: Option<N>,
    status: Option<StatusFile>,
    end_frame: u32,
    poll_interval: Duration,
    state: RenderState,
}

impl<C: Clock, P: ProcessControl, N: CompletionNotifier> RenderWatchdog<C, P, N> {
    /// Build a watchdog from resolved config. `notifier` runs once on completion
    /// (pass `None` to just exit).
    pub fn new(config: &GuardConfig, clock: C, control: P, notifier: Option<N>) -> Self {
        let time_limit = config.watchdog.time_limit();
        let state = RenderState::new(clock.now());
        Self {
            clock,
            scanner: FrameScanner::from_config(&config.output),
            detector: StallDetector::new(time_limit),
            supervisor: ProcessSupervisor::new(control, LaunchSpec::from_config(&config.render)),
            notifier,
            status: config.watchdog.status_file.clone().map(StatusFile::new),
            end_frame: config.render.end_frame,
            poll_interval: time_limit,
            state,
        }
    }

    #[cfg(test)]
    fn state(&self) -> &RenderState {
        &self.state
    }

    /// Check the output directory before entering the loop.
    pub fn preflight(&self) -> Result<(), WatchdogError> {
        let dir = self.scanner.dir();
        if !dir.is_dir() {
            return Err(WatchdogError::OutputDirMissing {
                path: dir.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Run until the end frame appears or shutdown is requested.
    ///
    /// Fails immediately if the output directory is missing, on any
    /// supervisor failure, or after repeated scan failures.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> Result<RunSummary, WatchdogError> {
        self.preflight()?;

        tracing::info!(
            dir = %self.scanner.dir().display(),
            end_frame = self.end_frame,
            time_limit_secs = self.detector.time_limit().as_secs(),
            process = %self.supervisor.spec().process_name,
            "watchdog running"
        );
        self.write_status(GuardState::Starting);

        self.watch(shutdown).await
    }

    async fn watch(&mut self, shutdown: &ShutdownSignal) -> Result<RunSummary, WatchdogError> {
        let mut consecutive_scan_errors = 0u32;

        loop {
            if shutdown.requested() {
                return Ok(self.shut_down());
            }

            if !self.pause(self.poll_interval, shutdown).await {
                return Ok(self.shut_down());
            }

            match self.poll_once(shutdown).await {
                Ok(Decision::Complete { frame }) => return Ok(self.complete(frame)),
                Ok(_) => consecutive_scan_errors = 0,
                Err(WatchdogError::Scan(e)) => {
                    consecutive_scan_errors += 1;
                    tracing::warn!(
                        error = %e,
                        consecutive = consecutive_scan_errors,
                        "failed to scan output directory"
                    );
                    if consecutive_scan_errors >= MAX_CONSECUTIVE_SCAN_ERRORS {
                        self.write_status(GuardState::ShuttingDown);
                        return Err(WatchdogError::Scan(e));
                    }
                }
                Err(e) => {
                    self.write_status(GuardState::ShuttingDown);
                    return Err(e);
                }
            }
        }
    }

    /// One poll: scan, decide, and restart the renderer if it stalled.
    ///
    /// Completion is reported but not acted on; `run` owns the terminal state.
    pub async fn poll_once(&mut self, shutdown: &ShutdownSignal) -> Result<Decision, WatchdogError> {
        let observation = self.scanner.scan()?;
        let now = self.clock.now();
        self.state.observe(observation.as_ref(), now);

        let decision = evaluate(observation.as_ref(), self.end_frame, &self.detector, now);

        match decision {
            Decision::AwaitFrames => {
                tracing::info!(
                    dir = %self.scanner.dir().display(),
                    "no frame files found in the output directory"
                );
            }
            Decision::Continue { frame } => {
                if frame > self.end_frame {
                    tracing::warn!(
                        frame,
                        end_frame = self.end_frame,
                        "newest frame is beyond the configured end frame"
                    );
                }
                tracing::debug!(frame, "render progressing");
            }
            Decision::Complete { .. } => {}
            Decision::Restart {
                frame,
                resume_from,
                age,
            } => {
                tracing::warn!(
                    frame,
                    age_secs = age.as_secs(),
                    limit_secs = self.detector.time_limit().as_secs(),
                    "time limit passed, rendering is likely stuck"
                );
                // The newest file is kept and not re-rendered even if the
                // renderer died mid-write.
                if let Some(ref obs) = observation {
                    tracing::warn!(
                        path = %obs.path.display(),
                        resume_from,
                        "resuming after last frame on disk; check it is complete"
                    );
                }
                if resume_from > self.end_frame {
                    tracing::error!(
                        resume_from,
                        end_frame = self.end_frame,
                        "relaunching with a start frame past the end frame; \
                         the renderer has nothing to do and will be restarted every interval"
                    );
                }
                self.restart(resume_from, shutdown).await?;
            }
        }

        self.write_status(GuardState::Polling);
        Ok(decision)
    }

    /// Wait `duration` on the clock. Returns `false` if shutdown came first.
    async fn pause(&self, duration: Duration, shutdown: &ShutdownSignal) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.wait() => false,
            _ = self.clock.sleep(duration) => true,
        }
    }

    async fn restart(
        &mut self,
        resume_from: u32,
        shutdown: &ShutdownSignal,
    ) -> Result<(), WatchdogError> {
        tracing::info!(
            restart = self.state.restart_count + 1,
            "executing render restart"
        );
        self.write_status(GuardState::Restarting);

        let terminated = self.supervisor.terminate_if_running()?;
        if terminated && !self.pause(TERMINATION_GRACE, shutdown).await {
            tracing::warn!("shutdown requested during restart, renderer not relaunched");
            return Ok(());
        }

        let pid = self.supervisor.launch(resume_from, self.end_frame)?;
        if !self.pause(LAUNCH_GRACE, shutdown).await {
            tracing::info!(pid, "shutdown requested while the renderer was starting");
        }

        self.state.record_restart(self.clock.now());
        tracing::info!(
            pid,
            resume_from,
            restart_count = self.state.restart_count,
            "render restarted"
        );
        Ok(())
    }

    fn complete(&mut self, frame: u32) -> RunSummary {
        let summary = self.summary(ExitReason::Completed);
        tracing::info!(
            frame,
            restart_count = summary.restart_count,
            finished_at = %summary.finished_at.format("%Y-%m-%d %H:%M:%S"),
            "rendering of all frames finished"
        );
        self.write_status(GuardState::Completed);

        if let Some(notifier) = self.notifier.as_mut() {
            if let Err(e) = notifier.on_completed(&summary) {
                tracing::warn!(error = %e, "completion hook failed");
            }
        }

        summary
    }

    fn shut_down(&mut self) -> RunSummary {
        tracing::info!(
            restart_count = self.state.restart_count,
            "shutdown requested, exiting watchdog"
        );
        self.write_status(GuardState::ShuttingDown);
        self.summary(ExitReason::Shutdown)
    }

    fn summary(&self, exit_reason: ExitReason) -> RunSummary {
        RunSummary {
            restart_count: self.state.restart_count(),
            final_frame: self.state.highest_observed_frame,
            exit_reason,
            finished_at: DateTime::<Local>::from(self.clock.now()),
        }
    }

    fn write_status(&self, state: GuardState) {
        let Some(ref status) = self.status else {
            return;
        };
        let data = StatusData {
            pid: std::process::id(),
            state,
            highest_frame: self.state.highest_observed_frame,
            end_frame: self.end_frame,
            restart_count: self.state.restart_count(),
            last_restart: self.state.last_restart_at.map(DateTime::<Utc>::from),
            last_poll: DateTime::<Utc>::from(self.state.last_evaluated_at),
            last_update: DateTime::<Utc>::from(self.clock.now()),
        };
        if let Err(e) = status.write(&data) {
            tracing::warn!(error = %e, path = %status.path().display(), "failed to write status file");
        }
    }

    #[cfg(test)]
    fn control(&self) -> &P {
        self.supervisor.control()
    }
}
