/// Completion hook: runs once when the last frame has been rendered.
use crate::watchdog::RunSummary;

pub trait CompletionNotifier {
    fn on_completed(&mut self, summary: &RunSummary) -> Result<(), NotifyError>;
}

/// Suspends the host (sleep, not hibernate) when the render finishes.
#[derive(Debug, Default)]
pub struct SystemSuspend;

#[cfg(target_os = "macos")]
const SUSPEND_COMMAND: (&str, &[&str]) = ("pmset", &["sleepnow"]);
#[cfg(not(target_os = "macos"))]
const SUSPEND_COMMAND: (&str, &[&str]) = ("systemctl", &["suspend"]);

impl CompletionNotifier for SystemSuspend {
    fn on_completed(&mut self, _summary: &RunSummary) -> Result<(), NotifyError> {
        let (program, args) = SUSPEND_COMMAND;
        tracing::info!(command = program, "putting computer to sleep");

        let status = std::process::Command::new(program)
            .args(args)
            .status()
            .map_err(|e| NotifyError::Spawn {
                program: program.to_string(),
                source: e,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(NotifyError::Failed {
                program: program.to_string(),
                code: status.code(),
            })
        }
    }
}

/// Errors from the completion hook. Never fatal: the render is already done.
#[derive(Debug)]
pub enum NotifyError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    Failed {
        program: String,
        code: Option<i32>,
    },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Spawn { program, source } => {
                write!(f, "failed to run {program}: {source}")
            }
            NotifyError::Failed { program, code } => {
                write!(f, "{program} exited with code {code:?}")
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Spawn { source, .. } => Some(source),
            NotifyError::Failed { .. } => None,
        }
    }
}

/// Records each completion instead of touching the host.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub completions: Vec<u32>,
    pub fail: bool,
}

#[cfg(test)]
impl CompletionNotifier for RecordingNotifier {
    fn on_completed(&mut self, summary: &RunSummary) -> Result<(), NotifyError> {
        self.completions.push(summary.restart_count);
        if self.fail {
            return Err(NotifyError::Failed {
                program: "suspend".to_string(),
                code: Some(1),
            });
        }
        Ok(())
    }
}
