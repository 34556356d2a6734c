/// Machine-readable progress report for external tooling.
///
/// The JSON is written to a sibling temp file and renamed over the target, so
/// a reader polling the file never sees half a document.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Starting,
    Polling,
    Restarting,
    Completed,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: GuardState,
    pub highest_frame: Option<u32>,
    pub end_frame: u32,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
    /// When the output directory was last scanned (guard start before the first poll).
    pub last_poll: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        let tmp_name = format!(".render-guard.status.tmp.{}", std::process::id());
        let tmp_path = match path.parent() {
            Some(parent) => parent.join(tmp_name),
            None => PathBuf::from(tmp_name),
        };
        Self { path, tmp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the status file with `data`.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let mut json = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
        json.push(b'\n');

        std::fs::write(&self.tmp_path, &json).map_err(|source| StatusError::Io {
            step: "write",
            path: self.tmp_path.clone(),
            source,
        })?;

        std::fs::rename(&self.tmp_path, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&self.tmp_path);
            StatusError::Io {
                step: "rename",
                path: self.path.clone(),
                source,
            }
        })
    }
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Io {
        step: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "failed to encode status as JSON: {e}"),
            StatusError::Io { step, path, source } => {
                write!(f, "status file {step} failed for {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}
