/// One guard per output directory.
///
/// Two guards watching the same frames would both relaunch the renderer on a
/// stall. `flock(LOCK_EX | LOCK_NB)` on a lock file inside the output directory
/// rules that out; the file also stores the owning PID for the error message.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lock file name, created inside the watched output directory.
pub const LOCK_FILE_NAME: &str = ".render-guard.lock";

/// A held lock. Released when dropped.
#[derive(Debug)]
pub struct SingletonLock {
    _file: File,
}

#[derive(Debug)]
pub enum LockError {
    /// Another guard holds the lock for this output directory.
    AlreadyRunning {
        path: PathBuf,
        pid: Option<u32>,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::AlreadyRunning {
                path,
                pid: Some(pid),
            } => write!(
                f,
                "another render-guard is already watching this directory (PID {pid}, lock {})",
                path.display()
            ),
            LockError::AlreadyRunning { path, pid: None } => write!(
                f,
                "another render-guard is already watching this directory (lock {})",
                path.display()
            ),
            LockError::Io { path, source } => {
                write!(f, "failed to acquire lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::AlreadyRunning { .. } => None,
            LockError::Io { source, .. } => Some(source),
        }
    }
}

/// Lock path for a given output directory.
pub fn lock_path(output_dir: &Path) -> PathBuf {
    output_dir.join(LOCK_FILE_NAME)
}

/// Try to take the lock for `output_dir` without blocking.
pub fn try_acquire(output_dir: &Path) -> Result<SingletonLock, LockError> {
    let path = lock_path(output_dir);
    let io_err = |source| LockError::Io {
        path: path.clone(),
        source,
    };

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(io_err)?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let mut f = file;
            f.set_len(0).map_err(io_err)?;
            write!(f, "{}", std::process::id()).map_err(io_err)?;
            Ok(SingletonLock { _file: f })
        }
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(LockError::AlreadyRunning {
                pid: read_pid(&path),
                path,
            })
        }
        Err(e) => Err(io_err(e)),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
