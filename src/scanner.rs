/// Frame discovery: find the highest-numbered frame file in the render output directory.
///
/// Frame files are named `{prefix}{digits}.{extension}` (e.g. `0042.png`).
/// Anything else in the directory is ignored without complaint.
use crate::config::OutputConfig;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The newest frame seen on a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameObservation {
    /// Frame index parsed from the filename.
    pub frame: u32,
    /// Last-modified time of the frame file.
    pub modified: SystemTime,
    /// Path of the frame file.
    pub path: PathBuf,
}

/// Scans one directory for frame files with one extension.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    dir: PathBuf,
    extension: String,
    prefix: String,
}

impl FrameScanner {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(output: &OutputConfig) -> Self {
        Self::new(&output.dir, output.extension(), output.prefix.clone())
    }

    /// The directory being scanned.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the highest-numbered frame in the directory, or `None` if no
    /// file has the configured extension and a numeric name.
    ///
    /// Errors only on I/O failure reading the directory or the winning file's
    /// metadata.
    pub fn scan(&self) -> Result<Option<FrameObservation>, ScanError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ScanError::ReadDir {
            path: self.dir.clone(),
            source: e,
        })?;

        let mut highest: Option<(u32, PathBuf)> = None;
        let mut ignored = 0usize;

        for entry in entries {
            let entry = entry.map_err(|e| ScanError::ReadDir {
                path: self.dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if path.extension() != Some(OsStr::new(&self.extension)) || !path.is_file() {
                continue;
            }

            let frame = path
                .file_stem()
                .and_then(OsStr::to_str)
                .and_then(|stem| parse_frame_number(stem, &self.prefix));

            match frame {
                Some(frame) => {
                    // `007.png` and `7.png` tie; prefer the later name so the pick is stable.
                    let is_higher = match &highest {
                        Some((best, best_path)) => {
                            frame > *best || (frame == *best && path > *best_path)
                        }
                        None => true,
                    };
                    if is_higher {
                        highest = Some((frame, path));
                    }
                }
                None => ignored += 1,
            }
        }

        if ignored > 0 {
            tracing::debug!(
                ignored,
                dir = %self.dir.display(),
                "skipped files without a numeric frame name"
            );
        }

        let Some((frame, path)) = highest else {
            return Ok(None);
        };

        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| ScanError::Metadata {
                path: path.clone(),
                source: e,
            })?;

        Ok(Some(FrameObservation {
            frame,
            modified,
            path,
        }))
    }
}

/// Parse a frame index from a file stem: strip `prefix`, then require one or
/// more ASCII digits that fit in a `u32`. Leading zeros are fine; signs and
/// whitespace are not.
pub fn parse_frame_number(stem: &str, prefix: &str) -> Option<u32> {
    let digits = stem.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Errors from scanning the output directory.
#[derive(Debug)]
pub enum ScanError {
    /// The directory could not be listed.
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The newest frame's metadata could not be read (e.g. deleted mid-scan).
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::ReadDir { path, source } => {
                write!(
                    f,
                    "failed to read output directory {}: {source}",
                    path.display()
                )
            }
            ScanError::Metadata { path, source } => {
                write!(
                    f,
                    "failed to read metadata of frame file {}: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::ReadDir { source, .. } => Some(source),
            ScanError::Metadata { source, .. } => Some(source),
        }
    }
}
