use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Linux truncates process names to 15 bytes, so `pgrep -x` never matches
/// anything longer.
const MAX_PROCESS_NAME_LEN: usize = 15;

/// Top-level configuration loaded from render-guard.toml.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default, Clone)]
pub struct GuardConfig {
    pub render: RenderConfig,
    pub output: OutputConfig,
    pub watchdog: WatchdogConfig,
}

impl GuardConfig {
    /// Read `path` as TOML. A missing file is not an error: the first run
    /// starts from defaults and setup fills them in.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: GuardConfig =
                    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Persist the configuration so the next run can start with `--skip-setup`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Flags given on the command line win over the file.
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(ref d) = overrides.output_dir {
            self.output.dir = d.clone();
        }
        if let Some(t) = overrides.time_limit {
            self.watchdog.time_limit_secs = t;
        }
        if let Some(end) = overrides.end_frame {
            self.render.end_frame = end;
        }
    }

    /// Check the resolved configuration. Returns one message per problem;
    /// an empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.render.executable.as_os_str().is_empty() {
            errors.push("render.executable must not be empty".to_string());
        }
        let process_name = self.render.process_name();
        if process_name.is_empty() {
            errors.push(
                "render.process_name could not be derived from render.executable".to_string(),
            );
        } else if cfg!(target_os = "linux") && process_name.len() > MAX_PROCESS_NAME_LEN {
            errors.push(format!(
                "render.process_name '{process_name}' is longer than {MAX_PROCESS_NAME_LEN} \
                 characters and can't be found by name on Linux; set a shorter \
                 render.process_name (the first {MAX_PROCESS_NAME_LEN} characters of the \
                 executable name)"
            ));
        }
        for placeholder in ["{start}", "{end}"] {
            if !self.render.args.iter().any(|a| a.contains(placeholder)) {
                errors.push(format!(
                    "render.args must contain a {placeholder} placeholder"
                ));
            }
        }
        if self.output.extension().is_empty() {
            errors.push("output.extension must not be empty".to_string());
        }
        if self.watchdog.time_limit_secs == 0 {
            errors.push("watchdog.time_limit_secs must be greater than 0".to_string());
        }

        errors
    }
}

/// Command-line flags that shadow file settings. `None` means not given.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub output_dir: Option<PathBuf>,
    pub time_limit: Option<u64>,
    pub end_frame: Option<u32>,
}

/// Errors that can occur while loading or saving configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Serialize {
        source: toml::ser::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "failed to parse config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Serialize { source } => {
                write!(f, "failed to serialize config: {}", source)
            }
            ConfigError::Write { path, source } => {
                write!(
                    f,
                    "failed to write config file {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Serialize { source } => Some(source),
            ConfigError::Write { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RenderConfig {
    /// Render executable, resolved through PATH when not absolute.
    pub executable: PathBuf,
    /// Project/scene file handed to the renderer.
    pub project_file: PathBuf,
    /// Last frame of the animation (inclusive).
    pub end_frame: u32,
    /// Argument template. `{project}`, `{start}` and `{end}` are substituted at launch.
    pub args: Vec<String>,
    /// Name used to find a running renderer. Defaults to the executable's file stem.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    /// Where the renderer's stdout/stderr go. Discarded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl RenderConfig {
    /// The process name to look up, falling back to the executable's file stem
    /// (`/opt/blender/blender` -> `blender`).
    pub fn process_name(&self) -> String {
        match self.process_name {
            Some(ref name) => name.trim().to_string(),
            None => self
                .executable
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory the renderer writes frames into.
    pub dir: PathBuf,
    /// Frame file extension, without the leading dot.
    pub extension: String,
    /// Filename prefix stripped before the frame number is parsed.
    pub prefix: String,
}

impl OutputConfig {
    /// The extension with any leading dots removed (`.png` -> `png`).
    pub fn extension(&self) -> &str {
        self.extension.trim().trim_start_matches('.')
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Restart the renderer if the newest frame is older than this.
    /// Also the poll interval.
    pub time_limit_secs: u64,
    /// Optional JSON status file for external tooling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
}

impl WatchdogConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("blender"),
            project_file: PathBuf::from("project.blend"),
            end_frame: 250,
            args: vec![
                "-b".to_string(),
                "{project}".to_string(),
                "-s".to_string(),
                "{start}".to_string(),
                "-e".to_string(),
                "{end}".to_string(),
                "-a".to_string(),
            ],
            process_name: None,
            log_file: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            extension: "png".to_string(),
            prefix: String::new(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 120,
            status_file: None,
        }
    }
}
