/// Render process supervision: find and kill a hung renderer, launch a fresh one.
///
/// The platform specifics (process table lookup, signals, spawning) sit behind
/// `ProcessControl` so the restart logic can be exercised without real processes.
use crate::config::RenderConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Wait after killing the renderer before relaunching, so the old process has
/// released its file handles and GPU context.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(6);

/// Wait after launching before polling resumes. Scene load and the first
/// frame take a while.
pub const LAUNCH_GRACE: Duration = Duration::from_secs(10);

/// A fully-resolved renderer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: Option<PathBuf>,
}

/// Process-table operations needed by the supervisor.
pub trait ProcessControl {
    /// PID of a running process named exactly `name`, if any.
    fn find_running_instance(&mut self, name: &str) -> Result<Option<u32>, SupervisorError>;

    /// Request termination. Returns `false` if the process was already gone.
    fn terminate(&mut self, pid: u32) -> Result<bool, SupervisorError>;

    /// Start the command without waiting for it. Returns the new PID.
    fn launch(&mut self, command: &LaunchCommand) -> Result<u32, SupervisorError>;
}

/// Everything needed to build a `LaunchCommand` for a frame range.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub project_file: PathBuf,
    pub args: Vec<String>,
    pub process_name: String,
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn from_config(render: &RenderConfig) -> Self {
        Self {
            executable: render.executable.clone(),
            project_file: render.project_file.clone(),
            args: render.args.clone(),
            process_name: render.process_name(),
            log_file: render.log_file.clone(),
        }
    }

    /// Resolve the argument template for an inclusive frame range.
    pub fn command(&self, start_frame: u32, end_frame: u32) -> LaunchCommand {
        LaunchCommand {
            program: self.executable.clone(),
            args: build_args(&self.args, &self.project_file, start_frame, end_frame),
            log_file: self.log_file.clone(),
        }
    }
}

/// Replace `{project}`, `{start}` and `{end}` placeholders in each argument.
fn build_args(template: &[String], project: &Path, start: u32, end: u32) -> Vec<String> {
    let project = project.display().to_string();
    let start = start.to_string();
    let end = end.to_string();
    template
        .iter()
        .map(|arg| {
            arg.replace("{project}", &project)
                .replace("{start}", &start)
                .replace("{end}", &end)
        })
        .collect()
}

/// Terminates and relaunches the renderer.
///
/// Does not wait for grace periods itself; the caller owns the clock and
/// waits `TERMINATION_GRACE` / `LAUNCH_GRACE` between steps.
pub struct ProcessSupervisor<P> {
    control: P,
    spec: LaunchSpec,
}

impl<P: ProcessControl> ProcessSupervisor<P> {
    pub fn new(control: P, spec: LaunchSpec) -> Self {
        Self { control, spec }
    }

    /// Kill the running renderer, if there is one.
    ///
    /// Returns `true` if a process was terminated. No running process is a
    /// normal state (e.g. the renderer crashed on its own) and returns `false`.
    pub fn terminate_if_running(&mut self) -> Result<bool, SupervisorError> {
        let name = &self.spec.process_name;
        match self.control.find_running_instance(name)? {
            Some(pid) => {
                let terminated = self.control.terminate(pid)?;
                if terminated {
                    tracing::info!(pid, process = %name, "render process terminated");
                } else {
                    tracing::info!(pid, process = %name, "render process exited before it could be terminated");
                }
                Ok(terminated)
            }
            None => {
                tracing::info!(process = %name, "no running render process found");
                Ok(false)
            }
        }
    }

    /// Launch the renderer for frames `resume_from..=end_frame`.
    pub fn launch(&mut self, resume_from: u32, end_frame: u32) -> Result<u32, SupervisorError> {
        let command = self.spec.command(resume_from, end_frame);
        tracing::info!(
            program = %command.program.display(),
            args = ?command.args,
            start_frame = resume_from,
            end_frame,
            "launching render process"
        );
        let pid = self.control.launch(&command)?;
        tracing::info!(pid, "render process started");
        Ok(pid)
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    #[cfg(test)]
    pub fn control(&self) -> &P {
        &self.control
    }
}

/// `ProcessControl` backed by the real process table (`pgrep`, `kill(2)`).
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn find_running_instance(&mut self, name: &str) -> Result<Option<u32>, SupervisorError> {
        let output = std::process::Command::new("pgrep")
            .arg("-x")
            .arg(name)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SupervisorError::Lookup {
                name: name.to_string(),
                source: e,
            })?;

        // pgrep: 0 = matched, 1 = no match, anything else = usage/system error
        match output.status.code() {
            Some(0) => {
                let pids = parse_pgrep_output(&String::from_utf8_lossy(&output.stdout));
                if pids.len() > 1 {
                    tracing::warn!(
                        process = %name,
                        count = pids.len(),
                        "multiple render processes running, terminating the first"
                    );
                }
                Ok(pids.first().copied())
            }
            // Exit 1 with a diagnostic (e.g. a name past the kernel's 15-byte
            // limit) is not the same as "nothing running".
            Some(1) if output.stderr.iter().all(u8::is_ascii_whitespace) => Ok(None),
            code => Err(SupervisorError::LookupFailed {
                name: name.to_string(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn terminate(&mut self, pid: u32) -> Result<bool, SupervisorError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::{getpgid, getpgrp, Pid};

        let target = Pid::from_raw(pid as i32);

        // SIGKILL: a hung renderer is not expected to honour SIGTERM.
        // A group leader takes its whole group down with it, so children of a
        // wrapper script die too. The guard's own group is never signalled.
        let result = match getpgid(Some(target)) {
            Ok(pgid) if pgid == target && pgid != getpgrp() => killpg(pgid, Signal::SIGKILL),
            Ok(_) => kill(target, Signal::SIGKILL),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(SupervisorError::Terminate { pid, source: e }),
        }
    }

    fn launch(&mut self, command: &LaunchCommand) -> Result<u32, SupervisorError> {
        let (stdout, stderr) = match command.log_file {
            Some(ref path) => {
                let log_err = |e| SupervisorError::LogFile {
                    path: path.clone(),
                    source: e,
                };
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(log_err)?;
                let file_stderr = file.try_clone().map_err(log_err)?;
                (Stdio::from(file), Stdio::from(file_stderr))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        // The child is never awaited; tokio reaps it in the background once dropped.
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0) // Ctrl-C on the guard must not reach the renderer
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                program: command.program.clone(),
                source: e,
            })?;

        Ok(child.id().unwrap_or(0))
    }
}

/// Parse `pgrep` stdout (one PID per line).
fn parse_pgrep_output(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Errors from process supervision. All of them end the run: restarting
/// blindly could leave two renderers writing the same frames.
#[derive(Debug)]
pub enum SupervisorError {
    /// The process lookup tool could not be run.
    Lookup {
        name: String,
        source: std::io::Error,
    },
    /// The process lookup tool ran but failed.
    LookupFailed {
        name: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Sending the kill signal failed for a reason other than "no such process".
    Terminate { pid: u32, source: nix::errno::Errno },
    /// The render log file could not be opened.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The render executable could not be started.
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Lookup { name, source } => {
                write!(f, "failed to look up process '{name}': {source}")
            }
            SupervisorError::LookupFailed { name, code, stderr } => {
                write!(
                    f,
                    "process lookup for '{name}' failed (exit code {code:?}): {stderr}"
                )
            }
            SupervisorError::Terminate { pid, source } => {
                write!(f, "failed to terminate process {pid}: {source}")
            }
            SupervisorError::LogFile { path, source } => {
                write!(f, "failed to open render log {}: {source}", path.display())
            }
            SupervisorError::Spawn { program, source } => {
                write!(
                    f,
                    "failed to launch render executable {}: {source}",
                    program.display()
                )
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Lookup { source, .. } => Some(source),
            SupervisorError::LookupFailed { .. } => None,
            SupervisorError::Terminate { source, .. } => Some(source),
            SupervisorError::LogFile { source, .. } => Some(source),
            SupervisorError::Spawn { source, .. } => Some(source),
        }
    }
}

/// In-memory process table for tests.
#[cfg(test)]
#[derive(Default)]
pub struct FakeProcesses {
    pub running: Option<u32>,
    pub lookups: Vec<String>,
    pub terminated: Vec<u32>,
    pub launched: Vec<LaunchCommand>,
    pub fail_launch: bool,
    pub next_pid: u32,
    pub on_launch: Option<Box<dyn FnMut(&LaunchCommand)>>,
}

#[cfg(test)]
impl FakeProcesses {
    /// The `-s` argument of every launch, in order.
    pub fn start_frames(&self) -> Vec<String> {
        self.launched
            .iter()
            .filter_map(|c| {
                let pos = c.args.iter().position(|a| a == "-s")?;
                c.args.get(pos + 1).cloned()
            })
            .collect()
    }
}

#[cfg(test)]
impl ProcessControl for FakeProcesses {
    fn find_running_instance(&mut self, name: &str) -> Result<Option<u32>, SupervisorError> {
        self.lookups.push(name.to_string());
        Ok(self.running)
    }

    fn terminate(&mut self, pid: u32) -> Result<bool, SupervisorError> {
        self.terminated.push(pid);
        self.running = None;
        Ok(true)
    }

    fn launch(&mut self, command: &LaunchCommand) -> Result<u32, SupervisorError> {
        if self.fail_launch {
            return Err(SupervisorError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        self.next_pid += 1;
        let pid = 1000 + self.next_pid;
        self.running = Some(pid);
        self.launched.push(command.clone());
        if let Some(ref mut hook) = self.on_launch {
            hook(command);
        }
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn blender_spec() -> LaunchSpec {
        LaunchSpec::from_config(&RenderConfig {
            executable: PathBuf::from("/opt/blender/blender"),
            project_file: PathBuf::from("/projects/shot.blend"),
            ..Default::default()
        })
    }

    #[test]
    fn test_build_args_substitutes_frame_range() {
        let command = blender_spec().command(8, 10);
        assert_eq!(command.program, PathBuf::from("/opt/blender/blender"));
        assert_eq!(
            command.args,
            vec!["-b", "/projects/shot.blend", "-s", "8", "-e", "10", "-a"]
        );
        assert!(command.log_file.is_none());
    }

    #[test]
    fn test_build_args_placeholders_inside_arguments() {
        let args = build_args(
            &["--frames={start}..{end}".to_string(), "{project}".to_string()],
            Path::new("scene.blend"),
            3,
            7,
        );
        assert_eq!(args, vec!["--frames=3..7", "scene.blend"]);
    }

    #[test]
    fn test_spec_uses_executable_stem_as_process_name() {
        assert_eq!(blender_spec().process_name, "blender");
    }

    #[test]
    fn test_terminate_if_running_with_no_process() {
        let mut supervisor = ProcessSupervisor::new(FakeProcesses::default(), blender_spec());
        assert!(!supervisor.terminate_if_running().unwrap());
        assert_eq!(supervisor.control().lookups, vec!["blender"]);
        assert!(supervisor.control().terminated.is_empty());
    }

    #[test]
    fn test_terminate_if_running_kills_found_process() {
        let fake = FakeProcesses {
            running: Some(4242),
            ..Default::default()
        };
        let mut supervisor = ProcessSupervisor::new(fake, blender_spec());
        assert!(supervisor.terminate_if_running().unwrap());
        assert_eq!(supervisor.control().terminated, vec![4242]);
    }

    #[test]
    fn test_launch_passes_resume_range() {
        let mut supervisor = ProcessSupervisor::new(FakeProcesses::default(), blender_spec());
        let pid = supervisor.launch(8, 10).unwrap();
        assert_eq!(pid, 1001);
        assert_eq!(supervisor.control().start_frames(), vec!["8"]);
        assert_eq!(supervisor.control().running, Some(1001));
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let fake = FakeProcesses {
            fail_launch: true,
            ..Default::default()
        };
        let mut supervisor = ProcessSupervisor::new(fake, blender_spec());
        let err = supervisor.launch(1, 10).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("failed to launch render executable"));
    }

    #[test]
    fn test_parse_pgrep_output() {
        assert_eq!(parse_pgrep_output("123\n456\n"), vec![123, 456]);
        assert_eq!(parse_pgrep_output(""), Vec::<u32>::new());
        assert_eq!(parse_pgrep_output("  77 \ngarbage\n"), vec![77]);
    }

    #[test]
    fn test_system_terminate_missing_pid_reports_not_terminated() {
        let mut procs = SystemProcesses;
        assert!(!procs.terminate(i32::MAX as u32).unwrap());
    }

    #[tokio::test]
    async fn test_system_launch_does_not_wait_for_child() {
        let mut procs = SystemProcesses;
        let command = LaunchCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            log_file: None,
        };

        let start = std::time::Instant::now();
        let pid = procs.launch(&command).unwrap();
        assert!(pid > 0);
        assert!(start.elapsed() < Duration::from_secs(5));

        assert!(procs.terminate(pid).unwrap());
    }

    /// Launch `sh -c script` through a symlink called `name`; the kernel
    /// reports the symlink name as the process name.
    #[cfg(target_os = "linux")]
    fn launch_named_shell(dir: &Path, name: &str, script: &str) -> u32 {
        let shell = ["/bin/sh", "/usr/bin/sh"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap();
        let link = dir.join(name);
        std::os::unix::fs::symlink(shell, &link).unwrap();
        SystemProcesses
            .launch(&LaunchCommand {
                program: link,
                args: vec!["-c".to_string(), script.to_string()],
                log_file: None,
            })
            .unwrap()
    }

    /// Running or stopped, but not a zombie and not gone.
    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !matches!(rest.trim_start().chars().next(), Some('Z' | 'X')))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_system_lookup_finds_live_renderer_by_name() {
        let dir = tempdir().unwrap();
        let pid = launch_named_shell(dir.path(), "rg-lookup-live", "sleep 30; true");

        let mut procs = SystemProcesses;
        assert_eq!(
            procs.find_running_instance("rg-lookup-live").unwrap(),
            Some(pid)
        );

        let mut supervisor = ProcessSupervisor::new(
            SystemProcesses,
            LaunchSpec {
                process_name: "rg-lookup-live".to_string(),
                ..blender_spec()
            },
        );
        assert!(supervisor.terminate_if_running().unwrap());
        assert_eq!(procs.find_running_instance("rg-lookup-gone").unwrap(), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_lookup_name_past_kernel_limit_is_an_error() {
        // A live process under this name would still be invisible to pgrep -x.
        let mut procs = SystemProcesses;
        let err = procs
            .find_running_instance("frame_renderer_long")
            .unwrap_err();
        assert!(matches!(err, SupervisorError::LookupFailed { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_system_terminate_kills_children_of_wrapper_script() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let script = format!("sleep 77 & echo $! > {}; wait", pid_file.display());

        let mut procs = SystemProcesses;
        let wrapper = procs
            .launch(&LaunchCommand {
                program: PathBuf::from("sh"),
                args: vec!["-c".to_string(), script],
                log_file: None,
            })
            .unwrap();

        let mut child = None;
        for _ in 0..100 {
            child = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            if child.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let child = child.expect("wrapper never reported its child pid");
        assert!(is_alive(child));

        assert!(procs.terminate(wrapper).unwrap());

        for _ in 0..100 {
            if !is_alive(child) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("renderer {child} started by the wrapper survived termination");
    }

    #[tokio::test]
    async fn test_system_launch_missing_executable_fails() {
        let mut procs = SystemProcesses;
        let command = LaunchCommand {
            program: PathBuf::from("nonexistent-renderer-xyz"),
            args: vec![],
            log_file: None,
        };
        let err = procs.launch(&command).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_system_launch_appends_output_to_log_file() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("render.log");
        std::fs::write(&log, "previous run\n").unwrap();

        let mut procs = SystemProcesses;
        let command = LaunchCommand {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "echo rendering; echo oops >&2".to_string(),
            ],
            log_file: Some(log.clone()),
        };
        procs.launch(&command).unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&log).unwrap();
            if contents.contains("rendering") && contents.contains("oops") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(contents.starts_with("previous run\n"));
        assert!(contents.contains("rendering"));
        assert!(contents.contains("oops"));
    }

    #[tokio::test]
    async fn test_system_launch_bad_log_path_fails() {
        let mut procs = SystemProcesses;
        let command = LaunchCommand {
            program: PathBuf::from("true"),
            args: vec![],
            log_file: Some(PathBuf::from("/nonexistent-dir/render.log")),
        };
        let err = procs.launch(&command).unwrap_err();
        assert!(matches!(err, SupervisorError::LogFile { .. }));
    }
}
