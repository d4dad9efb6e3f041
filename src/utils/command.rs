//! Command execution utilities
//!
//! Every storage operation is expressed as an [`Invocation`] and handed to an
//! [`Executor`]. The host implementation, [`CommandRunner`], runs it with a
//! fixed search path and environment overlay, optionally under `sudo -n`.
//! Other executors (the script writer, test doubles) render or record the
//! same invocations instead of running them.

use crate::provision::tracker::Resource;
use crate::utils::error::{LvmRootfsError, Result};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// PATH used when the inherited environment has none
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Prepended to an inherited PATH that lacks any sbin directory
const SBIN_PREFIX: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Directories searched for the host `lvm` binary before PATH
pub const LVM_HOST_DIRS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

/// Environment entries applied to every invocation.
///
/// Under `sudo -n` they are set on the sudo process, and sudo's `env_reset`
/// drops them unless sudoers lists them in `env_keep` (see the hint in
/// [`LvmRootfsError::CapabilityCheckFailed`]). Without that line they reach
/// only unelevated commands and runs that already have euid 0. Nothing
/// depends on them beyond quieter `lvm` output.
pub const ENV_OVERLAY: [(&str, &str); 1] = [("LVM_SUPPRESS_FD_WARNINGS", "1")];

/// A single external command, not yet executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Data written to the child's stdin. Never logged.
    pub stdin: Option<String>,
    /// Run under the elevation mechanism
    pub elevate: bool,
    /// Name of the variable the output is bound to in rendered scripts
    pub bind: Option<&'static str>,
    /// A failure is logged and ignored, never fatal
    pub best_effort: bool,
}

impl Invocation {
    /// A privileged invocation with no arguments.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            elevate: true,
            bind: None,
            best_effort: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run as the invoking user.
    pub fn unprivileged(mut self) -> Self {
        self.elevate = false;
        self
    }

    pub fn binds(mut self, var: &'static str) -> Self {
        self.bind = Some(var);
        self
    }

    /// Mark for [`run_best_effort`]; rendered scripts append `|| true`.
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    /// Program followed by its arguments, space separated.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// First non-empty line of stdout, falling back to stderr.
    pub fn first_line(&self) -> String {
        first_line(&self.stdout)
            .or_else(|| first_line(&self.stderr))
            .unwrap_or_default()
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(60).collect())
}

/// Outcome of a non-mutating reachability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Exited { code: i32, first_line: String },
    TimedOut,
    NotFound,
    Failed(String),
}

impl ProbeOutcome {
    /// Exit codes 0 and 1 both count: some tools return 1 for a version query.
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Exited { code: 0 | 1, .. })
    }
}

/// Backend every provisioning step talks to.
pub trait Executor {
    /// Run an invocation. A non-zero exit is returned as
    /// [`LvmRootfsError::CommandFailed`]; callers decide whether to propagate.
    fn execute(&self, inv: &Invocation) -> Result<CommandOutput>;

    /// Run a non-mutating invocation with a deadline.
    fn probe(&self, inv: &Invocation, _timeout: Duration) -> ProbeOutcome {
        probe_by_execute(self, inv)
    }

    /// `Err` when existence cannot be decided (e.g. permission denied),
    /// which callers must not read as "missing".
    fn file_exists(&self, path: &Path) -> std::io::Result<bool> {
        path.try_exists()
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Give the kernel `settle` to publish device nodes, then require them.
    fn wait_for_nodes(&self, nodes: &[String], settle: Duration) -> Result<()> {
        require_nodes(self, nodes, settle)
    }

    /// Human-readable progress marker.
    fn note(&self, _message: &str) {}

    fn acquired(&self, _resource: &Resource) {}

    fn released(&self, _resource: &Resource) {}
}

/// Probe without a deadline, mapping the result of a plain execute.
pub fn probe_by_execute<E: Executor + ?Sized>(cmd: &E, inv: &Invocation) -> ProbeOutcome {
    match cmd.execute(inv) {
        Ok(out) => ProbeOutcome::Exited {
            code: out.status,
            first_line: out.first_line(),
        },
        Err(LvmRootfsError::CommandFailed {
            exit_code, stderr, ..
        }) => ProbeOutcome::Exited {
            code: exit_code.unwrap_or(-1),
            first_line: first_line(&stderr).unwrap_or_default(),
        },
        Err(LvmRootfsError::CommandNotFound(_)) => ProbeOutcome::NotFound,
        Err(e) => ProbeOutcome::Failed(e.to_string()),
    }
}

/// Pause for `settle`, then fail on the first node that does not exist.
pub fn require_nodes<E: Executor + ?Sized>(
    cmd: &E,
    nodes: &[String],
    settle: Duration,
) -> Result<()> {
    cmd.pause(settle);
    for node in nodes {
        if !cmd.file_exists(Path::new(node)).unwrap_or(false) {
            return Err(LvmRootfsError::PartitionNodesMissing(node.clone()));
        }
        debug!("{} exists", node);
    }
    Ok(())
}

/// Execute an invocation, logging and discarding any failure. Invocations
/// passed here are built with [`Invocation::best_effort`] so emitted scripts
/// tolerate the same failures.
pub fn run_best_effort(cmd: &dyn Executor, inv: &Invocation) -> Option<CommandOutput> {
    match cmd.execute(inv) {
        Ok(out) => Some(out),
        Err(e) => {
            warn!("Command warning: {}", e);
            None
        }
    }
}

/// Shell reference to a bound output, safe to suffix (`${LOOP_DEVICE}p1`).
pub fn placeholder(var: &str) -> String {
    format!("${{{}}}", var)
}

/// Log a command that would be run (for dry-run mode)
pub fn log_dry_run(inv: &Invocation) {
    println!("  [dry-run] {}", inv);
}

/// Build the deterministic search path from an inherited PATH value.
pub fn search_path(inherited: Option<&str>) -> String {
    match inherited {
        None => DEFAULT_PATH.to_string(),
        Some(p) if p.is_empty() => DEFAULT_PATH.to_string(),
        Some(p) if p.split(':').any(|dir| dir.contains("sbin")) => p.to_string(),
        Some(p) => format!("{}:{}", SBIN_PREFIX, p),
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// How privileged invocations are elevated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// `sudo -n`, never prompting
    Sudo,
    /// Already running as root
    None,
}

impl Elevation {
    pub fn detect() -> Self {
        if nix::unistd::geteuid().is_root() {
            Self::None
        } else {
            Self::Sudo
        }
    }
}

/// Host executor
pub struct CommandRunner {
    dry_run: bool,
    elevation: Elevation,
    search_path: String,
}

impl CommandRunner {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            elevation: Elevation::detect(),
            search_path: search_path(std::env::var("PATH").ok().as_deref()),
        }
    }

    pub fn with_elevation(mut self, elevation: Elevation) -> Self {
        self.elevation = elevation;
        self
    }

    /// Resolve a bare program name to an absolute path.
    ///
    /// `lvm` is looked up in [`LVM_HOST_DIRS`] first so a PATH-shadowed copy
    /// (e.g. from a build sysroot) is never picked up.
    pub fn resolve_program(&self, program: &str) -> Option<String> {
        if Path::new(program).is_absolute() {
            return Some(program.to_string());
        }
        if program == "lvm" {
            if let Some(found) = LVM_HOST_DIRS
                .iter()
                .map(|dir| Path::new(dir).join("lvm"))
                .find(|candidate| is_executable(candidate))
            {
                debug!("Found host lvm at {}", found.display());
                return Some(found.to_string_lossy().to_string());
            }
        }
        which::which_in(program, Some(&self.search_path), "/")
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }

    fn build_command(&self, inv: &Invocation) -> Command {
        let program = self
            .resolve_program(&inv.program)
            .unwrap_or_else(|| inv.program.clone());

        let mut command = if inv.elevate && self.elevation == Elevation::Sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(&program);
            c
        } else {
            Command::new(&program)
        };
        command.args(&inv.args);
        command.env("PATH", &self.search_path);
        // Forwarded by sudo only when kept in sudoers
        for (key, value) in ENV_OVERLAY {
            command.env(key, value);
        }
        command
    }

    fn render(&self, inv: &Invocation) -> String {
        if inv.elevate && self.elevation == Elevation::Sudo {
            format!("sudo -n {}", inv)
        } else {
            inv.to_string()
        }
    }
}

impl Executor for CommandRunner {
    fn execute(&self, inv: &Invocation) -> Result<CommandOutput> {
        debug!("Executing: {}", self.render(inv));

        if self.dry_run {
            log_dry_run(inv);
            return Ok(CommandOutput::with_stdout(
                inv.bind.map(placeholder).unwrap_or_default(),
            ));
        }

        let mut command = self.build_command(inv);
        command
            .stdin(if inv.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                LvmRootfsError::CommandNotFound(inv.program.clone())
            } else {
                LvmRootfsError::Io(e)
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (&inv.stdin, child.stdin.take()) {
            // The child may exit before reading everything
            if let Err(e) = stdin.write_all(input.as_bytes()) {
                if e.kind() != ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output()?;
        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !output.status.success() {
            warn!(
                "Command failed: {}\n  stderr: {}",
                self.render(inv),
                result.stderr.trim()
            );
            return Err(LvmRootfsError::CommandFailed {
                command: inv.to_string(),
                exit_code: output.status.code(),
                stderr: result.stderr,
            });
        }

        Ok(result)
    }

    fn probe(&self, inv: &Invocation, timeout: Duration) -> ProbeOutcome {
        if self.dry_run {
            log_dry_run(inv);
            return ProbeOutcome::Exited {
                code: 0,
                first_line: String::new(),
            };
        }

        // sudo reports a missing binary with exit code 1, which would pass
        if self.resolve_program(&inv.program).is_none() {
            return ProbeOutcome::NotFound;
        }

        let mut command = self.build_command(inv);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => return ProbeOutcome::NotFound,
            Err(e) => return ProbeOutcome::Failed(e.to_string()),
        };

        match child.wait_timeout(timeout) {
            Ok(Some(status)) => {
                let mut out = CommandOutput {
                    status: status.code().unwrap_or(-1),
                    ..Default::default()
                };
                if let Some(mut stdout) = child.stdout.take() {
                    let _ = stdout.read_to_string(&mut out.stdout);
                }
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = stderr.read_to_string(&mut out.stderr);
                }
                ProbeOutcome::Exited {
                    code: out.status,
                    first_line: out.first_line(),
                }
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                ProbeOutcome::TimedOut
            }
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }

    fn wait_for_nodes(&self, nodes: &[String], settle: Duration) -> Result<()> {
        if self.dry_run {
            println!("  [dry-run] wait for {}", nodes.join(" "));
            return Ok(());
        }
        require_nodes(self, nodes, settle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_defaults_when_missing() {
        assert_eq!(search_path(None), DEFAULT_PATH);
        assert_eq!(search_path(Some("")), DEFAULT_PATH);
    }

    #[test]
    fn search_path_prepends_sbin_when_absent() {
        assert_eq!(
            search_path(Some("/home/u/bin:/usr/bin")),
            "/usr/sbin:/usr/bin:/sbin:/bin:/home/u/bin:/usr/bin"
        );
    }

    #[test]
    fn search_path_kept_when_sbin_present() {
        let p = "/usr/local/sbin:/usr/bin";
        assert_eq!(search_path(Some(p)), p);
    }

    #[test]
    fn display_omits_stdin() {
        let inv = Invocation::new("cryptsetup")
            .args(["open", "/dev/loop0p3", "cryptroot"])
            .stdin("secret\n");
        assert_eq!(inv.to_string(), "cryptsetup open /dev/loop0p3 cryptroot");
        assert!(!format!("{}", inv).contains("secret"));
    }

    #[test]
    fn probe_outcome_accepts_zero_and_one() {
        let ok = |code| ProbeOutcome::Exited {
            code,
            first_line: String::new(),
        };
        assert!(ok(0).is_reachable());
        assert!(ok(1).is_reachable());
        assert!(!ok(2).is_reachable());
        assert!(!ProbeOutcome::TimedOut.is_reachable());
        assert!(!ProbeOutcome::NotFound.is_reachable());
    }

    #[test]
    fn absolute_programs_resolve_to_themselves() {
        let runner = CommandRunner::new(true).with_elevation(Elevation::None);
        assert_eq!(
            runner.resolve_program("/usr/sbin/sgdisk").as_deref(),
            Some("/usr/sbin/sgdisk")
        );
    }

    #[test]
    fn dry_run_returns_bound_placeholder() {
        let runner = CommandRunner::new(true).with_elevation(Elevation::None);
        let inv = Invocation::new("losetup")
            .args(["--find", "--show", "/tmp/disk.img"])
            .binds("LOOP_DEVICE");
        let out = runner.execute(&inv).unwrap();
        assert_eq!(out.stdout_trimmed(), "${LOOP_DEVICE}");
    }

    #[test]
    fn env_overlay_is_set_on_the_spawned_process() {
        let overlay = |c: &Command| {
            c.get_envs()
                .any(|(k, v)| k == "LVM_SUPPRESS_FD_WARNINGS" && v == Some("1".as_ref()))
        };
        let inv = Invocation::new("/usr/sbin/lvm").arg("version");

        let direct = CommandRunner::new(false).with_elevation(Elevation::None);
        let c = direct.build_command(&inv);
        assert_eq!(c.get_program(), "/usr/sbin/lvm");
        assert!(overlay(&c));

        let sudo = CommandRunner::new(false).with_elevation(Elevation::Sudo);
        let c = sudo.build_command(&inv);
        assert_eq!(c.get_program(), "sudo");
        let args: Vec<_> = c.get_args().collect();
        assert_eq!(args, ["-n", "/usr/sbin/lvm", "version"]);
        assert!(overlay(&c));
    }

    #[test]
    fn first_line_falls_back_to_stderr() {
        let out = CommandOutput {
            status: 1,
            stdout: "\n".to_string(),
            stderr: "mkfs.fat 4.2 (2021-01-31)\nmore".to_string(),
        };
        assert_eq!(out.first_line(), "mkfs.fat 4.2 (2021-01-31)");
    }
}
