//! Resolves and runs the local executables that exercise a device identity.
//!
//! Foreground launches block until the executable exits (optionally under a
//! hard wall-clock timeout). Background spawns hand back a process handle the
//! session coordinator can wait on or kill. Failures to start an executable
//! are terminal for the current test and never retried.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, field::display, warn};

/// Build configuration directory inserted on Windows.
pub const BUILD_CONFIGURATION: &str = "RelWithDebInfo";

/// Future returned by launcher operations.
pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LaunchError>> + Send + 'a>>;

/// Platform family, which decides the build output layout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    /// Multi-configuration generators nest output under the configuration.
    Windows,
    /// Single-configuration layout.
    Other,
}

impl Platform {
    /// Platform the binary was compiled for.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Resolves the path of a built executable.
///
/// `executable` may include directories relative to `base_dir`; on Windows
/// the build configuration directory is inserted before the file name and
/// `.exe` is appended.
#[must_use]
pub fn resolve_executable(
    platform: Platform,
    base_dir: &Utf8Path,
    executable: &str,
) -> Utf8PathBuf {
    let relative = Utf8Path::new(executable);
    let directory = relative
        .parent()
        .map_or_else(|| base_dir.to_path_buf(), |parent| base_dir.join(parent));
    let name = relative.file_name().unwrap_or(executable);
    match platform {
        Platform::Windows => directory
            .join(BUILD_CONFIGURATION)
            .join(format!("{name}.exe")),
        Platform::Other => directory.join(name),
    }
}

/// Everything needed to start one executable.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Executable path.
    pub program: Utf8PathBuf,
    /// Positional and flag arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Hard wall-clock limit for foreground launches.
    pub timeout: Option<Duration>,
}

impl LaunchSpec {
    /// Starts a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends a flag followed by its value.
    #[must_use]
    pub fn flag(self, name: &str, value: impl Into<String>) -> Self {
        self.arg(name).arg(value)
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the wall-clock timeout.
    #[must_use]
    pub const fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    /// Returns `true` when `flag` appears among the arguments.
    #[must_use]
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag)
    }

    /// Value following `flag`, if present.
    #[must_use]
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|index| self.args.get(index + 1))
            .map(String::as_str)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.program.as_std_path());
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    fn spawn_child(&self) -> Result<Child, LaunchError> {
        self.command().spawn().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                LaunchError::NotFound {
                    program: self.program.clone(),
                }
            } else {
                LaunchError::Spawn {
                    program: self.program.clone(),
                    message: err.to_string(),
                }
            }
        })
    }
}

// Arguments carry access tokens, so only their count is shown.
impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("program", &self.program)
            .field("args", &self.args.len())
            .field("env", &self.env.iter().map(|(key, _)| key).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Exit state of a finished executable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaunchOutcome {
    /// Exit code, `None` when terminated by a signal.
    pub exit_code: Option<i32>,
}

impl LaunchOutcome {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Errors raised while running a local executable.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LaunchError {
    /// The executable does not exist.
    #[error("executable not found: {program}")]
    NotFound {
        /// Resolved executable path.
        program: Utf8PathBuf,
    },
    /// The executable exists but could not be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Resolved executable path.
        program: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Waiting for the process failed.
    #[error("failed to wait for {program}: {message}")]
    Wait {
        /// Resolved executable path.
        program: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The process outlived its timeout and was killed.
    #[error("{program} did not exit within {} seconds", limit.as_secs())]
    TimedOut {
        /// Resolved executable path.
        program: Utf8PathBuf,
        /// Limit that was exceeded.
        limit: Duration,
    },
}

/// Runs an executable to completion.
pub trait Launcher: Send + Sync {
    /// Starts `spec` and waits for it to exit.
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a, LaunchOutcome>;
}

/// Handle on a process running in the background.
pub trait BackgroundProcess: Send {
    /// Waits for the process to exit.
    fn wait(&mut self) -> LaunchFuture<'_, LaunchOutcome>;

    /// Forcibly terminates the process and reaps it.
    fn kill(&mut self) -> LaunchFuture<'_, ()>;
}

/// Starts processes without waiting for them.
pub trait ProcessSpawner: Send + Sync {
    /// Handle type returned for each spawned process.
    type Process: BackgroundProcess;

    /// Starts `spec` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError`] when the executable cannot be started.
    fn spawn(&self, spec: &LaunchSpec) -> Result<Self::Process, LaunchError>;
}

/// Launcher backed by real operating system processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a LaunchSpec) -> LaunchFuture<'a, LaunchOutcome> {
        Box::pin(async move {
            debug!(program = display(&spec.program), "launching executable");
            let mut process = ChildProcess {
                program: spec.program.clone(),
                child: spec.spawn_child()?,
            };
            let Some(limit) = spec.timeout else {
                return process.wait().await;
            };

            if let Ok(outcome) = timeout(limit, process.wait()).await {
                return outcome;
            }
            if let Err(err) = process.kill().await {
                warn!(
                    program = display(&spec.program),
                    error = display(&err),
                    "failed to kill timed out process"
                );
            }
            Err(LaunchError::TimedOut {
                program: spec.program.clone(),
                limit,
            })
        })
    }
}

impl ProcessSpawner for ProcessLauncher {
    type Process = ChildProcess;

    fn spawn(&self, spec: &LaunchSpec) -> Result<Self::Process, LaunchError> {
        debug!(program = display(&spec.program), "spawning background executable");
        Ok(ChildProcess {
            program: spec.program.clone(),
            child: spec.spawn_child()?,
        })
    }
}

/// Background process backed by a tokio child.
#[derive(Debug)]
pub struct ChildProcess {
    program: Utf8PathBuf,
    child: Child,
}

impl BackgroundProcess for ChildProcess {
    fn wait(&mut self) -> LaunchFuture<'_, LaunchOutcome> {
        Box::pin(async move {
            let status = self.child.wait().await.map_err(|err| LaunchError::Wait {
                program: self.program.clone(),
                message: err.to_string(),
            })?;
            Ok(LaunchOutcome {
                exit_code: status.code(),
            })
        })
    }

    fn kill(&mut self) -> LaunchFuture<'_, ()> {
        Box::pin(async move {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }
            self.child.kill().await.map_err(|err| LaunchError::Wait {
                program: self.program.clone(),
                message: err.to_string(),
            })
        })
    }
}
