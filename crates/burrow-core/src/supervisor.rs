//! Daemon process supervision
//!
//! Spawns the daemon with arguments derived from [`Options`], merges its
//! stdout and stderr into one readable stream, and forwards termination-class
//! OS signals to it for as long as the owning client lives.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BurrowError;
use crate::options::Options;

/// Combined stdout + stderr of the running daemon
pub type DaemonOutput = Pin<Box<dyn AsyncRead + Send>>;

/// Signals that can be delivered to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    Hangup,
    Interrupt,
    Quit,
    Terminate,
    Kill,
}

/// Fail with `BinaryNotFound` unless `path` is an existing file with an
/// execute bit set
pub fn check_binary(path: &Path) -> Result<(), BurrowError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && is_executable(&meta) => Ok(()),
        _ => Err(BurrowError::BinaryNotFound {
            path: path.to_path_buf(),
        }),
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Owns one daemon subprocess
pub struct ProcessSupervisor {
    binary: PathBuf,
    child: Option<Child>,
    pid: Option<u32>,
    forwarder: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Create a supervisor for `binary`, which must already exist
    pub fn new(binary: impl Into<PathBuf>) -> Result<Self, BurrowError> {
        let binary = binary.into();
        check_binary(&binary)?;
        Ok(Self {
            binary,
            child: None,
            pid: None,
            forwarder: None,
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// PID of the daemon while it is running
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Poll the child and report whether it is still alive
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(pid = ?self.pid, %status, "Daemon exited");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to check daemon status");
                false
            }
        }
    }

    /// Register an account token with the daemon (`<binary> authtoken <token>`).
    ///
    /// No-op when `options` carries no token.
    pub async fn register_authtoken(&self, options: &Options) -> Result<(), BurrowError> {
        let Some(args) = options.authtoken_args() else {
            return Ok(());
        };
        check_binary(&self.binary)?;

        debug!(binary = %self.binary.display(), "Registering authtoken");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(BurrowError::Spawn)?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(BurrowError::AuthToken(stderr));
        }
        if !output.status.success() {
            return Err(BurrowError::AuthToken(format!(
                "authtoken command exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            info!("{}", stdout.trim());
        }
        Ok(())
    }

    /// Spawn the daemon and return its merged output stream.
    ///
    /// With `forward_signals` set, a forwarder runs until `cancel` fires; on
    /// a termination-class signal it relays the signal to the daemon,
    /// cancels `cancel` and exits this process. Without it, signals are left
    /// to the caller, which is expected to close tunnels and stop the daemon.
    pub fn start(
        &mut self,
        options: &Options,
        cancel: &CancellationToken,
        forward_signals: bool,
    ) -> Result<DaemonOutput, BurrowError> {
        if self.is_running() {
            return Err(BurrowError::Spawn(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("daemon already running with pid {:?}", self.pid),
            )));
        }
        check_binary(&self.binary)?;

        let args = options.daemon_args();
        debug!(binary = %self.binary.display(), args = ?args, "Spawning daemon");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BurrowError::Spawn)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BurrowError::Spawn(std::io::Error::other(
                "daemon output was not captured",
            )));
        };

        // A pid of 0 would address our whole process group
        let Some(pid) = child.id() else {
            return Err(BurrowError::Spawn(std::io::Error::other(
                "daemon exited before its pid could be read",
            )));
        };
        info!(pid, binary = %self.binary.display(), "Daemon spawned");

        if forward_signals {
            self.forwarder = Some(tokio::spawn(forward_then_exit(pid, cancel.clone())));
        } else {
            debug!(pid, "Signal handling left to the caller");
        }
        self.child = Some(child);
        self.pid = Some(pid);

        let merged = futures_util::stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr));
        Ok(Box::pin(StreamReader::new(merged)))
    }

    /// Forcibly terminate the daemon
    pub async fn stop(&mut self) -> Result<(), BurrowError> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = self.pid.take();

        if let Ok(Some(status)) = child.try_wait() {
            debug!(?pid, %status, "Daemon already exited");
            return Ok(());
        }

        info!(?pid, "Killing daemon");
        child
            .kill()
            .await
            .map_err(|e| BurrowError::Signal(format!("failed to kill daemon: {}", e)))
    }

    /// Deliver an arbitrary signal to the daemon
    pub fn signal(&mut self, signal: DaemonSignal) -> Result<(), BurrowError> {
        let Some(child) = self.child.as_mut() else {
            return Err(BurrowError::Signal("daemon is not running".to_string()));
        };

        if signal == DaemonSignal::Kill {
            return child
                .start_kill()
                .map_err(|e| BurrowError::Signal(e.to_string()));
        }

        let pid = self
            .pid
            .ok_or_else(|| BurrowError::Signal("daemon pid unknown".to_string()))?;
        send_signal(pid, signal)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: DaemonSignal) -> Result<(), BurrowError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        DaemonSignal::Hangup => Signal::SIGHUP,
        DaemonSignal::Interrupt => Signal::SIGINT,
        DaemonSignal::Quit => Signal::SIGQUIT,
        DaemonSignal::Terminate => Signal::SIGTERM,
        DaemonSignal::Kill => Signal::SIGKILL,
    };
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| BurrowError::Signal(format!("pid {} out of range", pid)))?;

    kill(Pid::from_raw(raw), sig).map_err(|e| BurrowError::Signal(e.to_string()))
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: DaemonSignal) -> Result<(), BurrowError> {
    Err(BurrowError::Signal(format!(
        "{:?} is not supported on this platform",
        signal
    )))
}

#[cfg(unix)]
async fn forward_then_exit(pid: u32, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hangup), Ok(mut interrupt), Ok(mut quit), Ok(mut terminate)) = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::quit()),
        signal(SignalKind::terminate()),
    ) else {
        warn!(pid, "Failed to install signal handlers, daemon signals will not be forwarded");
        return;
    };

    let received = tokio::select! {
        _ = cancel.cancelled() => return,
        _ = hangup.recv() => DaemonSignal::Hangup,
        _ = interrupt.recv() => DaemonSignal::Interrupt,
        _ = quit.recv() => DaemonSignal::Quit,
        _ = terminate.recv() => DaemonSignal::Terminate,
    };

    info!(pid, signal = ?received, "Forwarding signal to daemon");
    if let Err(e) = send_signal(pid, received) {
        warn!(pid, error = %e, "Failed to forward signal");
    }
    cancel.cancel();
    std::process::exit(1);
}

#[cfg(not(unix))]
async fn forward_then_exit(pid: u32, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(pid, error = %e, "Failed to listen for Ctrl+C");
                return;
            }
        }
    }

    info!(pid, "Received Ctrl+C");
    cancel.cancel();
    std::process::exit(1);
}

#[cfg(test)]
pub(crate) fn executable_tempfile() -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    file
}
