//! Scripted stand-in for the tunneling daemon binary
//!
//! Writes a small shell script into a temporary directory. Invoked with
//! `start ...` it prints a log banner chosen by [`DaemonBehavior`] and then
//! stays alive; invoked with `authtoken ...` it succeeds or complains on
//! stderr. Every invocation appends its argument list to `args.log`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// What the fake daemon prints after `start`
#[derive(Debug, Clone)]
pub enum DaemonBehavior {
    /// Announce the control API on `control_addr`, then idle
    Ready { control_addr: String },
    /// Like `Ready`, but write the banner to stderr
    ReadyOnStderr { control_addr: String },
    /// Fail to bind the control API port
    PortInUse,
    /// Refuse to start because the account session limit is reached
    SessionLimit(u32),
    /// Keep running without ever announcing the control API
    Silent,
    /// Exit without printing anything useful
    Exit,
}

/// A fake daemon binary living in its own temporary directory
pub struct FakeDaemon {
    dir: TempDir,
    binary: PathBuf,
}

impl FakeDaemon {
    pub fn new(behavior: DaemonBehavior) -> Self {
        Self::build(behavior, None)
    }

    /// Like [`FakeDaemon::new`], but `authtoken` fails with `error` on stderr
    pub fn with_failing_authtoken(behavior: DaemonBehavior, error: &str) -> Self {
        Self::build(behavior, Some(error))
    }

    fn build(behavior: DaemonBehavior, authtoken_error: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create fake daemon directory");
        let binary = dir.path().join("ngrok");
        let args_log = dir.path().join("args.log");

        let authtoken = match authtoken_error {
            Some(error) => format!("  echo '{}' >&2\n  exit 1", error),
            None => "  echo 'Authtoken saved to configuration file.'\n  exit 0".to_string(),
        };

        let script = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> '{args_log}'\n\
             if [ \"$1\" = \"authtoken\" ]; then\n\
             {authtoken}\n\
             fi\n\
             {banner}\n",
            args_log = args_log.display(),
            authtoken = authtoken,
            banner = banner(&behavior),
        );

        // Written and closed before exec to avoid ETXTBSY
        std::fs::write(&binary, script).expect("Failed to write fake daemon");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to mark fake daemon executable");

        Self { dir, binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Argument lists of every invocation so far, one entry per run
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

fn banner(behavior: &DaemonBehavior) -> String {
    const PREFIX: &str = "t=2024-01-01T00:00:00+0000";
    match behavior {
        DaemonBehavior::Ready { control_addr } => format!(
            "echo '{p} lvl=info msg=\"no configuration paths supplied\"'\n\
             echo '{p} lvl=info msg=\"open config file\" path=/dev/null err=nil'\n\
             echo '{p} lvl=info msg=\"starting web service\" obj=web addr={addr}'\n\
             exec sleep 600",
            p = PREFIX,
            addr = control_addr,
        ),
        DaemonBehavior::ReadyOnStderr { control_addr } => format!(
            "echo '{p} lvl=info msg=\"starting web service\" obj=web addr={addr}' >&2\n\
             exec sleep 600",
            p = PREFIX,
            addr = control_addr,
        ),
        DaemonBehavior::PortInUse => format!(
            "echo '{p} lvl=eror msg=\"failed to start web service\" err=\"listen tcp 127.0.0.1:4040: bind: address already in use\"'\n\
             exec sleep 600",
            p = PREFIX,
        ),
        DaemonBehavior::SessionLimit(limit) => format!(
            "echo 'Your account is limited to {limit} simultaneous ngrok client session.'\n\
             echo 'Active ngrok client sessions in region us: {limit}'\n\
             exec sleep 600",
            limit = limit,
        ),
        DaemonBehavior::Silent => format!(
            "echo '{p} lvl=info msg=\"no configuration paths supplied\"'\nexec sleep 600",
            p = PREFIX,
        ),
        DaemonBehavior::Exit => format!(
            "echo '{p} lvl=info msg=\"no configuration paths supplied\"'\nexit 1",
            p = PREFIX,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_is_executable() {
        let daemon = FakeDaemon::new(DaemonBehavior::Exit);
        let mode = std::fs::metadata(daemon.binary()).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(daemon.invocations().is_empty());
    }
}
