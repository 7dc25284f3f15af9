//! Remediation actions: ask the subject to quit, or kill it.

use crate::script::{self, ScriptError};
use cw_common::ProcessId;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Errors during remediation.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("process {0} not found")]
    NotFound(ProcessId),

    #[error("permission denied signalling {0}")]
    PermissionDenied(ProcessId),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("action failed: {0}")]
    Failed(String),
}

impl From<ScriptError> for ActionError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Spawn { program, source } => ActionError::Spawn { program, source },
            ScriptError::TimedOut { program, timeout } => ActionError::TimedOut { program, timeout },
            io @ ScriptError::Io { .. } => ActionError::Failed(io.to_string()),
        }
    }
}

impl From<ActionError> for cw_common::Error {
    fn from(err: ActionError) -> Self {
        cw_common::Error::ActionFailed(err.to_string())
    }
}

/// Carries out the escalation's stop and kill decisions.
pub trait Remediator {
    /// Ask the application to quit on its own.
    fn request_stop(&self, subject: &str) -> Result<(), ActionError>;

    /// Terminate the process immediately.
    fn force_kill(&self, pid: ProcessId) -> Result<(), ActionError>;
}

/// Acts on the real system: AppleScript quit, `SIGKILL`.
#[derive(Debug, Clone)]
pub struct SystemRemediator {
    osascript: String,
    timeout: Duration,
}

impl Default for SystemRemediator {
    fn default() -> Self {
        Self {
            osascript: "/usr/bin/osascript".to_string(),
            timeout: script::DEFAULT_TIMEOUT,
        }
    }
}

impl SystemRemediator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different program to run the quit script.
    pub fn with_script_runner(mut self, program: impl Into<String>) -> Self {
        self.osascript = program.into();
        self
    }

    /// Give up on the quit script after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Remediator for SystemRemediator {
    fn request_stop(&self, subject: &str) -> Result<(), ActionError> {
        let args = ["-e".to_string(), quit_script(subject)];
        let output = script::run(&self.osascript, &args, None, self.timeout)?;
        if !output.status.success() {
            return Err(ActionError::Failed(format!(
                "{} exited with {}: {}",
                self.osascript,
                output.status,
                output.stderr.trim()
            )));
        }
        info!(subject, "asked to quit");
        Ok(())
    }

    #[cfg(unix)]
    fn force_kill(&self, pid: ProcessId) -> Result<(), ActionError> {
        let raw = i32::try_from(pid.0)
            .map_err(|_| ActionError::Failed(format!("pid {pid} out of range")))?;
        // SAFETY: kill has no memory-safety preconditions.
        let result = unsafe { libc::kill(raw, libc::SIGKILL) };
        if result == 0 {
            info!(%pid, "sent SIGKILL");
            return Ok(());
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(ActionError::NotFound(pid)),
            Some(libc::EPERM) => Err(ActionError::PermissionDenied(pid)),
            _ => Err(ActionError::Failed(err.to_string())),
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self, pid: ProcessId) -> Result<(), ActionError> {
        Err(ActionError::Failed(format!(
            "killing {pid} is only supported on unix"
        )))
    }
}

/// Logs what would happen and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRemediator;

impl Remediator for DryRunRemediator {
    fn request_stop(&self, subject: &str) -> Result<(), ActionError> {
        warn!(subject, "dry run: would ask to quit");
        Ok(())
    }

    fn force_kill(&self, pid: ProcessId) -> Result<(), ActionError> {
        warn!(%pid, "dry run: would send SIGKILL");
        Ok(())
    }
}

fn quit_script(app: &str) -> String {
    let app = app.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#"tell application "{app}" to quit"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_script_quotes_name() {
        assert_eq!(quit_script("Spotify"), r#"tell application "Spotify" to quit"#);
        assert_eq!(
            quit_script(r#"A "B""#),
            r#"tell application "A \"B\"" to quit"#
        );
    }

    #[test]
    fn dry_run_never_fails() {
        let r = DryRunRemediator;
        assert!(r.request_stop("Spotify").is_ok());
        assert!(r.force_kill(ProcessId(1)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn request_stop_runs_script_runner() {
        // `true -e <script>` exits 0 and ignores its arguments.
        let r = SystemRemediator::new().with_script_runner("true");
        assert!(r.request_stop("Spotify").is_ok());

        let r = SystemRemediator::new().with_script_runner("false");
        assert!(matches!(r.request_stop("Spotify"), Err(ActionError::Failed(_))));

        let r = SystemRemediator::new().with_script_runner("/nonexistent/osascript");
        assert!(matches!(
            r.request_stop("Spotify"),
            Err(ActionError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn hung_quit_script_times_out() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let runner = dir.path().join("osascript");
        std::fs::write(&runner, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&runner, std::fs::Permissions::from_mode(0o755)).unwrap();

        let r = SystemRemediator::new()
            .with_script_runner(runner.to_string_lossy())
            .with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = r.request_stop("Spotify").unwrap_err();
        assert!(matches!(err, ActionError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        let err: cw_common::Error = err.into();
        assert_eq!(err.category(), cw_common::ErrorCategory::Collaborator);
    }

    #[cfg(unix)]
    #[test]
    fn force_kill_terminates_child() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = ProcessId(child.id());
        SystemRemediator::new().force_kill(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        // Reaped, so the pid no longer exists.
        assert!(matches!(
            SystemRemediator::new().force_kill(pid),
            Err(ActionError::NotFound(_))
        ));
    }

    #[test]
    fn action_errors_are_collaborator_errors() {
        let err: cw_common::Error = ActionError::NotFound(ProcessId(7)).into();
        assert_eq!(err.category(), cw_common::ErrorCategory::Collaborator);
        assert!(err.is_fatal());
    }
}
