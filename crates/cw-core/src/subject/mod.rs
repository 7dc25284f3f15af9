//! Discrete lifecycle state of the monitored application.
//!
//! The state comes from an external script that prints one label. On macOS
//! this is an AppleScript run through `osascript`; tests and non-macOS dry
//! runs use [`FixedProbe`].

use crate::script::{self, ScriptError};
use serde::{Deserialize, Serialize};
use std::io;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// Errors from querying the subject's state.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("state script I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("{program} gave no state within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("state script exited with {status}: {stderr}")]
    ScriptFailed { status: String, stderr: String },

    #[error("unknown state label {0:?}")]
    UnknownLabel(String),
}

impl From<ScriptError> for ProbeError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Spawn { program, source } => ProbeError::Spawn { program, source },
            ScriptError::TimedOut { program, timeout } => ProbeError::TimedOut { program, timeout },
            ScriptError::Io { source, .. } => ProbeError::Io(source),
        }
    }
}

impl From<ProbeError> for cw_common::Error {
    fn from(err: ProbeError) -> Self {
        cw_common::Error::StateQuery(err.to_string())
    }
}

/// What the application is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectState {
    /// Frontmost window; the user is interacting with it.
    Foreground,
    Stopped,
    Playing,
    Paused,
    Closing,
    Closed,
}

impl SubjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectState::Foreground => "foreground",
            SubjectState::Stopped => "stopped",
            SubjectState::Playing => "playing",
            SubjectState::Paused => "paused",
            SubjectState::Closing => "closing",
            SubjectState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SubjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectState {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            // Older state scripts printed "active" for the frontmost app.
            "foreground" | "active" => Ok(SubjectState::Foreground),
            "stopped" => Ok(SubjectState::Stopped),
            "playing" => Ok(SubjectState::Playing),
            "paused" => Ok(SubjectState::Paused),
            "closing" => Ok(SubjectState::Closing),
            "closed" => Ok(SubjectState::Closed),
            other => Err(ProbeError::UnknownLabel(other.to_string())),
        }
    }
}

/// Source of the subject's current state.
pub trait StateProbe {
    fn query(&self) -> Result<SubjectState, ProbeError>;
}

/// Runs an external program and maps its trimmed stdout to a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptProbe {
    pub program: String,
    pub args: Vec<String>,
    /// Fed to the program on stdin when set.
    pub script: Option<String>,
    /// The query fails if the program runs longer.
    pub timeout: Duration,
}

impl ScriptProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            script: None,
            timeout: script::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// AppleScript state check for `app` run through `/usr/bin/osascript`.
    pub fn osascript(app: &str) -> Self {
        Self::new("/usr/bin/osascript", Vec::new()).with_script(state_script(app))
    }
}

impl StateProbe for ScriptProbe {
    fn query(&self) -> Result<SubjectState, ProbeError> {
        let output = script::run(
            &self.program,
            &self.args,
            self.script.as_deref(),
            self.timeout,
        )?;
        if !output.status.success() {
            return Err(ProbeError::ScriptFailed {
                status: output.status.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        trace!(program = %self.program, label = %output.stdout.trim(), "state probed");
        output.stdout.parse()
    }
}

/// Always reports the same state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedProbe(pub SubjectState);

impl StateProbe for FixedProbe {
    fn query(&self) -> Result<SubjectState, ProbeError> {
        Ok(self.0)
    }
}

fn state_script(app: &str) -> String {
    let app = app.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"if application "{app}" is frontmost then
	return "foreground"
end if
if application "{app}" is running then
	tell application "{app}"
		return player state as string
	end tell
else
	return "closed"
end if
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for state in [
            SubjectState::Foreground,
            SubjectState::Stopped,
            SubjectState::Playing,
            SubjectState::Paused,
            SubjectState::Closing,
            SubjectState::Closed,
        ] {
            assert_eq!(state.as_str().parse::<SubjectState>().unwrap(), state);
        }
    }

    #[test]
    fn parse_trims_and_accepts_legacy_label() {
        assert_eq!(
            "playing\n".parse::<SubjectState>().unwrap(),
            SubjectState::Playing
        );
        assert_eq!(
            "active".parse::<SubjectState>().unwrap(),
            SubjectState::Foreground
        );
        assert!(matches!(
            "buffering".parse::<SubjectState>(),
            Err(ProbeError::UnknownLabel(label)) if label == "buffering"
        ));
    }

    #[test]
    fn state_script_names_app() {
        let script = state_script("Spotify");
        assert!(script.contains(r#"if application "Spotify" is frontmost then"#));
        assert!(script.contains("player state as string"));
        assert!(state_script(r#"Odd "App""#).contains(r#"application "Odd \"App\"""#));
    }

    #[test]
    fn osascript_probe_feeds_script_on_stdin() {
        let probe = ScriptProbe::osascript("Spotify");
        assert_eq!(probe.program, "/usr/bin/osascript");
        assert!(probe.args.is_empty());
        assert!(probe.script.unwrap().contains("Spotify"));
    }

    #[cfg(unix)]
    #[test]
    fn script_probe_reads_stdout() {
        let probe = ScriptProbe::new("/bin/sh", vec!["-c".into(), "echo paused".into()]);
        assert_eq!(probe.query().unwrap(), SubjectState::Paused);
    }

    #[cfg(unix)]
    #[test]
    fn script_probe_passes_stdin() {
        let probe = ScriptProbe::new("/bin/sh", Vec::new()).with_script("echo stopped\n");
        assert_eq!(probe.query().unwrap(), SubjectState::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn script_probe_reports_failure() {
        let probe = ScriptProbe::new(
            "/bin/sh",
            vec!["-c".into(), "echo nope >&2; exit 3".into()],
        );
        match probe.query().unwrap_err() {
            ProbeError::ScriptFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other:?}"),
        }
        let err: cw_common::Error = probe.query().unwrap_err().into();
        assert_eq!(err.category(), cw_common::ErrorCategory::Collaborator);
    }

    #[cfg(unix)]
    #[test]
    fn hung_state_script_times_out() {
        let probe = ScriptProbe::new("/bin/sh", vec!["-c".into(), "sleep 30".into()])
            .with_timeout(Duration::from_millis(200));
        let err = probe.query().unwrap_err();
        assert!(matches!(err, ProbeError::TimedOut { .. }));
        let err: cw_common::Error = err.into();
        assert_eq!(err.category(), cw_common::ErrorCategory::Collaborator);
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let probe = ScriptProbe::new("/nonexistent/cpuwatch-state", Vec::new());
        assert!(matches!(probe.query(), Err(ProbeError::Spawn { .. })));
    }

    #[test]
    fn fixed_probe() {
        assert_eq!(
            FixedProbe(SubjectState::Closing).query().unwrap(),
            SubjectState::Closing
        );
    }
}
