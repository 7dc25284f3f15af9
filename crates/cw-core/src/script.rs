//! Short-lived helper commands run under a deadline.
//!
//! The state query and the quit request both shell out to `osascript`, which
//! can block indefinitely (for example on an automation-permission prompt).
//! [`run`] polls the child until it exits or the deadline passes, then kills
//! it so a stuck script never stalls the monitor.

use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn};

/// Default deadline for one helper invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(10);

/// Errors from running a helper command.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O with {program} failed: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// What a finished helper printed.
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...`, feeding `stdin` when given, and wait at most
/// `timeout` for it to exit.
pub fn run(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<ScriptOutput, ScriptError> {
    let io_err = |source| ScriptError::Io {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ScriptError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(text.as_bytes()) {
            kill(&mut child);
            return Err(io_err(e));
        }
    }

    let status = match wait_until(&mut child, timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(program, timeout_ms = timeout.as_millis() as u64, "helper timed out; killing");
            kill(&mut child);
            return Err(ScriptError::TimedOut {
                program: program.to_string(),
                timeout,
            });
        }
        Err(e) => {
            kill(&mut child);
            return Err(io_err(e));
        }
    };

    let output = ScriptOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    trace!(program, status = %output.status, "helper finished");
    Ok(output)
}

fn wait_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL);
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn captures_output_and_status() {
        let out = run("/bin/sh", &sh("echo out; echo err >&2; exit 2"), None, DEFAULT_TIMEOUT)
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.status.code(), Some(2));
    }

    #[test]
    fn feeds_stdin() {
        let out = run("/bin/cat", &[], Some("hello"), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(out.stdout, "hello");
        assert!(out.status.success());
    }

    #[test]
    fn stuck_helper_is_killed_at_deadline() {
        let start = Instant::now();
        let err = run("/bin/sleep", &["30".to_string()], None, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ScriptError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_program() {
        let err = run("/nonexistent/helper", &[], None, DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
    }
}
