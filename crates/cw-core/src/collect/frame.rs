//! Frame collector: turns the endless output of a periodic reporter into
//! discrete, parsed frames.
//!
//! Three threads cooperate:
//!
//! 1. The supervisor copies the producer's stdout through a
//!    [`HeartbeatWriter`] into a shared buffer, then waits for the producer
//!    to exit and records why it stopped.
//! 2. The heartbeat watcher (owned by the writer) posts an [`Idle`] whenever
//!    output pauses.
//! 3. The publisher takes the buffer on each idle notification, parses it
//!    outside the lock, and posts the result to a latest-value-wins mailbox.
//!
//! The buffer lock is held only to append or to swap the contents out, never
//! across a parse.

use super::heartbeat::{HeartbeatWriter, Idle};
use super::mailbox::Mailbox;
use super::top::{self, FrameError, STATS_COLUMNS};
use super::types::Frame;
use chrono::Utc;
use std::io::{self, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on bytes buffered for a single burst.
pub const MAX_BURST_BYTES: usize = 4 * 1024 * 1024;

/// Errors from the frame collector.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("idle threshold {idle_after:?} must be shorter than the polling interval {poll_interval:?}")]
    IdleNotShorter {
        idle_after: Duration,
        poll_interval: Duration,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("reading producer output failed: {0}")]
    Read(#[source] io::Error),

    #[error("producer exited: {status}")]
    ProducerExited { status: String },

    #[error(transparent)]
    Format(#[from] FrameError),

    #[error("collector shut down")]
    Closed,
}

impl From<CollectError> for cw_common::Error {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::IdleNotShorter { .. } => cw_common::Error::Construction(err.to_string()),
            CollectError::Format(inner) => inner.into(),
            other => cw_common::Error::Producer(other.to_string()),
        }
    }
}

/// External command whose stdout is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProducerSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `top -l 0 -s <secs> -stats pid,cpu,th,pstate,time,pageins,command`.
    ///
    /// `top` only accepts whole seconds; sub-second intervals round up to 1.
    pub fn top(interval: Duration) -> Self {
        let secs = interval.as_secs().max(1);
        Self::new(
            "top",
            vec![
                "-l".to_string(),
                "0".to_string(),
                "-s".to_string(),
                secs.to_string(),
                "-stats".to_string(),
                STATS_COLUMNS.to_string(),
            ],
        )
    }
}

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub producer: ProducerSpec,
    /// How often the producer emits a burst.
    pub poll_interval: Duration,
    /// Quiet time that ends a burst.
    pub idle_after: Duration,
}

impl CollectorConfig {
    pub fn new(
        producer: ProducerSpec,
        poll_interval: Duration,
        idle_after: Duration,
    ) -> Result<Self, CollectError> {
        if idle_after.is_zero() || idle_after >= poll_interval {
            return Err(CollectError::IdleNotShorter {
                idle_after,
                poll_interval,
            });
        }
        Ok(Self {
            producer,
            poll_interval,
            idle_after,
        })
    }
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

#[derive(Clone, Default)]
struct BurstBuffer(Arc<Mutex<Vec<u8>>>);

impl BurstBuffer {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }
}

impl Write for BurstBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.lock();
        let room = MAX_BURST_BYTES.saturating_sub(bytes.len());
        if buf.len() > room {
            warn!(
                dropped = buf.len() - room,
                limit = MAX_BURST_BYTES,
                "burst exceeds buffer limit"
            );
        }
        bytes.extend_from_slice(&buf[..buf.len().min(room)]);
        // Report everything as written so the copy never stalls.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Shared {
    frames: Mailbox<Frame>,
    failure: Mutex<Option<CollectError>>,
    stopping: AtomicBool,
    /// Set once the producer has been waited for; its pid may be reused.
    reaped: Mutex<bool>,
}

impl Shared {
    fn new() -> Self {
        Self {
            frames: Mailbox::new(),
            failure: Mutex::new(None),
            stopping: AtomicBool::new(false),
            reaped: Mutex::new(false),
        }
    }

    fn reaped(&self) -> MutexGuard<'_, bool> {
        self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// SIGTERM the producer's group unless it has already been reaped.
    ///
    /// The reaped lock is held across the signal so the supervisor cannot
    /// release the pid in between.
    fn signal_producer(&self, pid: u32) -> bool {
        let reaped = self.reaped();
        if *reaped {
            debug!(pid, "producer already reaped; not signalling");
            return false;
        }
        terminate(pid);
        true
    }

    /// Ask the producer to stop. Only the first call signals.
    fn stop(&self, pid: u32) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(pid, "stopping producer");
        self.signal_producer(pid)
    }

    /// Record why collection ended. The first failure wins.
    fn fail(&self, err: CollectError) {
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_failure(&self) -> CollectError {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(CollectError::Closed)
    }
}

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

/// Running producer plus the threads that frame its output.
pub struct FrameCollector {
    shared: Arc<Shared>,
    pid: u32,
}

impl FrameCollector {
    /// Start the producer and begin framing its output.
    pub fn spawn(config: &CollectorConfig) -> Result<Self, CollectError> {
        let spec = &config.producer;
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| CollectError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                terminate(pid);
                let _ = child.wait();
                return Err(CollectError::Read(io::Error::new(
                    io::ErrorKind::Other,
                    "producer stdout was not captured",
                )));
            }
        };

        info!(
            pid,
            program = %spec.program,
            interval_ms = config.poll_interval.as_millis() as u64,
            idle_ms = config.idle_after.as_millis() as u64,
            "producer started"
        );

        let shared = Arc::new(Shared::new());
        let buffer = BurstBuffer::default();
        let (writer, idle) = HeartbeatWriter::new(buffer.clone(), config.idle_after);

        {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cw-supervisor".to_string())
                .spawn(move || supervise(child, stdout, writer, &shared))
                .map_err(CollectError::Read)?;
        }
        {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("cw-publisher".to_string())
                .spawn(move || publish(idle, buffer, &shared, pid))
                .map_err(CollectError::Read)?;
        }

        Ok(Self { shared, pid })
    }

    pub fn producer_pid(&self) -> u32 {
        self.pid
    }

    /// Block until the next frame.
    ///
    /// Frames not taken before a newer one is ready are dropped. Once the
    /// producer has stopped and the last frame is taken, returns the reason
    /// it stopped.
    pub fn next_frame(&self) -> Result<Frame, CollectError> {
        match self.shared.frames.recv() {
            Some(frame) => Ok(frame),
            None => Err(self.shared.take_failure()),
        }
    }

    /// Like [`next_frame`](Self::next_frame) but returns `Ok(None)` after
    /// `timeout` with no frame.
    pub fn next_frame_timeout(&self, timeout: Duration) -> Result<Option<Frame>, CollectError> {
        if let Some(frame) = self.shared.frames.recv_timeout(timeout) {
            return Ok(Some(frame));
        }
        self.try_next_frame()
    }

    /// Take a ready frame without waiting.
    pub fn try_next_frame(&self) -> Result<Option<Frame>, CollectError> {
        if let Some(frame) = self.shared.frames.try_take() {
            return Ok(Some(frame));
        }
        if self.shared.frames.is_closed() {
            return Err(self.shared.take_failure());
        }
        Ok(None)
    }

    /// Ask the producer to exit. Collection threads wind down once its
    /// output closes; later calls to `next_frame` report `Closed`.
    ///
    /// Returns whether a signal was sent. A producer that already exited
    /// and was reaped is never signalled.
    pub fn shutdown(&self) -> bool {
        self.shared.stop(self.pid)
    }

    /// Handle that can stop the collector from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::clone(&self.shared),
            pid: self.pid,
        }
    }
}

/// Cloneable, `Send` handle to [`FrameCollector::shutdown`].
#[derive(Clone)]
pub struct ShutdownHandle {
    shared: Arc<Shared>,
    pid: u32,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> bool {
        self.shared.stop(self.pid)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle").field("pid", &self.pid).finish()
    }
}

impl Drop for FrameCollector {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for FrameCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCollector")
            .field("pid", &self.pid)
            .field("closed", &self.shared.frames.is_closed())
            .finish()
    }
}

fn supervise(
    mut child: Child,
    mut stdout: ChildStdout,
    mut writer: HeartbeatWriter<BurstBuffer>,
    shared: &Shared,
) {
    let copied = io::copy(&mut stdout, &mut writer);
    // Ends the heartbeat watcher, which in turn ends the publisher.
    drop(writer);
    wait_exited(child.id());
    let status = {
        let mut reaped = shared.reaped();
        let status = child.wait();
        *reaped = true;
        status
    };

    if shared.stopping.load(Ordering::SeqCst) {
        debug!(pid = child.id(), "producer stopped on request");
        shared.fail(CollectError::Closed);
    } else {
        let err = match (copied, status) {
            (Err(e), _) | (_, Err(e)) => CollectError::Read(e),
            (Ok(_), Ok(status)) => CollectError::ProducerExited {
                status: status.to_string(),
            },
        };
        error!(pid = child.id(), error = %err, "producer ended");
        shared.fail(err);
    }
    shared.frames.close();
}

fn publish(idle: Mailbox<Idle>, buffer: BurstBuffer, shared: &Shared, pid: u32) {
    let mut warmed_up = false;
    let mut sequence = 0u64;

    while let Some(Idle { at }) = idle.recv() {
        let bytes = buffer.take();
        if bytes.is_empty() {
            trace!("idle with nothing buffered");
            continue;
        }
        if !warmed_up {
            // The first sample from `top` reports bogus CPU figures.
            warmed_up = true;
            debug!(bytes = bytes.len(), "discarding first burst");
            continue;
        }

        let text = String::from_utf8_lossy(&bytes);
        match top::parse_frame(&text) {
            Ok(parsed) => {
                sequence += 1;
                let frame = Frame {
                    sequence,
                    captured_at: Utc::now(),
                    processes: parsed.processes,
                    skipped_rows: parsed.skipped_rows,
                };
                trace!(
                    sequence,
                    rows = frame.processes.len(),
                    skipped = frame.skipped_rows,
                    lag_ms = at.elapsed().as_millis() as u64,
                    "frame ready"
                );
                if shared.frames.post(frame) {
                    debug!(sequence, "consumer missed a frame");
                }
            }
            Err(e) => {
                error!(error = %e, "producer output format changed");
                shared.fail(e.into());
                shared.frames.close();
                shared.signal_producer(pid);
                return;
            }
        }
    }
}

/// SIGTERM the producer's process group.
#[cfg(unix)]
fn terminate(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc != 0 {
        trace!(pid, error = %io::Error::last_os_error(), "producer already gone");
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    warn!(pid, "producer termination is only supported on unix");
}

/// Block until the producer has exited without reaping it, so its pid stays
/// reserved until `Child::wait` runs under the reaped lock.
#[cfg(unix)]
fn wait_exited(pid: u32) {
    let Ok(id) = libc::id_t::try_from(pid) else {
        return;
    };
    loop {
        // SAFETY: an all-zero siginfo_t is a valid out-parameter.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` is a live, writable siginfo_t.
        let rc = unsafe {
            libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT)
        };
        if rc == 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return;
        }
    }
}

#[cfg(not(unix))]
fn wait_exited(_pid: u32) {}
