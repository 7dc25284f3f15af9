//! Write-activity heartbeat with idle notification.
//!
//! [`HeartbeatWriter`] wraps any [`Write`] sink. Every write forwards the
//! bytes and pulses a heartbeat to a watcher thread. The watcher is in one
//! of two states:
//!
//! - **Armed**: waiting for a heartbeat or for `idle_after` to elapse.
//!   On timeout it posts one [`Idle`] notification and becomes Stalled.
//! - **Stalled**: waiting for the next heartbeat, then Armed again with a
//!   fresh timer. Resuming is silent.
//!
//! Neither side ever blocks on the other: heartbeats use `try_send` on a
//! one-slot channel (a pulse already in flight covers a missed one) and idle
//! notifications go to a latest-value-wins [`Mailbox`].

use super::mailbox::Mailbox;
use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Notification that writes stopped for at least the idle duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Idle {
    /// When the watcher stalled.
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Armed,
    Stalled,
}

/// Writer that reports when it goes quiet.
#[derive(Debug)]
pub struct HeartbeatWriter<W> {
    inner: W,
    heartbeat: SyncSender<()>,
}

impl<W: Write> HeartbeatWriter<W> {
    /// Wrap `inner` and start the idle watcher.
    ///
    /// The returned mailbox receives one [`Idle`] per quiet period. The
    /// watcher thread exits, closing the mailbox, when the writer is dropped.
    pub fn new(inner: W, idle_after: Duration) -> (Self, Mailbox<Idle>) {
        let (heartbeat, beats) = mpsc::sync_channel::<()>(1);
        let idle = Mailbox::new();
        let notify = idle.clone();

        thread::spawn(move || {
            let mut state = WatchState::Armed;
            loop {
                state = match state {
                    WatchState::Armed => match beats.recv_timeout(idle_after) {
                        Ok(()) => WatchState::Armed,
                        Err(RecvTimeoutError::Timeout) => {
                            trace!(idle_ms = idle_after.as_millis() as u64, "writer stalled");
                            notify.post(Idle { at: Instant::now() });
                            WatchState::Stalled
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                    WatchState::Stalled => match beats.recv() {
                        Ok(()) => WatchState::Armed,
                        Err(_) => break,
                    },
                };
            }
            notify.close();
        });

        (Self { inner, heartbeat }, idle)
    }

    /// Signal activity without writing.
    pub fn pulse(&self) {
        // Full means a pulse is already queued; Disconnected means the
        // watcher is gone. Neither is worth reporting to the writer.
        let _ = self.heartbeat.try_send(());
    }
}

impl<W: Write> Write for HeartbeatWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pulse();
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
