//! Frame collection.
//!
//! This module turns the output of a periodic reporter (`top -l 0`) into
//! discrete snapshots:
//! - Heartbeat writer that detects quiet periods in a byte stream
//! - Latest-value-wins mailbox used for idle and frame notifications
//! - Parser for one burst of `top` output
//! - Frame collector that supervises the reporter and publishes frames

pub mod frame;
pub mod heartbeat;
pub mod mailbox;
pub mod top;
mod types;

pub use frame::{
    CollectError, CollectorConfig, FrameCollector, ProducerSpec, ShutdownHandle, MAX_BURST_BYTES,
};
pub use heartbeat::{HeartbeatWriter, Idle};
pub use mailbox::Mailbox;
pub use top::{parse_frame, parse_row, FrameError, ParsedFrame, RowError, EXPECTED_HEADERS};
pub use types::{Frame, ProcessRecord, ValueError};
