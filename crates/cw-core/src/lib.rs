//! cpuwatch Core Library
//!
//! Watches a long-running process reporter (`top`), rebuilds discrete
//! snapshots from its undelimited output, smooths the subject's CPU usage
//! over a sliding window and escalates from warnings to a graceful stop
//! request to a forced kill.
//!
//! The binary entry point is in `main.rs`.

pub mod action;
pub mod collect;
pub mod config;
pub mod daemon;
pub mod exit_codes;
pub mod logging;
pub mod metrics;
pub mod script;
pub mod subject;
