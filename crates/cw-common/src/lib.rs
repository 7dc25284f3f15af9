//! cpuwatch common types and errors.
//!
//! Used by the core crate and its binary:
//! - Error taxonomy with categories and exit-code hints
//! - Process identity newtype

pub mod error;
pub mod id;

pub use error::{Error, ErrorCategory, Result};
pub use id::ProcessId;
