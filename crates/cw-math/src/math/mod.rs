//! Core math modules.

pub mod window;
