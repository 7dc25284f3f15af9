//! cpuwatch math utilities.

pub mod math;

pub use math::window::*;
