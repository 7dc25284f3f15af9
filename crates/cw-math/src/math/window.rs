//! Fixed-capacity sliding window of scalar samples.
//!
//! The window is a ring buffer: once `capacity` samples have been appended,
//! each further append overwrites the oldest sample. Order statistics are
//! computed on a sorted copy so the ring itself is never reordered.

use thiserror::Error;

/// Errors raised when constructing a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window capacity must be greater than zero")]
    ZeroCapacity,
}

/// Ring buffer of the most recent `capacity` samples.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: Vec<f64>,
    cursor: usize,
    capacity: usize,
}

impl SlidingWindow {
    /// Create an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }
        Ok(Self {
            samples: Vec::with_capacity(capacity),
            cursor: 0,
            capacity,
        })
    }

    /// Append a sample, overwriting the oldest one once full.
    pub fn append(&mut self, sample: f64) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.cursor] = sample;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }

    /// Empty the window. Allocated capacity is kept.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once `capacity` samples have been gathered since the last reset.
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let split = if self.is_full() { self.cursor } else { 0 };
        let (newer, older) = self.samples.split_at(split);
        older.iter().chain(newer.iter()).copied()
    }

    /// Arithmetic mean. NaN when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Quantile `p` with linear interpolation between order statistics.
    ///
    /// - empty window: NaN
    /// - one sample: that sample, for any `p`
    /// - `p <= 0`: minimum; `p >= 1`: maximum
    /// - otherwise interpolates around rank `p * (len - 1)`
    pub fn quantile(&self, p: f64) -> f64 {
        match self.samples.len() {
            0 => return f64::NAN,
            1 => return self.samples[0],
            _ => {}
        }
        if p.is_nan() {
            return f64::NAN;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let last = sorted.len() - 1;

        if p <= 0.0 {
            return sorted[0];
        }
        if p >= 1.0 {
            return sorted[last];
        }

        let rank = p * last as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }

    pub fn median(&self) -> f64 {
        self.quantile(0.5)
    }

    /// Summary suitable for structured logs.
    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            len: self.len(),
            capacity: self.capacity,
            average: self.average(),
            median: self.median(),
        }
    }
}

/// Point-in-time summary of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub len: usize,
    pub capacity: usize,
    pub average: f64,
    pub median: f64,
}
