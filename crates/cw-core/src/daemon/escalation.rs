//! Breach counting and escalation for the monitored subject.
//!
//! Each frame the tracker receives the subject's CPU sample and its
//! discrete state, smooths the samples with a sliding-window statistic,
//! and decides what to do:
//!
//! ```text
//!            breach (b < K)             breach (b == K)
//!   Idle ─────────────────▶ Breaching ─────────────────▶ StopRequested
//!    ▲                         │                              │
//!    │      within threshold   │        breach (b == K + G)   │
//!    └─────────────────────────┴──────────── ForceKill ◀──────┘
//! ```
//!
//! An absent subject resets everything. A foreground subject is left alone
//! unless `force` is set.

use crate::collect::{ProcessRecord, ValueError};
use crate::subject::{ProbeError, StateProbe, SubjectState};
use cw_common::ProcessId;
use cw_math::SlidingWindow;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the window is reduced to one value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Statistic {
    Mean,
    Median,
    /// Quantile in `[0, 1]`, written as a percentile (`p90`).
    Quantile(f64),
}

impl Statistic {
    pub fn apply(&self, window: &SlidingWindow) -> f64 {
        match self {
            Statistic::Mean => window.average(),
            Statistic::Median => window.median(),
            Statistic::Quantile(p) => window.quantile(*p),
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Statistic::Mean => f.write_str("mean"),
            Statistic::Median => f.write_str("median"),
            Statistic::Quantile(p) => {
                let pct = (p * 100.0 * 1e6).round() / 1e6;
                write!(f, "p{pct}")
            }
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" | "avg" | "average" => Ok(Statistic::Mean),
            "median" => Ok(Statistic::Median),
            other => {
                let pct: f64 = other
                    .strip_prefix('p')
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| format!("unknown statistic {s:?} (use mean, median or pNN)"))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentile {pct} outside 0..=100"));
                }
                Ok(Statistic::Quantile(pct / 100.0))
            }
        }
    }
}

impl TryFrom<String> for Statistic {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Statistic> for String {
    fn from(value: Statistic) -> Self {
        value.to_string()
    }
}

/// Escalation policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EscalationConfig {
    /// Samples needed before the statistic is trusted.
    pub window: usize,
    /// CPU threshold while the subject sits in the background.
    pub idle_threshold: f64,
    /// CPU threshold while it is playing, or in the foreground under `force`.
    pub busy_threshold: f64,
    pub statistic: Statistic,
    /// Breaches before a graceful stop is requested (K).
    pub breach_allowance: u32,
    /// Further breaches tolerated after the stop request (G).
    pub grace_ticks: u32,
    /// Act even when the subject is in the foreground.
    pub force: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            window: 5,
            idle_threshold: 8.0,
            busy_threshold: 25.0,
            statistic: Statistic::Median,
            breach_allowance: 3,
            grace_ticks: 2,
            force: false,
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> Result<(), EscalationError> {
        let invalid = |msg: String| Err(EscalationError::InvalidConfig(msg));
        if self.window == 0 {
            return invalid("window must hold at least one sample".to_string());
        }
        for (name, value) in [
            ("idle_threshold", self.idle_threshold),
            ("busy_threshold", self.busy_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be a finite, non-negative number, got {value}"));
            }
        }
        if self.breach_allowance == 0 {
            return invalid("breach_allowance must be at least 1".to_string());
        }
        if self.grace_ticks == 0 {
            return invalid("grace_ticks must be at least 1".to_string());
        }
        if let Statistic::Quantile(p) = self.statistic {
            if !(0.0..=1.0).contains(&p) {
                return invalid(format!("quantile {p} outside [0, 1]"));
            }
        }
        Ok(())
    }

    /// Threshold for `state`, or `None` when the state is not actionable.
    pub fn threshold_for(&self, state: SubjectState) -> Option<f64> {
        match state {
            SubjectState::Foreground if !self.force => None,
            SubjectState::Foreground | SubjectState::Playing => Some(self.busy_threshold),
            SubjectState::Stopped
            | SubjectState::Paused
            | SubjectState::Closing
            | SubjectState::Closed => Some(self.idle_threshold),
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors from one evaluation tick.
#[derive(Debug, Error)]
pub enum EscalationError {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("state query failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("invalid escalation config: {0}")]
    InvalidConfig(String),
}

impl From<EscalationError> for cw_common::Error {
    fn from(err: EscalationError) -> Self {
        match err {
            EscalationError::Value(e) => e.into(),
            EscalationError::Probe(e) => e.into(),
            EscalationError::InvalidConfig(msg) => cw_common::Error::Construction(msg),
        }
    }
}

/// What the caller should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    /// Log only.
    Warn,
    RequestStop,
    ForceKill,
}

/// Resting state of the tracker after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Breaching,
    StopRequested,
}

/// Why the tracker chose its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    SubjectAbsent,
    Foreground,
    /// Window not yet full.
    WarmingUp,
    WithinThreshold,
    Breach,
    AllowanceExhausted,
    AwaitingStop,
    GraceExhausted,
}

/// One tick's input for a present subject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub pid: ProcessId,
    pub cpu: f64,
    pub state: SubjectState,
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
    pub phase: Phase,
    pub pid: Option<ProcessId>,
    pub state: Option<SubjectState>,
    pub cpu: Option<f64>,
    /// Smoothed value, when one was computed.
    pub statistic: Option<f64>,
    pub threshold: Option<f64>,
    pub samples: usize,
    pub breaches: u32,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owns the sample window and the breach state.
#[derive(Debug, Clone)]
pub struct EscalationTracker {
    config: EscalationConfig,
    window: SlidingWindow,
    breaches: u32,
    stop_requested: bool,
}

impl EscalationTracker {
    pub fn new(config: EscalationConfig) -> Result<Self, EscalationError> {
        config.validate()?;
        let window = SlidingWindow::new(config.window)
            .map_err(|e| EscalationError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            window,
            breaches: 0,
            stop_requested: false,
        })
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn breaches(&self) -> u32 {
        self.breaches
    }

    pub fn phase(&self) -> Phase {
        if self.stop_requested {
            Phase::StopRequested
        } else if self.breaches > 0 {
            Phase::Breaching
        } else {
            Phase::Idle
        }
    }

    /// Forget all samples and breaches.
    pub fn reset(&mut self) {
        self.window.reset();
        self.breaches = 0;
        self.stop_requested = false;
    }

    /// Evaluate one frame's subject record.
    ///
    /// The CPU value and pid are parsed and the probe is queried before any
    /// state changes, so a failed tick leaves the tracker untouched.
    pub fn evaluate(
        &mut self,
        subject: Option<&ProcessRecord>,
        probe: &dyn StateProbe,
    ) -> Result<Decision, EscalationError> {
        let observation = match subject {
            None => None,
            Some(record) => {
                let cpu = record.cpu_percent()?;
                let pid = record.pid()?;
                let state = probe.query()?;
                Some(Observation { pid, cpu, state })
            }
        };
        Ok(self.step(observation))
    }

    /// Apply one tick.
    pub fn step(&mut self, observation: Option<Observation>) -> Decision {
        let Some(obs) = observation else {
            self.reset();
            return self.decision(Action::None, Reason::SubjectAbsent, None, None, None);
        };

        let Some(threshold) = self.config.threshold_for(obs.state) else {
            return self.decision(Action::None, Reason::Foreground, Some(obs), None, None);
        };

        self.window.append(obs.cpu);
        let value = self.config.statistic.apply(&self.window);

        if !self.window.is_full() {
            return self.decision(
                Action::None,
                Reason::WarmingUp,
                Some(obs),
                Some(value),
                Some(threshold),
            );
        }

        if value <= threshold {
            self.breaches = 0;
            self.stop_requested = false;
            return self.decision(
                Action::None,
                Reason::WithinThreshold,
                Some(obs),
                Some(value),
                Some(threshold),
            );
        }

        self.breaches = self.breaches.saturating_add(1);
        let allowance = self.config.breach_allowance;
        let (action, reason) = if !self.stop_requested {
            if self.breaches < allowance {
                (Action::Warn, Reason::Breach)
            } else {
                self.stop_requested = true;
                (Action::RequestStop, Reason::AllowanceExhausted)
            }
        } else if self.breaches >= allowance.saturating_add(self.config.grace_ticks) {
            (Action::ForceKill, Reason::GraceExhausted)
        } else {
            (Action::Warn, Reason::AwaitingStop)
        };

        let decision = self.decision(action, reason, Some(obs), Some(value), Some(threshold));
        if action == Action::ForceKill {
            self.reset();
            return Decision {
                phase: self.phase(),
                ..decision
            };
        }
        decision
    }

    fn decision(
        &self,
        action: Action,
        reason: Reason,
        obs: Option<Observation>,
        statistic: Option<f64>,
        threshold: Option<f64>,
    ) -> Decision {
        Decision {
            action,
            reason,
            phase: self.phase(),
            pid: obs.map(|o| o.pid),
            state: obs.map(|o| o.state),
            cpu: obs.map(|o| o.cpu),
            statistic,
            threshold,
            samples: self.window.len(),
            breaches: self.breaches,
        }
    }
}
