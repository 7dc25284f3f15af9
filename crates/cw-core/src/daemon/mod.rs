//! Monitor loop.
//!
//! Each frame the monitor:
//!
//! - selects every process whose command starts with the subject name
//! - prints them when verbose and exports them as metrics
//! - picks the exact-name match as the subject and runs the escalation
//!   tracker on it
//! - prints a status line and carries out the decided action
//!
//! Stop and kill failures end the run; a garbled CPU value only skips the
//! tick.

pub mod escalation;

use crate::action::{ActionError, Remediator};
use crate::collect::{CollectError, Frame, FrameCollector, ProcessRecord};
use crate::config::MonitorConfig;
use crate::metrics::{process_point, Batch, MetricsSink};
use crate::subject::{StateProbe, SubjectState};
use cw_math::WindowSnapshot;
use escalation::{Action, Decision, EscalationError, EscalationTracker, Reason, Statistic};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end or skip a monitor tick.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("force kill decided without a process id")]
    MissingPid,

    #[error("failed to write status: {0}")]
    Io(#[from] io::Error),
}

impl MonitorError {
    /// Whether the run must stop. Only value errors are tick-local.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, MonitorError::Escalation(EscalationError::Value(_)))
    }
}

impl From<MonitorError> for cw_common::Error {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::Collect(e) => e.into(),
            MonitorError::Escalation(e) => e.into(),
            MonitorError::Action(e) => e.into(),
            MonitorError::MissingPid => cw_common::Error::ActionFailed(err.to_string()),
            MonitorError::Io(e) => cw_common::Error::Io(e),
        }
    }
}

/// Result of one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub sequence: u64,
    /// Processes sharing the subject prefix.
    pub related: usize,
    pub decision: Decision,
    /// Window contents after the tick.
    pub window: WindowSnapshot,
}

/// Drives escalation from frames.
pub struct Monitor {
    subject: String,
    verbose: bool,
    statistic: Statistic,
    tracker: EscalationTracker,
    probe: Box<dyn StateProbe>,
    remediator: Box<dyn Remediator>,
    sink: Box<dyn MetricsSink>,
    out: Box<dyn Write>,
    seen: bool,
}

impl Monitor {
    pub fn new(
        config: &MonitorConfig,
        probe: Box<dyn StateProbe>,
        remediator: Box<dyn Remediator>,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self, MonitorError> {
        Ok(Self {
            subject: config.subject.clone(),
            verbose: config.verbose,
            statistic: config.escalation.statistic,
            tracker: EscalationTracker::new(config.escalation.clone())?,
            probe,
            remediator,
            sink,
            out: Box::new(io::stdout()),
            seen: false,
        })
    }

    /// Send status output somewhere other than stdout.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn tracker(&self) -> &EscalationTracker {
        &self.tracker
    }

    /// Process frames until the collector stops.
    ///
    /// Returns `Ok(())` after a requested shutdown; any other end of the
    /// collector, and every fatal tick error, is returned as an error.
    pub fn run(&mut self, collector: &FrameCollector) -> Result<(), MonitorError> {
        writeln!(self.out, "Waiting to observe {}...", self.subject)?;
        loop {
            let frame = match collector.next_frame() {
                Ok(frame) => frame,
                Err(CollectError::Closed) => {
                    info!("collector closed; monitor stopping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            match self.process_frame(&frame) {
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    warn!(sequence = frame.sequence, error = %e, "tick skipped");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle one frame.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<TickOutcome, MonitorError> {
        let related = frame.matching_prefix(&self.subject);
        if self.verbose && !related.is_empty() {
            self.print_table(&related)?;
        }
        self.export(frame, &related);

        let subject = frame.find_command(&self.subject);
        let decision = self.tracker.evaluate(subject, self.probe.as_ref())?;
        let window = self.tracker.window().snapshot();
        debug!(
            sequence = frame.sequence,
            action = ?decision.action,
            reason = ?decision.reason,
            breaches = decision.breaches,
            samples = window.len,
            capacity = window.capacity,
            average = window.average,
            median = window.median,
            "tick evaluated"
        );

        if let Some(line) = self.status_line(&decision) {
            writeln!(self.out, "{line}")?;
        }
        self.seen = decision.reason != Reason::SubjectAbsent;
        self.execute(&decision)?;

        Ok(TickOutcome {
            sequence: frame.sequence,
            related: related.len(),
            decision,
            window,
        })
    }

    fn export(&self, frame: &Frame, related: &[&ProcessRecord]) {
        let mut batch = Batch::new();
        for record in related {
            batch.push(process_point(record, frame.captured_at));
        }
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.write(&batch) {
            warn!(error = %e, points = batch.len(), "metrics export failed");
        }
    }

    fn execute(&mut self, decision: &Decision) -> Result<(), MonitorError> {
        match decision.action {
            Action::None => {}
            Action::Warn => {
                warn!(
                    subject = %self.subject,
                    statistic = ?decision.statistic,
                    threshold = ?decision.threshold,
                    breaches = decision.breaches,
                    "CPU above threshold"
                );
            }
            Action::RequestStop => {
                writeln!(self.out, ">>> Asking {} to quit", self.subject)?;
                info!(subject = %self.subject, breaches = decision.breaches, "requesting stop");
                self.remediator.request_stop(&self.subject)?;
            }
            Action::ForceKill => {
                let pid = decision.pid.ok_or(MonitorError::MissingPid)?;
                writeln!(self.out, ">>> Killing {}!", self.subject)?;
                info!(subject = %self.subject, %pid, breaches = decision.breaches, "force killing");
                self.remediator.force_kill(pid)?;
            }
        }
        Ok(())
    }

    fn status_line(&self, decision: &Decision) -> Option<String> {
        let name = &self.subject;
        if decision.reason == Reason::SubjectAbsent {
            return self.seen.then(|| format!("{name}: not running"));
        }
        let cpu = decision.cpu.unwrap_or(f64::NAN);
        let state = decision.state.map_or("unknown", |s| s.as_str());
        if decision.state == Some(SubjectState::Foreground) && decision.statistic.is_none() {
            return Some(format!("{name}: foreground (ignored), CPU: {cpu:.2}"));
        }
        let mut line = format!(
            "{name}: {state}, CPU: {cpu:.2} ({:.2} {}, samples: {})",
            decision.statistic.unwrap_or(f64::NAN),
            self.statistic,
            decision.samples
        );
        if decision.breaches > 0 {
            line.push_str(&format!(
                " [breach {}/{}]",
                decision.breaches,
                self.tracker.config().breach_allowance
            ));
        }
        Some(line)
    }

    fn print_table(&mut self, related: &[&ProcessRecord]) -> io::Result<()> {
        writeln!(
            self.out,
            "  {:<6} {:<4} {:<5} {:<8} {:<8} {:<8} COMMAND",
            "PID", "CPU", "#TH", "STATE", "TIME", "PAGEINS"
        )?;
        for p in related {
            writeln!(
                self.out,
                "  {:<6} {:<4} {:<5} {:<8} {:<8} {:<8} {}",
                p.pid, p.cpu, p.threads, p.state, p.time, p.pageins, p.command
            )?;
        }
        Ok(())
    }
}
