//! Time-series export of per-process measurements.
//!
//! Points are encoded in the InfluxDB line protocol:
//!
//! ```text
//! process,command=Spotify\ Helper pid=80917i,cpu=3.1,state="sleeping" 1479673135000000000
//! ```
//!
//! Export is best effort; the monitor logs sink failures and carries on.

use crate::collect::ProcessRecord;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// Measurement name used for process rows.
pub const PROCESS_MEASUREMENT: &str = "process";

/// Errors from encoding or writing metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("point {measurement:?} has no fields")]
    NoFields { measurement: String },

    #[error("field {field:?} is not a finite number")]
    NonFinite { field: String },

    #[error("timestamp out of range for nanosecond precision")]
    Timestamp,

    #[error("metrics write failed: {0}")]
    Write(String),
}

/// One field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Text(String),
    Bool(bool),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// A tagged measurement at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Encode as one line-protocol line, without the trailing newline.
    ///
    /// Tags and fields are written in key order. Empty tag values are
    /// omitted since the protocol does not allow them.
    pub fn to_line(&self) -> Result<String, MetricsError> {
        if self.fields.is_empty() {
            return Err(MetricsError::NoFields {
                measurement: self.measurement.clone(),
            });
        }
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let mut sep = ' ';
        for (key, value) in &self.fields {
            line.push(sep);
            sep = ',';
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            match value {
                FieldValue::Float(v) if !v.is_finite() => {
                    return Err(MetricsError::NonFinite { field: key.clone() })
                }
                FieldValue::Float(v) => {
                    let _ = write!(line, "{v}");
                }
                FieldValue::Integer(v) => {
                    let _ = write!(line, "{v}i");
                }
                FieldValue::Text(v) => {
                    line.push('"');
                    line.push_str(&escape(v, &['"']));
                    line.push('"');
                }
                FieldValue::Bool(v) => {
                    let _ = write!(line, "{v}");
                }
            }
        }

        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .ok_or(MetricsError::Timestamp)?;
        let _ = write!(line, " {nanos}");
        Ok(line)
    }
}

/// Backslash-escape `special` characters and backslashes.
fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Points written together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub points: Vec<Point>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Newline-separated line protocol for every point.
    pub fn to_line_protocol(&self) -> Result<String, MetricsError> {
        let mut body = String::new();
        for point in &self.points {
            body.push_str(&point.to_line()?);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Destination for metric batches.
pub trait MetricsSink {
    fn write(&self, batch: &Batch) -> Result<(), MetricsError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn write(&self, _batch: &Batch) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Build the `process` point for one row.
///
/// Numeric columns are typed when they parse and kept as text otherwise,
/// so one odd value never drops the whole row.
pub fn process_point(record: &ProcessRecord, at: DateTime<Utc>) -> Point {
    let mut point = Point::new(PROCESS_MEASUREMENT, at).tag("command", record.command.as_str());

    point = match record.pid() {
        Ok(pid) => point.field("pid", i64::from(pid.0)),
        Err(_) => point.field("pid", record.pid.as_str()),
    };
    point = match record.cpu_percent() {
        Ok(cpu) => point.field("cpu", cpu),
        Err(_) => point.field("cpu", record.cpu.as_str()),
    };
    point = match record.threads() {
        Ok(threads) => point.field("threads", i64::from(threads)),
        Err(_) => point.field("threads", record.threads.as_str()),
    };
    point = match record.pageins().ok().and_then(|n| i64::try_from(n).ok()) {
        Some(pageins) => point.field("pageins", pageins),
        None => point.field("pageins", record.pageins.as_str()),
    };

    point
        .field("state", record.state.as_str())
        .field("time", record.time.as_str())
        .field("command", record.command.as_str())
}

#[cfg(feature = "influx")]
pub use influx::InfluxSink;

#[cfg(feature = "influx")]
mod influx {
    use super::{Batch, MetricsError, MetricsSink};
    use std::time::Duration;
    use tracing::debug;

    /// Writes batches to an InfluxDB 1.x `/write` endpoint.
    #[derive(Debug, Clone)]
    pub struct InfluxSink {
        agent: ureq::Agent,
        endpoint: String,
    }

    impl InfluxSink {
        pub fn new(base_url: &str, database: &str, timeout: Duration) -> Self {
            let agent = ureq::AgentBuilder::new().timeout(timeout).build();
            let endpoint = format!(
                "{}/write?db={database}&precision=ns",
                base_url.trim_end_matches('/')
            );
            Self { agent, endpoint }
        }

        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl MetricsSink for InfluxSink {
        fn write(&self, batch: &Batch) -> Result<(), MetricsError> {
            if batch.is_empty() {
                return Ok(());
            }
            let body = batch.to_line_protocol()?;
            self.agent
                .post(&self.endpoint)
                .set("Content-Type", "text/plain; charset=utf-8")
                .send_string(&body)
                .map_err(|e| MetricsError::Write(e.to_string()))?;
            debug!(points = batch.len(), "metrics written");
            Ok(())
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_479_673_135, 0).unwrap()
    }

    fn record() -> ProcessRecord {
        ProcessRecord {
            pid: "80917".to_string(),
            cpu: "3.1".to_string(),
            threads: "31/2".to_string(),
            state: "sleeping".to_string(),
            time: "10:00.14".to_string(),
            pageins: "12+".to_string(),
            command: "Spotify Helper".to_string(),
        }
    }

    #[test]
    fn encodes_process_point() {
        let line = process_point(&record(), at()).to_line().unwrap();
        assert_eq!(
            line,
            "process,command=Spotify\\ Helper \
             command=\"Spotify Helper\",cpu=3.1,pageins=12i,pid=80917i,\
             state=\"sleeping\",threads=31i,time=\"10:00.14\" \
             1479673135000000000"
        );
    }

    #[test]
    fn unparsable_numbers_stay_text() {
        let mut r = record();
        r.cpu = "n/a".to_string();
        let point = process_point(&r, at());
        assert_eq!(point.fields["cpu"], FieldValue::Text("n/a".to_string()));
        assert_eq!(point.fields["pid"], FieldValue::Integer(80917));
    }

    #[test]
    fn escaping() {
        let line = Point::new("my measure,x", at())
            .tag("k=1", "a b")
            .tag("empty", "")
            .field("say", "he said \"hi\" \\o/")
            .field("ok", true)
            .to_line()
            .unwrap();
        assert_eq!(
            line,
            r#"my\ measure\,x,k\=1=a\ b ok=true,say="he said \"hi\" \\o/" 1479673135000000000"#
        );
    }

    #[test]
    fn invalid_points_are_rejected() {
        assert!(matches!(
            Point::new("empty", at()).to_line(),
            Err(MetricsError::NoFields { .. })
        ));
        assert!(matches!(
            Point::new("nan", at()).field("v", f64::NAN).to_line(),
            Err(MetricsError::NonFinite { .. })
        ));
    }

    #[test]
    fn batch_joins_lines() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.push(Point::new("a", at()).field("v", 1i64));
        batch.push(Point::new("b", at()).field("v", 2.5));
        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.to_line_protocol().unwrap(),
            "a v=1i 1479673135000000000\nb v=2.5 1479673135000000000\n"
        );
        assert!(NullSink.write(&batch).is_ok());
    }
}
