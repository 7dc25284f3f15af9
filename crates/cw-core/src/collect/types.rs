//! Records and frames produced by the collector.
//!
//! Fields are kept exactly as the reporter printed them; numeric values are
//! parsed on demand so a garbled number only fails the caller that needs it.

use chrono::{DateTime, Utc};
use cw_common::ProcessId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A numeric field could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse {field} from {value:?}")]
pub struct ValueError {
    pub field: &'static str,
    pub value: String,
}

impl From<ValueError> for cw_common::Error {
    fn from(err: ValueError) -> Self {
        cw_common::Error::ValueConversion {
            field: err.field,
            value: err.value,
        }
    }
}

/// One row of the reporter's process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: String,
    pub cpu: String,
    pub threads: String,
    /// Lifecycle label as printed (`running`, `sleeping`, `stuck`, ...).
    pub state: String,
    /// Accumulated CPU time, e.g. `02:54.09`.
    pub time: String,
    /// Page-ins, sometimes suffixed with `+`.
    pub pageins: String,
    /// May contain spaces.
    pub command: String,
}

impl ProcessRecord {
    pub fn pid(&self) -> Result<ProcessId, ValueError> {
        self.pid.parse().map_err(|_| ValueError {
            field: "pid",
            value: self.pid.clone(),
        })
    }

    pub fn cpu_percent(&self) -> Result<f64, ValueError> {
        self.cpu
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ValueError {
                field: "cpu",
                value: self.cpu.clone(),
            })
    }

    /// Thread count. `top` prints `12/1` when some threads are running;
    /// the total is the part before the slash.
    pub fn threads(&self) -> Result<u32, ValueError> {
        let total = self.threads.split('/').next().unwrap_or_default();
        total.parse().map_err(|_| ValueError {
            field: "threads",
            value: self.threads.clone(),
        })
    }

    /// Page-in count with any trailing `+`/`-` delta marker removed.
    pub fn pageins(&self) -> Result<u64, ValueError> {
        self.pageins
            .trim_end_matches(['+', '-'])
            .parse()
            .map_err(|_| ValueError {
                field: "pageins",
                value: self.pageins.clone(),
            })
    }
}

/// All process rows captured at one idle boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// 1 for the first frame handed to consumers.
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub processes: Vec<ProcessRecord>,
    /// Rows dropped as malformed.
    pub skipped_rows: usize,
}

impl Frame {
    /// The first record whose command equals `command`.
    pub fn find_command(&self, command: &str) -> Option<&ProcessRecord> {
        self.processes.iter().find(|p| p.command == command)
    }

    /// Records whose command starts with `prefix`, in table order.
    ///
    /// The result borrows only the frame, not `prefix`.
    pub fn matching_prefix(&self, prefix: &str) -> Vec<&ProcessRecord> {
        self.processes
            .iter()
            .filter(|p| p.command.starts_with(prefix))
            .collect()
    }
}
