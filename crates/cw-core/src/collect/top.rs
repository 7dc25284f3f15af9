//! Parser for one burst of macOS `top -l` output.
//!
//! Each sample printed by `top -l 0 -stats pid,cpu,th,pstate,time,pageins,command`
//! looks like:
//!
//! ```text
//! Processes: 306 total, 2 running, 2 stuck, 302 sleeping, 1772 threads
//! 2016/11/20 20:18:55
//! Load Avg: 1.36, 1.41, 1.35
//! CPU usage: 3.70% user, 22.22% sys, 74.7% idle
//! SharedLibs: 150M resident, 19M data, 15M linkedit.
//! MemRegions: 83717 total, 3073M resident, 71M private, 868M shared.
//! PhysMem: 8688M used (3048M wired), 7694M unused.
//! VM: 2471G vsize, 533M framework vsize, 15758266(0) swapins, 17238545(0) swapouts.
//! Networks: packets: 26102141/14G in, 21138143/6128M out.
//! Disks: 6676021/171G read, 6960487/301G written.
//!
//! PID    %CPU #TH   STATE    TIME     PAGEINS  COMMAND
//! 99701  0.0  13    sleeping 02:54.09 3695+    gosublime.margo_
//! 83615  0.0  14    sleeping 03:06.73 6089+    Google Chrome He
//! ```
//!
//! The preamble is skipped by line count. A header that differs from
//! [`EXPECTED_HEADERS`] means the layout changed and nothing can be parsed
//! safely. Under load `top` sometimes glues columns together
//! (`sleeping00:00.02`); such rows come up short and are skipped.

use super::types::ProcessRecord;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Summary lines plus the blank separator before the table header.
pub const PREAMBLE_LINES: usize = 11;

/// Column headers for the `-stats` selection cpuwatch requests.
pub const EXPECTED_HEADERS: [&str; 7] = ["PID", "%CPU", "#TH", "STATE", "TIME", "PAGEINS", "COMMAND"];

/// Comma-separated `-stats` argument matching [`EXPECTED_HEADERS`].
pub const STATS_COLUMNS: &str = "pid,cpu,th,pstate,time,pageins,command";

const FIXED_FIELDS: usize = EXPECTED_HEADERS.len() - 1;

/// The burst as a whole cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("output ended after {lines} lines, before the table header")]
    MissingHeader { lines: usize },

    #[error("unexpected table header: expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

impl From<FrameError> for cw_common::Error {
    fn from(err: FrameError) -> Self {
        cw_common::Error::FormatIncompatible(err.to_string())
    }
}

/// A single table row is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("expected at least {expected} fields, found {found}")]
    TooFewFields { expected: usize, found: usize },
}

impl RowError {
    /// Attach the offending line.
    pub fn at(self, line: &str) -> cw_common::Error {
        cw_common::Error::RowParse {
            line: line.trim_end().to_string(),
            reason: self.to_string(),
        }
    }
}

/// Result of parsing one burst.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedFrame {
    pub processes: Vec<ProcessRecord>,
    pub skipped_rows: usize,
}

/// Parse one burst: preamble, header, then one row per process.
pub fn parse_frame(text: &str) -> Result<ParsedFrame, FrameError> {
    let mut lines = text.lines();

    let skipped = lines.by_ref().take(PREAMBLE_LINES).count();
    let header = lines.next().ok_or(FrameError::MissingHeader { lines: skipped })?;
    check_header(header)?;

    let mut frame = ParsedFrame::default();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(line) {
            Ok(record) => frame.processes.push(record),
            Err(e) => {
                let err = e.at(line);
                debug!(category = %err.category(), error = %err, "skipping malformed top row");
                frame.skipped_rows += 1;
            }
        }
    }
    Ok(frame)
}

fn check_header(line: &str) -> Result<(), FrameError> {
    let found: Vec<&str> = line.split_whitespace().collect();
    if found == EXPECTED_HEADERS {
        return Ok(());
    }
    Err(FrameError::HeaderMismatch {
        expected: EXPECTED_HEADERS.iter().map(|s| s.to_string()).collect(),
        found: found.iter().map(|s| s.to_string()).collect(),
    })
}

/// Parse one whitespace-delimited row. The command is everything after the
/// sixth field, rejoined with single spaces.
pub fn parse_row(line: &str) -> Result<ProcessRecord, RowError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() <= FIXED_FIELDS {
        return Err(RowError::TooFewFields {
            expected: FIXED_FIELDS + 1,
            found: fields.len(),
        });
    }

    Ok(ProcessRecord {
        pid: fields[0].to_string(),
        cpu: fields[1].to_string(),
        threads: fields[2].to_string(),
        state: fields[3].to_string(),
        time: fields[4].to_string(),
        pageins: fields[5].to_string(),
        command: fields[FIXED_FIELDS..].join(" "),
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    pub const PREAMBLE: &str = "\
Processes: 306 total, 2 running, 2 stuck, 302 sleeping, 1772 threads
2016/11/20 20:18:55
Load Avg: 1.36, 1.41, 1.35
CPU usage: 3.70% user, 22.22% sys, 74.7% idle
SharedLibs: 150M resident, 19M data, 15M linkedit.
MemRegions: 83717 total, 3073M resident, 71M private, 868M shared.
PhysMem: 8688M used (3048M wired), 7694M unused.
VM: 2471G vsize, 533M framework vsize, 15758266(0) swapins, 17238545(0) swapouts.
Networks: packets: 26102141/14G in, 21138143/6128M out.
Disks: 6676021/171G read, 6960487/301G written.

";

    pub const HEADER: &str = "PID    %CPU #TH   STATE    TIME     PAGEINS  COMMAND\n";

    pub fn burst(rows: &[&str]) -> String {
        let mut out = String::from(PREAMBLE);
        out.push_str(HEADER);
        for row in rows {
            out.push_str(row);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn parses_rows_and_joins_commands() {
        let text = burst(&[
            "99701  0.0  13    sleeping 02:54.09 3695+    gosublime.margo_",
            "83615  4.2  14    sleeping 03:06.73 6089+    Google Chrome He",
            "80917  27.3 31/2  running  10:00.14 1+       Spotify",
        ]);
        let frame = parse_frame(&text).unwrap();
        assert_eq!(frame.skipped_rows, 0);
        assert_eq!(frame.processes.len(), 3);

        let chrome = &frame.processes[1];
        assert_eq!(chrome.pid, "83615");
        assert_eq!(chrome.cpu, "4.2");
        assert_eq!(chrome.command, "Google Chrome He");

        let spotify = &frame.processes[2];
        assert_eq!(spotify.threads, "31/2");
        assert_eq!(spotify.state, "running");
        assert_eq!(spotify.time, "10:00.14");
        assert_eq!(spotify.pageins, "1+");
    }

    #[test]
    fn glued_rows_are_skipped() {
        let text = burst(&[
            "72846  0.0  1     sleeping00:00.02 86       postgres        ",
            "72846  0.0  1     sleeping0::00.02 86       postgres        ",
            "80917  3.0  31    sleeping 10:00.14 1+      Spotify",
        ]);
        let frame = parse_frame(&text).unwrap();
        assert_eq!(frame.skipped_rows, 2);
        assert_eq!(frame.processes.len(), 1);
        assert_eq!(frame.processes[0].command, "Spotify");
    }

    #[test]
    fn blank_lines_are_not_rows() {
        let mut text = burst(&["1  0.0  1  sleeping 00:00.01 0  launchd"]);
        text.push_str("\n   \n");
        let frame = parse_frame(&text).unwrap();
        assert_eq!(frame.processes.len(), 1);
        assert_eq!(frame.skipped_rows, 0);
    }

    #[test]
    fn header_mismatch_is_fatal() {
        let text = format!("{PREAMBLE}PID %CPU #TH STATE TIME MEM COMMAND\n1 0.0 1 s 0:00 0 x\n");
        match parse_frame(&text).unwrap_err() {
            FrameError::HeaderMismatch { found, .. } => assert_eq!(found[5], "MEM"),
            other => panic!("unexpected error: {other:?}"),
        }
        let err: cw_common::Error = parse_frame(&text).unwrap_err().into();
        assert_eq!(err.category(), cw_common::ErrorCategory::Format);
    }

    #[test]
    fn truncated_burst_has_no_header() {
        let err = parse_frame("Processes: 1 total\n2016/11/20 20:18:55\n").unwrap_err();
        assert_eq!(err, FrameError::MissingHeader { lines: 2 });
    }

    #[test]
    fn header_only_is_an_empty_frame() {
        let frame = parse_frame(&burst(&[])).unwrap();
        assert!(frame.processes.is_empty());
    }

    #[test]
    fn row_needs_a_command() {
        assert_eq!(
            parse_row("1 0.0 1 sleeping 00:00.01 0").unwrap_err(),
            RowError::TooFewFields {
                expected: 7,
                found: 6
            }
        );
    }

    #[test]
    fn row_error_is_local() {
        let line = "72846  0.0  1     sleeping00:00.02 86       postgres        ";
        let err = parse_row(line).unwrap_err().at(line);
        assert_eq!(err.category(), cw_common::ErrorCategory::Row);
        assert!(!err.is_fatal());
        match err {
            cw_common::Error::RowParse { line, reason } => {
                assert!(line.ends_with("postgres"));
                assert!(reason.contains("found 6"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
