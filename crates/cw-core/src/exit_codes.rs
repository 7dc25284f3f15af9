//! Exit codes for the cpuwatch CLI.
//!
//! Exit code ranges:
//! - 0: clean exit
//! - 10-19: user/environment errors (fixable by the user)
//! - 20-29: internal errors

use cw_common::ErrorCategory;

/// Process exit codes. Stable for scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Clean run or successful subcommand
    Clean = 0,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments or configuration
    ArgsError = 10,

    /// The reporter's output format is not the one cpuwatch understands
    FormatError = 11,

    /// State query, quit request, kill, or the reporter itself failed
    CollaboratorError = 12,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Exit code for an error that ended the run.
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Config | ErrorCategory::Construction => ExitCode::ArgsError,
            ErrorCategory::Format => ExitCode::FormatError,
            ErrorCategory::Collaborator | ErrorCategory::Producer => ExitCode::CollaboratorError,
            ErrorCategory::Io => ExitCode::IoError,
            // Recoverable categories only reach the top level through a bug.
            ErrorCategory::Row | ErrorCategory::Value => ExitCode::InternalError,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::FormatError => "ERR_FORMAT",
            ExitCode::CollaboratorError => "ERR_COLLABORATOR",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl From<&cw_common::Error> for ExitCode {
    fn from(err: &cw_common::Error) -> Self {
        ExitCode::for_category(err.category())
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
