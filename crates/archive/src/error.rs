//! Archive errors

use evr_gateway_protocol::PROTOCOL_ERROR_CODE;
use thiserror::Error;

/// `evr` exit code for a blob that does not exist
pub const EXIT_NOT_FOUND: i32 = 2;

/// `evr` exit code for content that failed validation
pub const EXIT_USER_DATA_INVALID: i32 = 5;

/// An archive tool invocation that terminated abnormally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("evr {command} exited with code {exit_code}: {stderr}")]
pub struct ChildProcessFailure {
    /// Subcommand of the failed invocation
    pub command: String,

    /// Process exit code, never 0
    pub exit_code: i32,

    /// Tail of the captured stderr output
    pub stderr: String,
}

impl ChildProcessFailure {
    /// Verification outcomes clients are expected to handle themselves.
    /// These are reported to the client but not logged as server errors.
    pub fn is_expected(&self) -> bool {
        self.command == "get-verify"
            && matches!(self.exit_code, EXIT_NOT_FOUND | EXIT_USER_DATA_INVALID)
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    ChildProcess(#[from] ChildProcessFailure),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Subprocess I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Code reported to the client for this failure
    pub fn error_code(&self) -> i32 {
        match self {
            Self::ChildProcess(failure) => failure.exit_code,
            Self::Spawn { .. } | Self::Io(_) => PROTOCOL_ERROR_CODE,
        }
    }
}
