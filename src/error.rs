//! Fatal setup errors.
//!
//! Only conditions that abort the whole run live here. Per-connection I/O
//! failures are recovered locally by the worker (teardown + reconnect) and
//! surface as counters in the end-of-run summary.

use std::io;

/// Errors that abort the run before or during startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The positional URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Host resolution failed; nothing to benchmark.
    #[error("unable to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },
    /// Command-line combination rejected after parsing.
    #[error("{0}")]
    Usage(String),
    /// A worker thread could not be spawned.
    #[error("unable to create worker {index}: {source}")]
    Spawn { index: u64, source: io::Error },
}

impl Error {
    /// Process exit code for this error: 1 for usage/config problems,
    /// 2 for spawn failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Spawn { .. } => 2,
            _ => 1,
        }
    }
}
