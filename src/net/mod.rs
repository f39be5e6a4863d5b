//! Non-blocking transport over plain TCP or TLS.
//!
//! Every operation either completes, fails fatally for the connection, or
//! asks to be retried once the socket reports the hinted readiness. Fatal
//! failures are `io::Error`; retries carry the exact readiness set the
//! transport needs next, so the caller can subscribe to precisely those
//! events and nothing more.

mod tls;
mod transport;

pub use tls::client_config;
pub use transport::Transport;

/// Readiness hints carried by [`Progress::Retry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Want {
    /// The operation needs the socket to become readable.
    pub read: bool,
    /// The operation needs the socket to become writable.
    pub write: bool,
}

/// Outcome of a non-fatal transport operation.
#[derive(Debug, Clone, Copy)]
pub enum Progress {
    /// The operation completed, transferring this many bytes.
    Ok(usize),
    /// The operation would block; retry once the hinted readiness arrives.
    Retry(Want),
}
