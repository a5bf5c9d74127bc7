use std::io;

/// Fatal protocol-engine errors.
///
/// Per-attempt authentication failures are not errors; the auth engines
/// report them as ordinary outcomes and keep looping. Everything here
/// terminates the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed lengths, out-of-phase messages, integrity mismatches.
    /// The wire is attacker-controlled, so none of these are retryable.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No common algorithm, bad DH public value, signature mismatch.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The per-connection attempt ceiling was crossed.
    #[error("Too many authentication failures for {0}")]
    RateLimit(String),

    /// Every candidate method/key was exhausted without success.
    #[error("{0}")]
    Exhausted(String),

    /// A local resource (identity file, agent socket) was unavailable
    /// and no fallback remained.
    #[error("local resource unavailable: {0}")]
    Local(String),

    #[error("i/o error")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn negotiation(msg: impl Into<String>) -> Self {
        Self::Negotiation(msg.into())
    }

    pub(crate) fn local(msg: impl Into<String>) -> Self {
        Self::Local(msg.into())
    }
}
