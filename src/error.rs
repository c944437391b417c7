//! Typed errors of the messaging core.
//!
//! Every operation of the core returns a result the caller must check;
//! nothing here panics or aborts. Benign conditions (duplicate
//! completion, queue eviction, non-critical send failures while acking)
//! are logged and swallowed by the components themselves and never show
//! up as an [Error].

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A fixed-size pool or table is full (session pool, retransmission
    /// table, counter-sync queue). Recoverable; retry policy belongs to
    /// the caller.
    NoMemory,
    /// Cache/table remove for a key which is not present.
    KeyNotFound,
    /// Ack received for a message counter with no outstanding
    /// retransmission entry (stale or duplicate ack).
    InvalidAckCounter,
    /// Counter-sync response carried a challenge which does not match
    /// the outstanding request. Local state is left unchanged.
    ChallengeMismatch,
    /// Incoming payload too short or otherwise unparseable.
    Malformed,
    /// Transport refused to send. Ack paths treat this as non-critical
    /// and swallow it with a log; other paths surface it.
    SendFailed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NoMemory => write!(f, "NO_MEMORY"),
            Error::KeyNotFound => write!(f, "KEY_NOT_FOUND"),
            Error::InvalidAckCounter => write!(f, "INVALID_ACK_COUNTER"),
            Error::ChallengeMismatch => write!(f, "CHALLENGE_MISMATCH"),
            Error::Malformed => write!(f, "MALFORMED"),
            Error::SendFailed => write!(f, "SEND_FAILED"),
        }
    }
}

impl std::error::Error for Error {}
