use thiserror::Error;

/// Top-level error taxonomy for a Drip run.
///
/// Failures local to a single candidate or session (a secret mismatch, one
/// discovery substrate down) are absorbed inside the engine and never show
/// up here — this type only carries conditions that end the run.
#[derive(Debug, Error)]
pub enum DripError {
    /// Every discovery substrate failed to start. Nothing can be found.
    #[error("discovery unavailable: no substrate could be started")]
    DiscoveryUnavailable,

    /// Every candidate was exhausted without a successful exchange, or the
    /// race was cancelled before any success.
    #[error("pairing failed: {0}")]
    PairingFailed(String),

    /// Malformed, unsigned, or out-of-order negotiation message. Terminates
    /// the affected session immediately.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The stream closed before the declared number of bytes arrived. The
    /// partially written file must be treated as unreliable.
    #[error("transfer incomplete: got {received} of {expected} bytes")]
    TransferIncomplete { expected: u64, received: u64 },

    /// Explicit shutdown. A clean termination path, not a fault, though it
    /// unwinds identically.
    #[error("cancelled by user")]
    UserCancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DripError {
    /// Whether this termination should map to a non-zero process exit.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UserCancelled)
    }
}
