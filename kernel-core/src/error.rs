//! Error taxonomy for the kernel. Every fallible kernel operation returns
//! `Result<T, KernelError>`; callers classify failures by [`KernelError::severity`]
//! rather than by matching variants ad hoc.

use std::fmt;

/// How the executor should react to a given [`KernelError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Message-level: splat the send and/or reject its result promise. The
    /// loop continues processing the next run-queue item unaffected.
    Recoverable,
    /// The current crank is rolled back and the offending endpoint is
    /// marked for termination, but the loop continues.
    CrankFatal,
    /// The store or the run-queue discriminant is corrupt. The executor
    /// halts after attempting one final commit of a terminated marker.
    EngineFatal,
}

#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error("invalid ref `{0}` for requested operation")]
    InvalidRef(String),

    #[error("unknown entity `{0}`")]
    UnknownEntity(String),

    #[error("state violation: {0}")]
    StateViolation(String),

    #[error("target `{0}` has been revoked")]
    RevokedTarget(String),

    #[error("target `{0}` has no owner")]
    NoOwner(String),

    #[error("target `{0}` does not resolve to an object")]
    NoObject(String),

    #[error("delivery to `{endpoint}` failed: {message}")]
    DeliveryFailure { endpoint: String, message: String },

    #[error("store failure: {0}")]
    StoreFailure(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl KernelError {
    pub fn severity(&self) -> Severity {
        match self {
            KernelError::RevokedTarget(_)
            | KernelError::NoOwner(_)
            | KernelError::NoObject(_)
            | KernelError::DeliveryFailure { .. } => Severity::Recoverable,
            KernelError::InvalidRef(_) | KernelError::StateViolation(_) => Severity::CrankFatal,
            KernelError::UnknownEntity(_)
            | KernelError::StoreFailure(_)
            | KernelError::ProtocolError(_) => Severity::EngineFatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

/// Synthesised rejection body for a recoverable [`KernelError`], per §4.4.
/// The literal strings are part of the wire contract other components match on.
impl KernelError {
    pub fn splat_body(&self) -> String {
        match self {
            KernelError::RevokedTarget(_) => "revoked object".to_string(),
            KernelError::NoOwner(_) => "no endpoint".to_string(),
            KernelError::NoObject(_) => "no object".to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Recoverable => "recoverable",
            Severity::CrankFatal => "crank-fatal",
            Severity::EngineFatal => "engine-fatal",
        };
        write!(f, "{s}")
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
