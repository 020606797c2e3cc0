use thiserror::Error;

/// Failure taxonomy for bus transactions and request submission.
///
/// `ChecksumInvalid` and `Collision` are recovered inside the engine's
/// retry budget; they only surface in logs and in the mock scripting used
/// by tests. Everything else reaches the requester as a typed result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// A received frame failed its checksum. Retryable, same as no reply.
    #[error("frame checksum invalid")]
    ChecksumInvalid,

    /// Echoed byte differed from the sent byte during arbitration.
    #[error("bus collision on send")]
    Collision,

    /// Retry budget exhausted without a valid reply.
    #[error("no response after {attempts} send attempts")]
    NoResponse { attempts: u8 },

    /// Structurally valid frame whose payload cannot satisfy the expected
    /// reply shape. Not retried: a healthy peer would reproduce it.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Request named an identifier absent from the registry. Rejected
    /// before any bus activity.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Request queue at capacity. Rejected immediately.
    #[error("request queue full")]
    Busy,

    /// The physical transport reported an I/O error. Fatal to the engine.
    #[error("bus device fault: {0}")]
    DeviceFault(String),

    /// The engine terminated on a device fault; the bridge rejects all
    /// pending and future requests with this outcome.
    #[error("bus engine unavailable")]
    EngineDown,

    /// Parameter values did not match the command's declared field list.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl BusError {
    /// True for outcomes the engine may absorb into another send attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::ChecksumInvalid | BusError::Collision)
    }
}
