// Error taxonomy and reply assembly
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html
//
// All multi-byte wire values are big-endian (network byte order).

use thiserror::Error;

use crate::ids::IdKind;

pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The identifier was never minted in this kind-space.
    #[error("unknown {kind:?} identifier {id}")]
    InvalidIdentifier { kind: IdKind, id: u64 },

    /// The identifier was minted, but its referent has been reclaimed.
    #[error("{kind:?} identifier {id} refers to a collected entity")]
    ObjectCollected { kind: IdKind, id: u64 },

    #[error("thread is not suspended")]
    ThreadNotSuspended,

    #[error("unsupported command or optional capability")]
    NotImplemented,

    #[error("target VM has terminated")]
    VmDead,

    #[error("invalid event kind {0}")]
    InvalidEventKind(u8),

    #[error("malformed command payload: {0}")]
    Malformed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

// Wire error codes the agent can report
pub mod error_codes {
    pub const NONE: u16 = 0;
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const INVALID_OBJECT: u16 = 20;
    pub const NOT_IMPLEMENTED: u16 = 99;
    pub const INVALID_EVENT_TYPE: u16 = 102;
    pub const ILLEGAL_ARGUMENT: u16 = 103;
    pub const VM_DEAD: u16 = 112;
    pub const INTERNAL: u16 = 113;
}

impl AgentError {
    /// Wire error code reported to the debugger for this failure.
    pub fn error_code(&self) -> u16 {
        use error_codes::*;
        match self {
            AgentError::InvalidIdentifier {
                kind: IdKind::Thread,
                ..
            } => INVALID_THREAD,
            AgentError::InvalidIdentifier { .. } => INVALID_OBJECT,
            // The debugger cannot tell a collected entity from an unknown
            // id on the wire; the distinction only exists in-process.
            AgentError::ObjectCollected { .. } => INVALID_OBJECT,
            AgentError::ThreadNotSuspended => THREAD_NOT_SUSPENDED,
            AgentError::NotImplemented => NOT_IMPLEMENTED,
            AgentError::VmDead => VM_DEAD,
            AgentError::InvalidEventKind(_) => INVALID_EVENT_TYPE,
            AgentError::Malformed(_) => ILLEGAL_ARGUMENT,
            AgentError::Internal(_) => INTERNAL,
        }
    }
}

pub fn error_code_name(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        10 => "INVALID_THREAD",
        13 => "THREAD_NOT_SUSPENDED",
        20 => "INVALID_OBJECT",
        99 => "NOT_IMPLEMENTED",
        102 => "INVALID_EVENT_TYPE",
        103 => "ILLEGAL_ARGUMENT",
        112 => "VM_DEAD",
        113 => "INTERNAL",
        _ => "UNKNOWN_ERROR",
    }
}

/// Outcome of one dispatched command: error code plus reply payload.
///
/// The transport layer owns packet ids and header framing; it wraps this
/// into a reply packet verbatim.
#[derive(Debug, Clone)]
pub struct Reply {
    pub error_code: u16,
    pub data: Vec<u8>,
}

impl Reply {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            error_code: error_codes::NONE,
            data,
        }
    }

    pub fn error(error_code: u16) -> Self {
        Self {
            error_code,
            data: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_code != error_codes::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_identifier_failures_use_the_thread_code() {
        let err = AgentError::InvalidIdentifier {
            kind: IdKind::Thread,
            id: 7,
        };
        assert_eq!(err.error_code(), error_codes::INVALID_THREAD);

        let err = AgentError::InvalidIdentifier {
            kind: IdKind::Object,
            id: 7,
        };
        assert_eq!(err.error_code(), error_codes::INVALID_OBJECT);
    }

    #[test]
    fn collected_and_invalid_share_a_wire_code() {
        let collected = AgentError::ObjectCollected {
            kind: IdKind::Object,
            id: 3,
        };
        let invalid = AgentError::InvalidIdentifier {
            kind: IdKind::Object,
            id: 3,
        };
        assert_eq!(collected.error_code(), invalid.error_code());
    }

    #[test]
    fn reply_error_carries_no_payload() {
        let reply = Reply::error(error_codes::VM_DEAD);
        assert!(reply.is_error());
        assert!(reply.data.is_empty());
        assert_eq!(error_code_name(reply.error_code), "VM_DEAD");
    }
}
