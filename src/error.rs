//! Error types for the script sandbox.

use thiserror::Error;

/// Errors that can occur while constructing or driving a sandbox engine.
///
/// The message text of every variant is part of the public interface:
/// hosts are allowed to match on it.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Caller misuse: bad constructor arguments or use of an unopened engine.
    #[error("{0}")]
    Argument(String),

    /// Guest source failed to compile. The engine remains usable.
    #[error("{path}:{line}:{column}: {message}")]
    Syntax {
        /// Name of the source file that failed to compile.
        path: String,
        /// 1-based line of the error.
        line: u32,
        /// 1-based column of the error.
        column: u32,
        /// Parser detail, e.g. "syntax error, unexpected $end".
        message: String,
    },

    /// Guest code raised an exception during execution. The engine remains
    /// usable; the record carries the guest-side type and backtrace.
    #[error("{message}")]
    Runtime {
        /// The exception's message.
        message: String,
        /// The raising exception's class name, or a stable
        /// `#<Class:0xHEX>` rendering when the class is anonymous.
        exception_type: String,
        /// Guest stack frames, innermost first, each formatted as
        /// `file:line:in Class.method` (`file:line` for top-level code).
        guest_backtrace: Vec<String>,
    },

    /// A value crossed the marshal boundary with a type outside the
    /// supported set, or was nested too deeply.
    #[error("{0}")]
    Type(String),

    /// A guest allocation would overflow the memory pool. Latches the engine.
    #[error("failed to allocate {requested} bytes ({in_use} bytes out of {capacity} in use)")]
    MemoryQuota {
        /// Size of the rejected request, in bytes.
        requested: usize,
        /// Pool bytes in use at the time of the request.
        in_use: usize,
        /// Fixed pool capacity, in bytes.
        capacity: usize,
    },

    /// The instruction ceiling was hit. Latches the engine.
    #[error("exceeded quota of {quota} instructions.")]
    InstructionQuota {
        /// The configured instruction ceiling.
        quota: u64,
    },

    /// The wall-clock ceiling was hit. Latches the engine.
    #[error("exceeded quota of {quota_ms} ms.")]
    TimeQuota {
        /// The configured ceiling, in whole milliseconds.
        quota_ms: u64,
    },

    /// Guest execution came too close to the native stack limit.
    /// Latches the engine.
    #[error("stack exhausted")]
    StackExhausted,

    /// Any call on an engine whose failure latch has tripped. The engine
    /// is dead; discard it.
    #[error("quota error already reached, operation aborted")]
    QuotaAlreadyReached,

    /// A fault in the sandbox itself, not in guest code. The message
    /// carries a symbolized native trace. Latches the engine as fatal;
    /// hosts should log and discard the engine.
    #[error("{0}")]
    Internal(String),
}

impl SandboxError {
    /// Whether this error trips the engine's failure latch.
    pub fn latches(&self) -> bool {
        matches!(
            self,
            SandboxError::MemoryQuota { .. }
                | SandboxError::InstructionQuota { .. }
                | SandboxError::TimeQuota { .. }
                | SandboxError::StackExhausted
                | SandboxError::Internal(_)
        )
    }

    /// Check if this error is one of the quota class (memory, instruction,
    /// time, or stack).
    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            SandboxError::MemoryQuota { .. }
                | SandboxError::InstructionQuota { .. }
                | SandboxError::TimeQuota { .. }
                | SandboxError::StackExhausted
        )
    }

    /// Check if this error represents a guest compile failure.
    pub fn is_syntax(&self) -> bool {
        matches!(self, SandboxError::Syntax { .. })
    }

    /// Check if this error represents a guest exception.
    pub fn is_runtime(&self) -> bool {
        matches!(self, SandboxError::Runtime { .. })
    }

    /// Check if this error represents an internal sandbox fault.
    pub fn is_internal(&self) -> bool {
        matches!(self, SandboxError::Internal(_))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_quota_message_shape() {
        let err = SandboxError::MemoryQuota {
            requested: 4096,
            in_use: 1_000_000,
            capacity: 4_194_304,
        };
        assert_eq!(
            err.to_string(),
            "failed to allocate 4096 bytes (1000000 bytes out of 4194304 in use)"
        );
    }

    #[test]
    fn test_instruction_quota_message_shape() {
        let err = SandboxError::InstructionQuota { quota: 100000 };
        assert_eq!(err.to_string(), "exceeded quota of 100000 instructions.");
    }

    #[test]
    fn test_time_quota_message_shape() {
        let err = SandboxError::TimeQuota { quota_ms: 100 };
        assert_eq!(err.to_string(), "exceeded quota of 100 ms.");
    }

    #[test]
    fn test_syntax_message_shape() {
        let err = SandboxError::Syntax {
            path: "sample.rb".to_string(),
            line: 1,
            column: 1,
            message: "syntax error, unexpected $end".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "sample.rb:1:1: syntax error, unexpected $end"
        );
    }

    #[test]
    fn test_latching_classification() {
        assert!(SandboxError::StackExhausted.latches());
        assert!(SandboxError::InstructionQuota { quota: 1 }.latches());
        assert!(SandboxError::Internal("boom".into()).latches());
        assert!(!SandboxError::QuotaAlreadyReached.latches());
        assert!(!SandboxError::Argument("nope".into()).latches());
        assert!(!SandboxError::Syntax {
            path: "a.rb".into(),
            line: 1,
            column: 1,
            message: "syntax error, unexpected $end".into(),
        }
        .latches());
    }

    #[test]
    fn test_quota_classification() {
        assert!(SandboxError::StackExhausted.is_quota());
        assert!(SandboxError::TimeQuota { quota_ms: 1 }.is_quota());
        assert!(!SandboxError::Internal("boom".into()).is_quota());
        assert!(!SandboxError::QuotaAlreadyReached.is_quota());
    }
}
