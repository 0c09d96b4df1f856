//! Error types for latch

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Bad hook signature - {message}. Expected signature: {expected}")]
    SignatureMismatch { message: String, expected: String },

    #[error("No reachable memory region or cave for allocation: {0}")]
    ResourceExhausted(String),

    #[error("Method '{method}' did not reach stable native code within {waited_ms} ms")]
    CompilationTimeout { method: String, waited_ms: u64 },

    #[error("Invalid hook target: {0}")]
    InvalidTarget(String),

    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Protection change failed at {address:#x}: {message}")]
    Protection { address: usize, message: String },

    #[error("Assembly error: {0}")]
    Assembly(String),

    #[error("Failed to decode instruction at {address:#x}")]
    Decode { address: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Fatal errors leave the target unhookable; callers should not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::CompilationTimeout { .. }
        )
    }
}
