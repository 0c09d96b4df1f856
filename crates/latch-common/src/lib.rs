//! Latch common types
//!
//! Shared types, error taxonomy and logging setup used by the latch hooking
//! engine.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use logging::{init_debug_logging, init_default_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
