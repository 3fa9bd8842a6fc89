/*!
 * Prelude module for edgelink core.
 *
 * Re-exports the types and functions the runtime crates use most.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export configuration types
pub use crate::config::{
    BusOptions, DriverOptions, DriverOptionsBuilder, LoggingOptions, ModuleOptions, SharedOptions,
};

// Re-export utilities
pub use crate::utils::{spawn_and_log, with_timeout, OpCell, OpFuture};

// Re-export logging helpers
pub use crate::logging::{device_span, module_span, operation_span};
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
