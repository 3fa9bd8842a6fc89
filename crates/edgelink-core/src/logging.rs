/*!
 * Logging setup for edgelink.
 *
 * This module provides tracing initialization and span helpers shared by
 * the driver runtime crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "edgelink=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for the driver module
pub fn module_span(module: &str) -> Span {
    tracing::info_span!("module", name = %module)
}

/// Create a span for a single device
pub fn device_span(product_key: &str, device_id: Option<&str>) -> Span {
    match device_id {
        Some(id) => tracing::info_span!("device", product_key = %product_key, id = %id),
        None => tracing::info_span!("device", product_key = %product_key),
    }
}

/// Create a span for a lifecycle operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}
