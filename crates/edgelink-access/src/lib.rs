/*!
 * edgelink access
 *
 * The session and device lifecycle state machines of the edgelink driver
 * runtime: one shared bus session per process multiplexing many
 * independent thing lifecycles, with idempotent re-entry and
 * rollback-on-partial-failure semantics.
 */

#![warn(missing_docs)]

pub mod callbacks;
pub mod client;
pub mod device;
pub mod driver_config;
pub mod error;
pub mod session;
pub mod thing_info;

pub use callbacks::{CallbackOutput, ThingCallbacks};
pub use client::ThingAccessClient;
pub use device::{DeviceAccess, DEVICE_INTERFACE};
pub use driver_config::DriverConfigManager;
pub use error::{Error, ErrorKind, Result};
pub use session::{ConfigChange, Session, MODULE_INTERFACE};
pub use thing_info::{DriverConfig, ThingInfo};

/// edgelink access crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
