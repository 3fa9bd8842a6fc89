/*!
 * edgelink bus
 *
 * This crate defines the boundary between the driver runtime and the
 * gateway's local inter-process bus: a black-box RPC channel with named
 * services, request/reply calls, exported interfaces, and signals.
 */

#![warn(missing_docs)]

pub mod channel;
pub mod envelope;
pub mod testing;

pub use channel::{
    device_bus_name, device_bus_path, module_bus_name, module_bus_path, BusChannel, BusError,
    InboundInterface, InterfaceDescriptor, NameReply, SUBSCRIBE_DESTINATION,
};
pub use envelope::{ReplyEnvelope, CODE_RETRY_CONNECT, CODE_SUCCESS, CODE_UNKNOWN};

/// edgelink bus crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
