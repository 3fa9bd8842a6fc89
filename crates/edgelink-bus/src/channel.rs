/*!
 * The bus channel boundary.
 *
 * The gateway bus is treated as a black-box RPC channel: named services,
 * request/reply method calls, fire-and-forget signal emission, and a
 * stream of transport errors. Everything above this trait is transport
 * agnostic.
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::envelope::ReplyEnvelope;

/// Well-known destination every device report signal is addressed to
pub const SUBSCRIBE_DESTINATION: &str = "iot.edgelink.subscribe";

/// Bus service name for a driver module
pub fn module_bus_name(module: &str) -> String {
    format!("iot.driver.{}", module)
}

/// Bus object path for a driver module
pub fn module_bus_path(module: &str) -> String {
    format!("/iot/driver/{}", module)
}

/// Bus service name for a connected device
pub fn device_bus_name(device_id: &str) -> String {
    format!("iot.device.{}", device_id)
}

/// Bus object path for a connected device
pub fn device_bus_path(device_id: &str) -> String {
    format!("/iot/device/{}", device_id)
}

/// Error type for bus transport operations
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// The channel is not open
    #[error("Bus not connected")]
    NotConnected,

    /// A requested service name is held by another owner
    #[error("Bus name {0} is held by another owner")]
    NameTaken(String),

    /// A signal or message could not be sent
    #[error("Send failed: {0}")]
    Send(String),

    /// A method call failed in transport
    #[error("Call {0} failed: {1}")]
    Call(String, String),

    /// A reply could not be interpreted
    #[error("Invalid reply from {0}: {1}")]
    InvalidReply(String, String),

    /// The channel was closed underneath the caller
    #[error("Bus closed")]
    Closed,

    /// Other transport error
    #[error("Bus error: {0}")]
    Other(String),
}

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Reply to a service-name acquisition request.
///
/// `Exists` is the diagnostic case: the name is currently held by
/// another owner. Callers treat it as a failure all the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameReply {
    /// The name was acquired
    PrimaryOwner,
    /// The caller already held the name
    AlreadyOwner,
    /// The name is held by another owner
    Exists,
    /// The request was queued behind the current owner
    InQueue,
}

impl NameReply {
    /// Whether the reply means the caller now owns the name
    pub fn is_owned(&self) -> bool {
        matches!(self, NameReply::PrimaryOwner | NameReply::AlreadyOwner)
    }
}

/// Description of an exported interface: its name plus the methods and
/// signals it carries
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    /// Interface name
    pub name: String,
    /// Exported method names
    pub methods: Vec<&'static str>,
    /// Emitted signal names
    pub signals: Vec<&'static str>,
}

impl InterfaceDescriptor {
    /// Create a descriptor with no members
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// Add an exported method
    pub fn with_method(mut self, method: &'static str) -> Self {
        self.methods.push(method);
        self
    }

    /// Add an emitted signal
    pub fn with_signal(mut self, signal: &'static str) -> Self {
        self.signals.push(signal);
        self
    }
}

/// Handler for inbound method calls on an exported interface
#[async_trait]
pub trait InboundInterface: Send + Sync {
    /// Handle one inbound call; the reply is the JSON the bus sends back
    async fn handle(&self, method: &str, args: &[String]) -> Result<String>;
}

/// The black-box RPC channel to the gateway bus.
///
/// `call` covers the `{code, message, params?}` envelope family;
/// `call_config` covers the config manager family, which replies with a
/// bare status code and a payload string instead.
#[async_trait]
pub trait BusChannel: Send + Sync + Debug {
    /// Open the underlying transport
    async fn open(&self) -> Result<()>;

    /// Close the underlying transport
    async fn close(&self) -> Result<()>;

    /// Issue a request/reply method call
    async fn call(&self, method: &str, payload: Value) -> Result<ReplyEnvelope>;

    /// Issue a config-family call returning `(code, payload)`
    async fn call_config(&self, method: &str, args: &[String]) -> Result<(i64, String)>;

    /// Request ownership of a service name
    async fn request_name(&self, name: &str) -> Result<NameReply>;

    /// Release a previously acquired service name
    async fn release_name(&self, name: &str) -> Result<()>;

    /// Export an interface at a path, routing inbound calls to `handler`
    async fn export_interface(
        &self,
        path: &str,
        descriptor: InterfaceDescriptor,
        handler: Arc<dyn InboundInterface>,
    ) -> Result<()>;

    /// Remove a previously exported interface
    async fn remove_interface(&self, path: &str) -> Result<()>;

    /// Emit a fire-and-forget signal scoped to `path` toward `destination`
    async fn emit_signal(
        &self,
        destination: &str,
        path: &str,
        signal: &str,
        payload: Value,
    ) -> Result<()>;

    /// Subscribe to transport errors surfaced by the channel
    fn subscribe_errors(&self) -> broadcast::Receiver<BusError>;
}
