/*!
 * The public client facade for one thing.
 *
 * Thin aggregation over [`DeviceAccess`]: the memoized lifecycle
 * operations live below, the facade provides the combined entry points a
 * driver typically calls.
 */
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::callbacks::ThingCallbacks;
use crate::device::DeviceAccess;
use crate::error::{ErrorKind, Result};
use crate::session::Session;
use crate::thing_info::ThingInfo;

/// Client handle for driving one thing's lifecycle
pub struct ThingAccessClient {
    access: Arc<DeviceAccess>,
}

impl ThingAccessClient {
    /// Create a client for a thing on the shared session
    pub fn new(
        session: Arc<Session>,
        info: ThingInfo,
        callbacks: Arc<dyn ThingCallbacks>,
    ) -> Result<Self> {
        Ok(Self {
            access: DeviceAccess::new(session, info, callbacks)?,
        })
    }

    /// Ensure the shared session is up
    pub async fn setup(&self) -> Result<()> {
        self.access.setup().await
    }

    /// Set up, register, and bring the thing online in one pass
    pub async fn register_and_online(&self) -> Result<()> {
        self.access.setup().await?;
        self.access.register().await?;
        self.access.connect().await
    }

    /// Bring the registered thing online
    pub async fn online(&self) -> Result<()> {
        self.access.connect().await
    }

    /// Take the thing offline
    pub async fn offline(&self) -> Result<()> {
        self.access.disconnect().await
    }

    /// Fetch the thing specification document
    pub async fn get_tsl(&self) -> Result<String> {
        self.access.get_tsl().await
    }

    /// Fetch the extended thing specification info
    pub async fn get_tsl_ext_info(&self) -> Result<String> {
        self.access.get_tsl_ext_info().await
    }

    /// Report current property values (fire-and-forget)
    pub fn report_properties(&self, properties: Map<String, Value>) -> Result<()> {
        self.access.report_properties(properties)
    }

    /// Report an occurred event (fire-and-forget)
    pub fn report_event(&self, name: &str, params: Map<String, Value>) -> Result<()> {
        self.access.report_event(name, params)
    }

    /// Unregister the thing from the broker
    pub async fn unregister(&self) -> Result<()> {
        self.access.unregister().await
    }

    /// Free every local resource held for the thing
    pub async fn cleanup(&self) -> Result<()> {
        self.access.cleanup().await
    }

    /// Clean the thing up and tear the shared session down.
    ///
    /// The explicit process-level teardown: device cleanup never
    /// finalizes the session on its own.
    pub async fn destroy(&self) -> Result<()> {
        self.access.cleanup().await?;
        self.access
            .session()
            .finalize()
            .await
            .map_err(|e| e.with_kind(ErrorKind::Cleanup))
    }

    /// The cloud-assigned device id, when registered
    pub fn device_id(&self) -> Option<String> {
        self.access.device_id()
    }

    /// Whether the thing is currently online
    pub fn is_connected(&self) -> bool {
        self.access.is_connected()
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<Session> {
        self.access.session()
    }
}
