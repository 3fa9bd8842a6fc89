/*!
 * The shared bus session.
 *
 * One session per driver process: it owns the bus connection, the
 * module-level service name and interface, and the set of device ids the
 * module currently drives. Components receive the session as an
 * explicitly constructed `Arc` rather than reaching for a global.
 */
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use edgelink_bus::{
    module_bus_name, module_bus_path, BusChannel, BusError, InboundInterface, InterfaceDescriptor,
    NameReply, ReplyEnvelope,
};
use edgelink_core::utils::OpCell;
use edgelink_core::config::DriverOptions;

use crate::error::{Error, ErrorKind, Result};

/// Interface name exported at the module path
pub const MODULE_INTERFACE: &str = "iot.edgelink.module";

/// A config-change notification delivered through the module interface
#[derive(Debug, Clone)]
pub struct ConfigChange {
    /// The configuration key that changed
    pub key: String,
    /// The raw new value
    pub value: String,
}

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    name_held: bool,
    module_exported: bool,
    devices: HashSet<String>,
    connected: HashSet<String>,
    error_task: Option<JoinHandle<()>>,
}

enum DeviceSelector {
    Online,
    Offline,
}

fn parse_selector(selector: Option<&str>) -> Option<DeviceSelector> {
    let raw = selector?.trim();
    let (_, value) = raw.split_once('=')?;
    match value.trim() {
        "online" => Some(DeviceSelector::Online),
        "offline" => Some(DeviceSelector::Offline),
        _ => None,
    }
}

/// The process-wide bus session
#[derive(Debug)]
pub struct Session {
    bus: Arc<dyn BusChannel>,
    module_name: String,
    is_local: bool,
    state: Mutex<SessionState>,
    config_tx: broadcast::Sender<ConfigChange>,
    initializing: OpCell<(), Error>,
    finalizing: OpCell<(), Error>,
}

impl Session {
    /// Create a session over the given bus channel
    pub fn new(bus: Arc<dyn BusChannel>, options: &DriverOptions) -> Arc<Self> {
        let (config_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            bus,
            module_name: options.module.name.clone(),
            is_local: options.module.is_local,
            state: Mutex::new(SessionState::default()),
            config_tx,
            initializing: OpCell::new(),
            finalizing: OpCell::new(),
        })
    }

    /// The module (driver) name this session registers as
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Whether the module's things are local to the gateway
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Bring the session up: open the bus, acquire the module service
    /// name, export the module interface, register the module.
    ///
    /// Idempotent: concurrent and repeated callers share one outcome; a
    /// failed attempt clears the memo so a later call retries.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.initializing
            .get_or_run(move || {
                async move {
                    match this.do_initialize().await {
                        Ok(()) => {
                            // A fresh session pairs with a fresh finalize.
                            this.finalizing.clear();
                            Ok(())
                        }
                        Err(e) => {
                            this.initializing.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_initialize(self: &Arc<Self>) -> Result<()> {
        info!("Initializing session for module {}", self.module_name);

        self.bus.open().await?;
        let mut errors = self.bus.subscribe_errors();
        let error_task = tokio::spawn(async move {
            while let Ok(error) = errors.recv().await {
                warn!("Bus error: {}", error);
            }
        });
        self.lock_state().error_task = Some(error_task);

        let bus_name = module_bus_name(&self.module_name);
        if let Err(e) = self.acquire_name(&bus_name).await {
            self.reset_state().await;
            return Err(e);
        }
        self.lock_state().name_held = true;

        // Inbound calls may arrive as soon as the name is owned, so the
        // module interface goes up before registration.
        let descriptor = InterfaceDescriptor::new(MODULE_INTERFACE)
            .with_method("getDeviceList")
            .with_method("notifyConfig");
        let handler: Arc<dyn InboundInterface> =
            Arc::new(ModuleService::new(Arc::downgrade(self)));
        if let Err(e) = self
            .bus
            .export_interface(&module_bus_path(&self.module_name), descriptor, handler)
            .await
        {
            self.rollback_initialize(&bus_name).await;
            return Err(Error::from(e));
        }
        self.lock_state().module_exported = true;

        let payload = json!({
            "driverLocalId": self.module_name,
            "startupTime": Utc::now().timestamp_millis(),
        });
        let registered = match self.bus.call("registerDriver", payload).await {
            Ok(reply) if reply.is_success() => Ok(()),
            Ok(reply) => Err(Error::new(
                ErrorKind::RegisterModule,
                format!("registerDriver returned code {}: {}", reply.code, reply.message),
            )),
            Err(e) => Err(Error::new(ErrorKind::RegisterModule, e.to_string())),
        };
        if let Err(e) = registered {
            self.rollback_initialize(&bus_name).await;
            return Err(e);
        }

        self.lock_state().active = true;
        info!("Session initialized for module {}", self.module_name);
        Ok(())
    }

    async fn rollback_initialize(&self, bus_name: &str) {
        if let Err(e) = self.bus.release_name(bus_name).await {
            warn!("Failed to release {} while rolling back: {}", bus_name, e);
        }
        self.reset_state().await;
    }

    /// Tear the session down: unregister the module, release the module
    /// service name, and clear every piece of session state.
    ///
    /// State is cleared whatever the two bus calls return; the session
    /// is never left half-torn. The call rejects if either the
    /// unregister RPC or the name release failed; a failed attempt
    /// clears the memo so a later call retries.
    pub async fn finalize(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.finalizing
            .get_or_run(move || {
                async move {
                    match this.do_finalize().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.finalizing.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_finalize(&self) -> Result<()> {
        self.ensure_active()?;
        info!("Finalizing session for module {}", self.module_name);

        let unregistered = match self
            .bus
            .call("unregisterDriver", json!({ "driverLocalId": self.module_name }))
            .await
        {
            Ok(reply) if reply.is_success() => Ok(()),
            Ok(reply) => Err(Error::protocol(format!(
                "unregisterDriver returned code {}: {}",
                reply.code, reply.message
            ))),
            Err(e) => Err(Error::from(e)),
        };
        if let Err(e) = &unregistered {
            warn!("unregisterDriver failed while finalizing: {}", e);
        }

        let released = self
            .bus
            .release_name(&module_bus_name(&self.module_name))
            .await;

        self.reset_state().await;
        self.initializing.clear();

        unregistered?;
        released.map_err(Error::from)?;
        info!("Session finalized for module {}", self.module_name);
        Ok(())
    }

    async fn reset_state(&self) {
        let (error_task, module_exported) = {
            let mut state = self.lock_state();
            let task = state.error_task.take();
            let exported = state.module_exported;
            *state = SessionState::default();
            (task, exported)
        };
        if let Some(task) = error_task {
            task.abort();
        }
        if module_exported {
            if let Err(e) = self
                .bus
                .remove_interface(&module_bus_path(&self.module_name))
                .await
            {
                debug!("Failed to remove module interface: {}", e);
            }
        }
        if let Err(e) = self.bus.close().await {
            debug!("Failed to close bus: {}", e);
        }
    }

    async fn acquire_name(&self, name: &str) -> Result<()> {
        match self.bus.request_name(name).await {
            Ok(reply) if reply.is_owned() => Ok(()),
            Ok(NameReply::Exists) => {
                warn!("Bus name {} is already held by another owner", name);
                Err(Error::transport(format!(
                    "Bus name {} is held by another owner",
                    name
                )))
            }
            Ok(reply) => Err(Error::transport(format!(
                "Bus name {} not acquired: {:?}",
                name, reply
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire a service name on the open session
    pub async fn request_name(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.acquire_name(name).await
    }

    /// Release a service name on the open session
    pub async fn release_name(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.bus.release_name(name).await.map_err(Error::from)
    }

    /// Issue a request/reply call on the open session
    pub(crate) async fn call(&self, method: &str, payload: Value) -> Result<ReplyEnvelope> {
        self.ensure_active()?;
        self.bus.call(method, payload).await.map_err(Error::from)
    }

    /// Issue a call and fail on a nonzero envelope code
    pub(crate) async fn call_checked(&self, method: &str, payload: Value) -> Result<Option<Value>> {
        let reply = self.call(method, payload).await?;
        if reply.is_success() {
            Ok(reply.params)
        } else {
            Err(Error::protocol(format!(
                "{} returned code {}: {}",
                method, reply.code, reply.message
            )))
        }
    }

    /// Issue a config-family call returning `(code, payload)`
    pub(crate) async fn call_config(&self, method: &str, args: &[String]) -> Result<(i64, String)> {
        self.ensure_active()?;
        self.bus.call_config(method, args).await.map_err(Error::from)
    }

    /// Export an interface on the open session
    pub async fn export_interface(
        &self,
        path: &str,
        descriptor: InterfaceDescriptor,
        handler: Arc<dyn InboundInterface>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.bus
            .export_interface(path, descriptor, handler)
            .await
            .map_err(Error::from)
    }

    /// Remove an exported interface on the open session
    pub async fn remove_interface(&self, path: &str) -> Result<()> {
        self.ensure_active()?;
        self.bus.remove_interface(path).await.map_err(Error::from)
    }

    /// Emit a fire-and-forget signal on the open session
    pub async fn emit_signal(
        &self,
        destination: &str,
        path: &str,
        signal: &str,
        payload: Value,
    ) -> Result<()> {
        self.ensure_active()?;
        self.bus
            .emit_signal(destination, path, signal, payload)
            .await
            .map_err(Error::from)
    }

    /// Subscribe to config-change notifications received by the module
    pub fn subscribe_config_changes(&self) -> broadcast::Receiver<ConfigChange> {
        self.config_tx.subscribe()
    }

    pub(crate) fn notify_config(&self, key: &str, value: &str) {
        debug!("Config change notification for {}", key);
        let _ = self.config_tx.send(ConfigChange {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub(crate) fn track_device(&self, device_id: &str) {
        self.lock_state().devices.insert(device_id.to_string());
    }

    pub(crate) fn untrack_device(&self, device_id: &str) {
        let mut state = self.lock_state();
        state.devices.remove(device_id);
        state.connected.remove(device_id);
    }

    pub(crate) fn mark_connected(&self, device_id: &str) {
        self.lock_state().connected.insert(device_id.to_string());
    }

    pub(crate) fn mark_disconnected(&self, device_id: &str) {
        self.lock_state().connected.remove(device_id);
    }

    /// Whether the device is currently marked connected
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock_state().connected.contains(device_id)
    }

    /// Number of devices the session currently tracks
    pub fn device_count(&self) -> usize {
        self.lock_state().devices.len()
    }

    /// The device-id listing behind the exported `getDeviceList` method.
    ///
    /// A `key=value` selector with value `online` or `offline` filters by
    /// connectedness; anything else returns the full set.
    pub fn device_list(&self, selector: Option<&str>) -> (usize, Vec<String>) {
        let state = self.lock_state();
        let mut list: Vec<String> = match parse_selector(selector) {
            Some(DeviceSelector::Online) => state.connected.iter().cloned().collect(),
            Some(DeviceSelector::Offline) => {
                state.devices.difference(&state.connected).cloned().collect()
            }
            None => state.devices.iter().cloned().collect(),
        };
        list.sort();
        (list.len(), list)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.lock_state().active {
            Ok(())
        } else {
            Err(Error::precondition("Session is not initialized"))
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handler for the module's exported interface
struct ModuleService {
    session: Weak<Session>,
}

impl ModuleService {
    fn new(session: Weak<Session>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl InboundInterface for ModuleService {
    async fn handle(&self, method: &str, args: &[String]) -> std::result::Result<String, BusError> {
        let session = self.session.upgrade().ok_or(BusError::Closed)?;
        match method {
            "getDeviceList" => {
                let selector = args.first().map(String::as_str);
                let (dev_num, dev_list) = session.device_list(selector);
                Ok(ReplyEnvelope::success(Some(json!({
                    "devNum": dev_num,
                    "devList": dev_list,
                })))
                .to_json())
            }
            "notifyConfig" => {
                let key = args.first().map(String::as_str).unwrap_or_default();
                let value = args.get(1).map(String::as_str).unwrap_or_default();
                session.notify_config(key, value);
                Ok(ReplyEnvelope::success(None).to_json())
            }
            _ => Err(BusError::Other(format!("Unknown module method {}", method))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgelink_bus::testing::MockBus;
    use edgelink_bus::CODE_UNKNOWN;

    fn options(name: &str) -> DriverOptions {
        let mut options = DriverOptions::default();
        options.module.name = name.to_string();
        options
    }

    #[tokio::test]
    async fn test_initialize_brings_session_up() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));

        session.initialize().await.unwrap();

        assert!(bus.is_open());
        assert_eq!(bus.held_names(), vec!["iot.driver.demo"]);
        assert_eq!(bus.interface_paths(), vec!["/iot/driver/demo"]);
        assert_eq!(bus.call_count("registerDriver"), 1);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));

        let (first, second) = tokio::join!(session.initialize(), session.initialize());
        first.unwrap();
        second.unwrap();
        session.initialize().await.unwrap();

        assert_eq!(bus.call_count("registerDriver"), 1);
    }

    #[tokio::test]
    async fn test_initialize_aborts_when_name_is_taken() {
        let bus = MockBus::new();
        bus.script_request_name("iot.driver.demo", Ok(NameReply::Exists));
        let session = Session::new(bus.clone(), &options("demo"));

        let err = session.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(bus.call_count("registerDriver"), 0);
        assert!(bus.interface_paths().is_empty());
        assert!(!bus.is_open());
    }

    #[tokio::test]
    async fn test_initialize_rolls_back_on_register_failure() {
        let bus = MockBus::new();
        bus.script_reply("registerDriver", ReplyEnvelope::failure(CODE_UNKNOWN, "nope"));
        let session = Session::new(bus.clone(), &options("demo"));

        let err = session.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegisterModule);
        assert_eq!(bus.released_names(), vec!["iot.driver.demo"]);
        assert!(bus.held_names().is_empty());

        // The memo was cleared, so a retry issues a fresh registration.
        session.initialize().await.unwrap();
        assert_eq!(bus.call_count("registerDriver"), 2);
    }

    #[tokio::test]
    async fn test_finalize_tears_down_and_permits_reinitialize() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));

        session.initialize().await.unwrap();
        session.track_device("dev-1");
        session.mark_connected("dev-1");

        session.finalize().await.unwrap();

        assert_eq!(bus.call_count("unregisterDriver"), 1);
        assert_eq!(bus.released_names(), vec!["iot.driver.demo"]);
        assert!(!bus.is_open());
        assert_eq!(session.device_count(), 0);

        session.initialize().await.unwrap();
        assert_eq!(bus.call_count("registerDriver"), 2);
    }

    #[tokio::test]
    async fn test_finalize_rejects_when_release_fails_but_clears_state() {
        let bus = MockBus::new();
        bus.fail_release_name("iot.driver.demo", BusError::Send("broken".to_string()));
        let session = Session::new(bus.clone(), &options("demo"));

        session.initialize().await.unwrap();
        let err = session.finalize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        // Torn down regardless of the failed release.
        assert!(!bus.is_open());
        let result = session.call("registerDevice", json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_calls_require_initialized_session() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));

        let err = session
            .call("registerDevice", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(bus.call_count("registerDevice"), 0);
    }

    #[tokio::test]
    async fn test_device_list_selector() {
        let bus = MockBus::new();
        let session = Session::new(bus, &options("demo"));
        session.track_device("dev-a");
        session.track_device("dev-b");
        session.mark_connected("dev-a");

        let (num, list) = session.device_list(Some("deviceState=online"));
        assert_eq!((num, list), (1, vec!["dev-a".to_string()]));

        let (num, list) = session.device_list(Some("deviceState=offline"));
        assert_eq!((num, list), (1, vec!["dev-b".to_string()]));

        let (num, _) = session.device_list(Some("deviceState=all"));
        assert_eq!(num, 2);

        let (num, _) = session.device_list(None);
        assert_eq!(num, 2);
    }

    #[tokio::test]
    async fn test_inbound_get_device_list() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));
        session.initialize().await.unwrap();
        session.track_device("dev-a");
        session.mark_connected("dev-a");

        let raw = bus
            .dispatch(
                "/iot/driver/demo",
                "getDeviceList",
                &["deviceState=online".to_string()],
            )
            .await
            .unwrap();
        let reply = ReplyEnvelope::from_json(&raw).unwrap();
        assert!(reply.is_success());
        let params = reply.params.unwrap();
        assert_eq!(params["devNum"], 1);
        assert_eq!(params["devList"][0], "dev-a");
    }

    #[tokio::test]
    async fn test_inbound_notify_config_reaches_subscribers() {
        let bus = MockBus::new();
        let session = Session::new(bus.clone(), &options("demo"));
        session.initialize().await.unwrap();

        let mut changes = session.subscribe_config_changes();
        bus.dispatch(
            "/iot/driver/demo",
            "notifyConfig",
            &["gw_driverconfig_demo".to_string(), r#"{"deviceList":[]}"#.to_string()],
        )
        .await
        .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.key, "gw_driverconfig_demo");
        assert!(change.value.contains("deviceList"));
    }
}
