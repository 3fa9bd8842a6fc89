/*!
 * The per-device lifecycle state machine.
 *
 * Every thing the module drives gets one `DeviceAccess` instance walking
 * `Unset → Registered → Connected → Registered → Unset`. Lifecycle
 * operations are memoized single-slot futures: repeated callers share one
 * outcome and at most one RPC is in flight per operation. Acquisition
 * operations roll back partial state on failure; release operations
 * continue past non-critical sub-step failures.
 */
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use edgelink_bus::{
    device_bus_name, device_bus_path, BusError, InboundInterface, InterfaceDescriptor,
    ReplyEnvelope, CODE_RETRY_CONNECT, CODE_SUCCESS, CODE_UNKNOWN, SUBSCRIBE_DESTINATION,
};
use edgelink_core::utils::{spawn_and_log, OpCell};

use crate::callbacks::ThingCallbacks;
use crate::error::{Error, ErrorKind, Result};
use crate::session::Session;
use crate::thing_info::ThingInfo;

/// Interface name exported at each connected device path
pub const DEVICE_INTERFACE: &str = "iot.edgelink.thing";

/// Hex digest identifying a thing specification document
fn profile_hash(tsl: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tsl.as_bytes());
    hex::encode(hasher.finalize())
}

/// The lifecycle state machine for one thing
pub struct DeviceAccess {
    session: Arc<Session>,
    info: ThingInfo,
    local_id: String,
    callbacks: Arc<dyn ThingCallbacks>,
    device_id: Mutex<Option<String>>,
    iface_path: Mutex<Option<String>>,
    setup_op: OpCell<(), Error>,
    register_op: OpCell<(), Error>,
    connect_op: OpCell<(), Error>,
    disconnect_op: OpCell<(), Error>,
    unregister_op: OpCell<(), Error>,
    tsl_op: OpCell<String, Error>,
    tsl_ext_op: OpCell<String, Error>,
}

impl DeviceAccess {
    /// Create the access instance for one thing.
    ///
    /// The thing identity is validated here; an invalid record never
    /// reaches the bus.
    pub fn new(
        session: Arc<Session>,
        info: ThingInfo,
        callbacks: Arc<dyn ThingCallbacks>,
    ) -> Result<Arc<Self>> {
        info.validate()?;
        let local_id = info
            .local_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Arc::new(Self {
            session,
            info,
            local_id,
            callbacks,
            device_id: Mutex::new(None),
            iface_path: Mutex::new(None),
            setup_op: OpCell::new(),
            register_op: OpCell::new(),
            connect_op: OpCell::new(),
            disconnect_op: OpCell::new(),
            unregister_op: OpCell::new(),
            tsl_op: OpCell::new(),
            tsl_ext_op: OpCell::new(),
        }))
    }

    /// The thing identity this instance drives
    pub fn info(&self) -> &ThingInfo {
        &self.info
    }

    /// The shared session this instance runs on
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The local identity used before a cloud id is assigned
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The cloud-assigned device id, present between register and
    /// unregister
    pub fn device_id(&self) -> Option<String> {
        self.lock_device_id().clone()
    }

    /// Whether the device is currently connected
    pub fn is_connected(&self) -> bool {
        self.device_id()
            .map(|id| self.session.is_connected(&id))
            .unwrap_or(false)
    }

    /// Ensure the shared session is up. Memoized; a failure clears the
    /// memo and surfaces tagged `setup`.
    pub async fn setup(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.setup_op
            .get_or_run(move || {
                async move {
                    match this.session.initialize().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.setup_op.clear();
                            Err(e.with_kind(ErrorKind::Setup))
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    /// Register the thing with the broker.
    ///
    /// Fetches and hashes the thing specification first; a specification
    /// failure aborts before any `registerDevice` RPC. On success the
    /// cloud-assigned device id is stored locally and tracked by the
    /// session. Memoized; a failure clears the memo.
    pub async fn register(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.register_op
            .get_or_run(move || {
                async move {
                    match this.do_register().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.register_op.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_register(self: &Arc<Self>) -> Result<()> {
        let tsl = self.get_tsl().await?;
        let profile: Value = serde_json::from_str(&tsl)?;
        let hash = profile_hash(&tsl);

        let mut payload = json!({
            "productKey": self.info.product_key,
            "driverName": self.session.module_name(),
            "deviceProfile": profile,
            "profileHash": hash,
            "isLocal": self.session.is_local(),
        });
        match self.info.device_name.as_ref().filter(|name| !name.is_empty()) {
            Some(name) => payload["deviceName"] = json!(name),
            None => payload["deviceLocalId"] = json!(self.local_id),
        }

        let params = self
            .session
            .call_checked("registerDevice", payload)
            .await
            .map_err(|e| e.with_kind(ErrorKind::Register))?;
        let cloud_id = params
            .as_ref()
            .and_then(|p| p.get("deviceCloudId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::new(ErrorKind::Register, "registerDevice reply has no deviceCloudId")
            })?;

        *self.lock_device_id() = Some(cloud_id.to_string());
        self.session.track_device(cloud_id);
        // A fresh registration pairs with a fresh unregister.
        self.unregister_op.clear();
        info!("Registered {} as {}", self.local_id, cloud_id);
        Ok(())
    }

    /// Bring the device online: acquire its bus name, issue the startup
    /// RPC, export its interface.
    ///
    /// The just-acquired bus name is rolled back only when a later step
    /// fails. Memoized; a failure clears the memo.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.connect_op
            .get_or_run(move || {
                async move {
                    match this.do_connect().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.connect_op.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_connect(self: &Arc<Self>) -> Result<()> {
        let id = self
            .device_id()
            .ok_or_else(|| Error::precondition("Device must register first"))?;

        let bus_name = device_bus_name(&id);
        self.session
            .request_name(&bus_name)
            .await
            .map_err(|e| e.with_kind(ErrorKind::Connect))?;

        if let Err(e) = self
            .session
            .call_checked("startupDevice", json!({ "deviceCloudId": id }))
            .await
        {
            if let Err(release_err) = self.session.release_name(&bus_name).await {
                warn!(
                    "Failed to release {} while rolling back connect: {}",
                    bus_name, release_err
                );
            }
            return Err(e.with_kind(ErrorKind::Connect));
        }

        self.session.mark_connected(&id);

        let path = device_bus_path(&id);
        let descriptor = InterfaceDescriptor::new(DEVICE_INTERFACE)
            .with_method("callServices")
            .with_method("connectResultNotify")
            .with_signal("propertiesChanged");
        let handler: Arc<dyn InboundInterface> =
            Arc::new(DeviceService::new(Arc::downgrade(self)));
        if let Err(e) = self.session.export_interface(&path, descriptor, handler).await {
            self.session.mark_disconnected(&id);
            if let Err(release_err) = self.session.release_name(&bus_name).await {
                warn!(
                    "Failed to release {} while rolling back connect: {}",
                    bus_name, release_err
                );
            }
            return Err(e.with_kind(ErrorKind::Connect));
        }
        *self.lock_iface() = Some(path);

        // A fresh connect pairs with a fresh disconnect.
        self.disconnect_op.clear();
        info!("Device {} is online", id);
        Ok(())
    }

    /// Take the device offline.
    ///
    /// The shutdown RPC failing restores the interface handle and the
    /// connected mark; the best-effort name release afterwards never
    /// fails the operation. Memoized; a failure clears the memo.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.disconnect_op
            .get_or_run(move || {
                async move {
                    match this.do_disconnect().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.disconnect_op.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_disconnect(&self) -> Result<()> {
        let id = match self.device_id() {
            Some(id) if self.session.is_connected(&id) => id,
            _ => return Err(Error::precondition("Device is not connected")),
        };

        let saved_path = self.lock_iface().take();
        self.session.mark_disconnected(&id);

        if let Err(e) = self
            .session
            .call_checked("shutdownDevice", json!({ "deviceCloudId": id }))
            .await
        {
            *self.lock_iface() = saved_path;
            self.session.mark_connected(&id);
            return Err(e.with_kind(ErrorKind::Disconnect));
        }

        let bus_name = device_bus_name(&id);
        if let Err(e) = self.session.release_name(&bus_name).await {
            warn!("Failed to release {} after disconnect: {}", bus_name, e);
        }
        if let Some(path) = saved_path {
            if let Err(e) = self.session.remove_interface(&path).await {
                debug!("Failed to remove interface {}: {}", path, e);
            }
        }

        self.connect_op.clear();
        info!("Device {} is offline", id);
        Ok(())
    }

    /// Unregister the thing from the broker.
    ///
    /// A still-connected device is disconnected first. The unregister
    /// RPC failing is terminal for this call and resurrects no state.
    /// Memoized; a failure clears the memo.
    pub async fn unregister(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        self.unregister_op
            .get_or_run(move || {
                async move {
                    match this.do_unregister().await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            this.unregister_op.clear();
                            Err(e)
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn do_unregister(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            self.disconnect()
                .await
                .map_err(|e| e.with_kind(ErrorKind::Unregister))?;
        }

        let id = self.device_id().ok_or_else(|| {
            Error::precondition("Device is not registered or already cleaned up")
        })?;

        self.session
            .call_checked("unregisterDevice", json!({ "deviceCloudId": id }))
            .await
            .map_err(|e| e.with_kind(ErrorKind::Unregister))?;

        *self.lock_device_id() = None;
        self.session.untrack_device(&id);
        self.register_op.clear();
        info!("Unregistered {}", id);
        Ok(())
    }

    /// Free every local resource held for the thing.
    ///
    /// A still-connected device is force-disconnected with the failure
    /// only warned. All memoized operations are reset so a fresh
    /// register/connect cycle is possible. The shared session is left
    /// running; tearing it down is the caller's explicit decision.
    pub async fn cleanup(self: &Arc<Self>) -> Result<()> {
        if self.is_connected() {
            warn!("Device {} is still connected, forcing a disconnect", self.local_id);
            if let Err(e) = self.disconnect().await {
                warn!("Forced disconnect of {} failed: {}", self.local_id, e);
            }
        }

        if let Some(id) = self.lock_device_id().take() {
            self.session.untrack_device(&id);
        }
        *self.lock_iface() = None;

        self.setup_op.clear();
        self.register_op.clear();
        self.connect_op.clear();
        self.disconnect_op.clear();
        self.unregister_op.clear();
        self.tsl_op.clear();
        self.tsl_ext_op.clear();

        info!("Cleaned up {}", self.local_id);
        Ok(())
    }

    /// Fetch the thing specification document. Memoized; a failure
    /// clears the memo and surfaces tagged `get_tsl`.
    pub async fn get_tsl(self: &Arc<Self>) -> Result<String> {
        let this = Arc::clone(self);
        let key = format!("TSL_{}", self.info.product_key);
        self.tsl_op
            .get_or_run(move || {
                async move {
                    match this.fetch_config_document(&key).await {
                        Ok(document) => Ok(document),
                        Err(e) => {
                            this.tsl_op.clear();
                            Err(e.with_kind(ErrorKind::GetTsl))
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    /// Fetch the extended specification info. Memoized; a failure clears
    /// the memo and surfaces tagged `get_tsl`.
    pub async fn get_tsl_ext_info(self: &Arc<Self>) -> Result<String> {
        let this = Arc::clone(self);
        let key = format!("TSL_config_{}", self.info.product_key);
        self.tsl_ext_op
            .get_or_run(move || {
                async move {
                    match this.fetch_config_document(&key).await {
                        Ok(document) => Ok(document),
                        Err(e) => {
                            this.tsl_ext_op.clear();
                            Err(e.with_kind(ErrorKind::GetTsl))
                        }
                    }
                }
                .boxed()
            })
            .await
    }

    async fn fetch_config_document(&self, key: &str) -> Result<String> {
        let (code, raw) = self
            .session
            .call_config("get_config", &[key.to_string()])
            .await?;
        if code != 0 {
            return Err(Error::protocol(format!(
                "get_config {} returned code {}",
                key, code
            )));
        }
        serde_json::from_str::<Value>(&raw).map_err(|e| {
            Error::protocol(format!("get_config {} payload is not JSON: {}", key, e))
        })?;
        Ok(raw)
    }

    /// Report current property values.
    ///
    /// Not memoized: the precondition failure is returned before any
    /// suspension, and the emission itself is fire-and-forget with
    /// transport failures only logged.
    pub fn report_properties(&self, properties: Map<String, Value>) -> Result<()> {
        let id = self
            .device_id()
            .ok_or_else(|| Error::precondition("Device is not registered"))?;

        let timestamp = Utc::now().timestamp_millis();
        let wrapped: Map<String, Value> = properties
            .into_iter()
            .map(|(key, value)| (key, json!({ "value": value, "time": timestamp })))
            .collect();

        let session = Arc::clone(&self.session);
        let path = device_bus_path(&id);
        spawn_and_log("report_properties", async move {
            session
                .emit_signal(
                    SUBSCRIBE_DESTINATION,
                    &path,
                    "propertiesChanged",
                    Value::Object(wrapped),
                )
                .await
        });
        Ok(())
    }

    /// Report an occurred event with its output arguments.
    ///
    /// Same contract as [`DeviceAccess::report_properties`]: synchronous
    /// precondition, fire-and-forget emission.
    pub fn report_event(&self, name: &str, params: Map<String, Value>) -> Result<()> {
        let id = self
            .device_id()
            .ok_or_else(|| Error::precondition("Device is not registered"))?;

        let timestamp = Utc::now().timestamp_millis();
        let payload = json!({ "value": params, "time": timestamp });

        let session = Arc::clone(&self.session);
        let path = device_bus_path(&id);
        let signal = name.to_string();
        spawn_and_log("report_event", async move {
            session
                .emit_signal(SUBSCRIBE_DESTINATION, &path, &signal, payload)
                .await
        });
        Ok(())
    }

    /// Dispatch one inbound service invocation to the thing callbacks
    /// and normalize the outcome into a reply envelope.
    pub(crate) async fn call_services(&self, name: &str, args_json: &str) -> Result<ReplyEnvelope> {
        debug!("Inbound service call {} for {}", name, self.local_id);
        let args: Value = serde_json::from_str(args_json)
            .map_err(|e| Error::protocol(format!("Service arguments are not JSON: {}", e)))?;

        match name {
            "get" => {
                let keys = args
                    .get("params")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        Error::protocol("get params must be an array of property keys")
                    })?
                    .iter()
                    .map(|key| {
                        key.as_str().map(str::to_string).ok_or_else(|| {
                            Error::protocol("property keys must be strings")
                        })
                    })
                    .collect::<Result<Vec<String>>>()?;

                let output = self.callbacks.get_properties(keys).await?;
                if !output.is_ok() {
                    return Ok(ReplyEnvelope::failure(CODE_UNKNOWN, output.message));
                }
                if !output.data.is_object() {
                    return Err(Error::protocol(
                        "get callback must return a properties object",
                    ));
                }
                Ok(ReplyEnvelope {
                    code: CODE_SUCCESS,
                    message: "success".to_string(),
                    params: Some(output.data),
                })
            }
            "set" => {
                let properties = args
                    .get("params")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or_else(|| Error::protocol("set params must be an object"))?;

                let output = self.callbacks.set_properties(properties).await?;
                if !output.is_ok() {
                    return Ok(ReplyEnvelope::failure(CODE_UNKNOWN, output.message));
                }
                let params = if output.data.is_null() {
                    None
                } else {
                    Some(output.data)
                };
                Ok(ReplyEnvelope {
                    code: CODE_SUCCESS,
                    message: "success".to_string(),
                    params,
                })
            }
            service => {
                let service_args = args
                    .get("params")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();

                let output = self.callbacks.call_service(service, service_args).await?;
                let (code, message) = if output.is_ok() {
                    (CODE_SUCCESS, "success".to_string())
                } else {
                    (CODE_UNKNOWN, output.message.clone())
                };
                Ok(ReplyEnvelope {
                    code,
                    message,
                    params: Some(json!({
                        "code": output.code,
                        "message": output.message,
                        "data": output.data,
                    })),
                })
            }
        }
    }

    /// Handle an inbound connect-result notification.
    ///
    /// A malformed document or one without `params` is logged and
    /// ignored. The retry code triggers a fire-and-forget reconnect
    /// whose failure is only logged.
    pub(crate) fn connect_result_notify(self: &Arc<Self>, raw: &str) {
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring malformed connect result for {}: {}", self.local_id, e);
                return;
            }
        };
        if parsed.get("params").is_none() {
            warn!("Ignoring connect result without params for {}", self.local_id);
            return;
        }

        let code = parsed.get("code").and_then(Value::as_i64).unwrap_or(CODE_SUCCESS);
        if code == CODE_RETRY_CONNECT {
            info!("Gateway requested a reconnect for {}", self.local_id);
            self.connect_op.clear();
            let this = Arc::clone(self);
            spawn_and_log("reconnect", async move { this.connect().await });
        } else {
            debug!("Connect result for {}: code {}", self.local_id, code);
        }
    }

    fn lock_device_id(&self) -> MutexGuard<'_, Option<String>> {
        self.device_id.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_iface(&self) -> MutexGuard<'_, Option<String>> {
        self.iface_path.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handler for a device's exported interface
struct DeviceService {
    device: Weak<DeviceAccess>,
}

impl DeviceService {
    fn new(device: Weak<DeviceAccess>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl InboundInterface for DeviceService {
    async fn handle(&self, method: &str, args: &[String]) -> std::result::Result<String, BusError> {
        let device = self.device.upgrade().ok_or(BusError::Closed)?;
        match method {
            "callServices" => {
                let name = args.first().map(String::as_str).unwrap_or_default();
                let args_json = args.get(1).map(String::as_str).unwrap_or("{}");
                match device.call_services(name, args_json).await {
                    Ok(reply) => Ok(reply.to_json()),
                    Err(e) => {
                        error!("Service dispatch {} failed: {}", name, e);
                        Err(BusError::Other(e.to_string()))
                    }
                }
            }
            "connectResultNotify" => {
                let raw = args.first().map(String::as_str).unwrap_or_default();
                device.connect_result_notify(raw);
                Ok(ReplyEnvelope::success(None).to_json())
            }
            _ => Err(BusError::Other(format!("Unknown device method {}", method))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackOutput;
    use edgelink_bus::testing::MockBus;
    use edgelink_core::config::DriverOptions;
    use std::time::Duration;

    struct TestThing {
        fail_get: bool,
        explode_get: bool,
    }

    impl TestThing {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_get: false,
                explode_get: false,
            })
        }
    }

    #[async_trait]
    impl ThingCallbacks for TestThing {
        async fn get_properties(&self, keys: Vec<String>) -> Result<CallbackOutput> {
            if self.explode_get {
                return Err(Error::protocol("callback exploded"));
            }
            if self.fail_get {
                return Ok(CallbackOutput::fail(7, "no such property"));
            }
            let mut data = Map::new();
            for key in keys {
                data.insert(key, json!(21));
            }
            Ok(CallbackOutput::ok(Value::Object(data)))
        }

        async fn set_properties(&self, properties: Map<String, Value>) -> Result<CallbackOutput> {
            Ok(CallbackOutput::ok(Value::Object(properties)))
        }

        async fn call_service(&self, name: &str, _args: Map<String, Value>) -> Result<CallbackOutput> {
            Ok(CallbackOutput {
                code: 0,
                message: "success".to_string(),
                data: json!({ "service": name }),
            })
        }
    }

    fn device_over(bus: &Arc<MockBus>) -> Arc<DeviceAccess> {
        let mut options = DriverOptions::default();
        options.module.name = "demo".to_string();
        let session = Session::new(bus.clone(), &options);
        DeviceAccess::new(session, ThingInfo::new("pk", "lamp"), TestThing::new()).unwrap()
    }

    async fn bring_online(device: &Arc<DeviceAccess>) {
        device.setup().await.unwrap();
        device.register().await.unwrap();
        device.connect().await.unwrap();
    }

    async fn wait_for_signal(bus: &Arc<MockBus>) {
        for _ in 0..100 {
            if !bus.emitted_signals().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no signal emitted");
    }

    #[test]
    fn test_profile_hash_is_stable() {
        let a = profile_hash(r#"{"properties":[]}"#);
        let b = profile_hash(r#"{"properties":[]}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, profile_hash("{}"));
    }

    #[test]
    fn test_new_rejects_invalid_identity() {
        let bus = MockBus::new();
        let session = Session::new(bus, &DriverOptions::default());
        let invalid = ThingInfo {
            product_key: String::new(),
            device_name: None,
            custom: None,
        };
        assert!(DeviceAccess::new(session, invalid, TestThing::new()).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_get_shapes_flat_properties() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let reply = device
            .call_services("get", r#"{"params": ["temperature"]}"#)
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.params.unwrap()["temperature"], 21);
    }

    #[tokio::test]
    async fn test_dispatch_get_rejects_non_array_params() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let err = device
            .call_services("get", r#"{"params": {"temperature": 1}}"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_dispatch_failure_code_is_normalized() {
        let bus = MockBus::new();
        let mut options = DriverOptions::default();
        options.module.name = "demo".to_string();
        let session = Session::new(bus.clone(), &options);
        let device = DeviceAccess::new(
            session,
            ThingInfo::new("pk", "lamp"),
            Arc::new(TestThing {
                fail_get: true,
                explode_get: false,
            }),
        )
        .unwrap();
        bring_online(&device).await;

        let reply = device
            .call_services("get", r#"{"params": []}"#)
            .await
            .unwrap();
        assert_eq!(reply.code, CODE_UNKNOWN);
        assert_eq!(reply.message, "no such property");
    }

    #[tokio::test]
    async fn test_dispatch_callback_error_propagates() {
        let bus = MockBus::new();
        let mut options = DriverOptions::default();
        options.module.name = "demo".to_string();
        let session = Session::new(bus.clone(), &options);
        let device = DeviceAccess::new(
            session,
            ThingInfo::new("pk", "lamp"),
            Arc::new(TestThing {
                fail_get: false,
                explode_get: true,
            }),
        )
        .unwrap();
        bring_online(&device).await;

        let err = device
            .call_services("get", r#"{"params": []}"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[tokio::test]
    async fn test_dispatch_set_echoes_params() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let reply = device
            .call_services("set", r#"{"params": {"brightness": 80}}"#)
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.params.unwrap()["brightness"], 80);
    }

    #[tokio::test]
    async fn test_dispatch_generic_service_nests_result() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let reply = device
            .call_services("blink", r#"{"params": {"times": 3}}"#)
            .await
            .unwrap();
        assert!(reply.is_success());
        let params = reply.params.unwrap();
        assert_eq!(params["code"], 0);
        assert_eq!(params["data"]["service"], "blink");
    }

    #[tokio::test]
    async fn test_report_properties_wraps_values() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let mut properties = Map::new();
        properties.insert("temperature".to_string(), json!(23));
        device.report_properties(properties).unwrap();
        wait_for_signal(&bus).await;

        let signals = bus.emitted_signals();
        assert_eq!(signals[0].signal, "propertiesChanged");
        assert_eq!(signals[0].destination, SUBSCRIBE_DESTINATION);
        assert_eq!(signals[0].payload["temperature"]["value"], 23);
        assert!(signals[0].payload["temperature"]["time"].is_i64());
    }

    #[tokio::test]
    async fn test_report_event_wraps_arguments() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;

        let mut params = Map::new();
        params.insert("level".to_string(), json!("high"));
        device.report_event("overheat", params).unwrap();
        wait_for_signal(&bus).await;

        let signals = bus.emitted_signals();
        assert_eq!(signals[0].signal, "overheat");
        assert_eq!(signals[0].payload["value"]["level"], "high");
        assert!(signals[0].payload["time"].is_i64());
    }

    #[tokio::test]
    async fn test_report_requires_registration() {
        let bus = MockBus::new();
        let device = device_over(&bus);

        let err = device.report_properties(Map::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(bus.emitted_signals().is_empty());
    }

    #[tokio::test]
    async fn test_connect_result_notify_ignores_garbage() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;
        let startup_calls = bus.call_count("startupDevice");

        device.connect_result_notify("not json");
        device.connect_result_notify(r#"{"code": 102}"#); // params missing
        device.connect_result_notify(r#"{"code": 0, "params": {}}"#);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(bus.call_count("startupDevice"), startup_calls);
    }

    #[tokio::test]
    async fn test_connect_result_notify_retry_code_reconnects() {
        let bus = MockBus::new();
        let device = device_over(&bus);
        bring_online(&device).await;
        let startup_calls = bus.call_count("startupDevice");

        device.connect_result_notify(r#"{"code": 102, "params": {}}"#);
        for _ in 0..100 {
            if bus.call_count("startupDevice") > startup_calls {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(bus.call_count("startupDevice"), startup_calls + 1);
    }
}
