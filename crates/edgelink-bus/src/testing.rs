/*!
 * In-memory bus test double.
 *
 * `MockBus` implements [`BusChannel`](crate::channel::BusChannel) against
 * scripted reply queues and records every call, acquired name, and emitted
 * signal so tests can assert on exact bus traffic.
 */
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::channel::{
    BusChannel, BusError, InboundInterface, InterfaceDescriptor, NameReply, Result,
};
use crate::envelope::ReplyEnvelope;

/// One recorded outbound call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Method name on the wire
    pub method: String,
    /// Call payload; config-family calls record their argument list
    pub payload: Value,
}

/// One recorded emitted signal
#[derive(Debug, Clone)]
pub struct EmittedSignal {
    /// Signal destination
    pub destination: String,
    /// Emitting object path
    pub path: String,
    /// Signal name
    pub signal: String,
    /// Signal payload
    pub payload: Value,
}

/// A scripted reply for one outbound call
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Reply with an envelope (request/reply family)
    Envelope(ReplyEnvelope),
    /// Reply with a bare `(code, payload)` pair (config family)
    Config(i64, String),
    /// Fail the call in transport
    Error(BusError),
}

/// In-memory [`BusChannel`] double with scripted replies and call recording
pub struct MockBus {
    opened: AtomicBool,
    device_seq: AtomicU64,
    calls: Mutex<Vec<RecordedCall>>,
    scripted: Mutex<HashMap<String, VecDeque<MockReply>>>,
    name_replies: Mutex<HashMap<String, VecDeque<std::result::Result<NameReply, BusError>>>>,
    release_failures: Mutex<HashMap<String, BusError>>,
    held_names: Mutex<Vec<String>>,
    released_names: Mutex<Vec<String>>,
    interfaces: Mutex<HashMap<String, (InterfaceDescriptor, Arc<dyn InboundInterface>)>>,
    signals: Mutex<Vec<EmittedSignal>>,
    errors_tx: broadcast::Sender<BusError>,
}

impl MockBus {
    /// Create a mock bus with empty scripts
    pub fn new() -> Arc<Self> {
        let (errors_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            opened: AtomicBool::new(false),
            device_seq: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            scripted: Mutex::new(HashMap::new()),
            name_replies: Mutex::new(HashMap::new()),
            release_failures: Mutex::new(HashMap::new()),
            held_names: Mutex::new(Vec::new()),
            released_names: Mutex::new(Vec::new()),
            interfaces: Mutex::new(HashMap::new()),
            signals: Mutex::new(Vec::new()),
            errors_tx,
        })
    }

    /// Script the next reply for `method`
    pub fn script_reply(&self, method: &str, envelope: ReplyEnvelope) {
        self.script(method, MockReply::Envelope(envelope));
    }

    /// Script the next config-family reply for `method`
    pub fn script_config(&self, method: &str, code: i64, payload: &str) {
        self.script(method, MockReply::Config(code, payload.to_string()));
    }

    /// Script the next call to `method` to fail in transport
    pub fn script_error(&self, method: &str, error: BusError) {
        self.script(method, MockReply::Error(error));
    }

    fn script(&self, method: &str, reply: MockReply) {
        self.lock(&self.scripted)
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Script the next `request_name` outcome for `name`
    pub fn script_request_name(
        &self,
        name: &str,
        reply: std::result::Result<NameReply, BusError>,
    ) {
        self.lock(&self.name_replies)
            .entry(name.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Make every `release_name` for `name` fail with `error`
    pub fn fail_release_name(&self, name: &str, error: BusError) {
        self.lock(&self.release_failures)
            .insert(name.to_string(), error);
    }

    /// Number of calls issued to `method` (both call families)
    pub fn call_count(&self, method: &str) -> usize {
        self.lock(&self.calls)
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Recorded payloads for `method`, in call order
    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.lock(&self.calls)
            .iter()
            .filter(|c| c.method == method)
            .map(|c| c.payload.clone())
            .collect()
    }

    /// Names currently held
    pub fn held_names(&self) -> Vec<String> {
        self.lock(&self.held_names).clone()
    }

    /// Names released so far, in release order
    pub fn released_names(&self) -> Vec<String> {
        self.lock(&self.released_names).clone()
    }

    /// Paths with an exported interface
    pub fn interface_paths(&self) -> Vec<String> {
        self.lock(&self.interfaces).keys().cloned().collect()
    }

    /// Signals emitted so far
    pub fn emitted_signals(&self) -> Vec<EmittedSignal> {
        self.lock(&self.signals).clone()
    }

    /// Whether the bus has been opened and not closed
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Inject a transport error toward error subscribers
    pub fn push_error(&self, error: BusError) {
        let _ = self.errors_tx.send(error);
    }

    /// Drive an inbound call into the interface exported at `path`
    pub async fn dispatch(&self, path: &str, method: &str, args: &[String]) -> Result<String> {
        let handler = {
            let interfaces = self.lock(&self.interfaces);
            interfaces
                .get(path)
                .map(|(_, handler)| Arc::clone(handler))
                .ok_or_else(|| BusError::Other(format!("No interface at {}", path)))?
        };
        handler.handle(method, args).await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    fn record(&self, method: &str, payload: Value) {
        self.lock(&self.calls).push(RecordedCall {
            method: method.to_string(),
            payload,
        });
    }

    fn next_scripted(&self, method: &str) -> Option<MockReply> {
        self.lock(&self.scripted)
            .get_mut(method)
            .and_then(|queue| queue.pop_front())
    }

    fn default_envelope(&self, method: &str, payload: &Value) -> ReplyEnvelope {
        if method == "registerDevice" {
            let cloud_id = match (
                payload.get("productKey").and_then(Value::as_str),
                payload
                    .get("deviceName")
                    .or_else(|| payload.get("deviceLocalId"))
                    .and_then(Value::as_str),
            ) {
                (Some(pk), Some(name)) => format!("cloud-{}-{}", pk, name),
                _ => format!("cloud-{}", self.device_seq.fetch_add(1, Ordering::SeqCst)),
            };
            ReplyEnvelope::success(Some(json!({ "deviceCloudId": cloud_id })))
        } else {
            ReplyEnvelope::success(None)
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for MockBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBus")
            .field("opened", &self.is_open())
            .field("calls", &self.lock(&self.calls).len())
            .field("held_names", &self.held_names())
            .finish()
    }
}

#[async_trait]
impl BusChannel for MockBus {
    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn call(&self, method: &str, payload: Value) -> Result<ReplyEnvelope> {
        self.ensure_open()?;
        self.record(method, payload.clone());
        match self.next_scripted(method) {
            Some(MockReply::Envelope(envelope)) => Ok(envelope),
            Some(MockReply::Error(error)) => Err(error),
            Some(MockReply::Config(code, raw)) => Err(BusError::InvalidReply(
                method.to_string(),
                format!("config reply ({}, {}) scripted for envelope call", code, raw),
            )),
            None => Ok(self.default_envelope(method, &payload)),
        }
    }

    async fn call_config(&self, method: &str, args: &[String]) -> Result<(i64, String)> {
        self.ensure_open()?;
        self.record(method, json!(args));
        match self.next_scripted(method) {
            Some(MockReply::Config(code, raw)) => Ok((code, raw)),
            Some(MockReply::Error(error)) => Err(error),
            Some(MockReply::Envelope(envelope)) => Err(BusError::InvalidReply(
                method.to_string(),
                format!("envelope {} scripted for config call", envelope.to_json()),
            )),
            None if method == "get_config" => Ok((0, "{}".to_string())),
            None => Ok((0, String::new())),
        }
    }

    async fn request_name(&self, name: &str) -> Result<NameReply> {
        self.ensure_open()?;
        let scripted = self
            .lock(&self.name_replies)
            .get_mut(name)
            .and_then(|queue| queue.pop_front());
        let reply = match scripted {
            Some(reply) => reply?,
            None => NameReply::PrimaryOwner,
        };
        if reply.is_owned() {
            self.lock(&self.held_names).push(name.to_string());
        }
        Ok(reply)
    }

    async fn release_name(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(error) = self.lock(&self.release_failures).get(name) {
            return Err(error.clone());
        }
        self.lock(&self.held_names).retain(|held| held != name);
        self.lock(&self.released_names).push(name.to_string());
        Ok(())
    }

    async fn export_interface(
        &self,
        path: &str,
        descriptor: InterfaceDescriptor,
        handler: Arc<dyn InboundInterface>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.lock(&self.interfaces)
            .insert(path.to_string(), (descriptor, handler));
        Ok(())
    }

    async fn remove_interface(&self, path: &str) -> Result<()> {
        self.lock(&self.interfaces).remove(path);
        Ok(())
    }

    async fn emit_signal(
        &self,
        destination: &str,
        path: &str,
        signal: &str,
        payload: Value,
    ) -> Result<()> {
        self.ensure_open()?;
        self.lock(&self.signals).push(EmittedSignal {
            destination: destination.to_string(),
            path: path.to_string(),
            signal: signal.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<BusError> {
        self.errors_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_require_open() {
        let bus = MockBus::new();
        let result = bus.call("registerDriver", json!({})).await;
        assert!(matches!(result, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_default_register_device_reply() {
        let bus = MockBus::new();
        bus.open().await.unwrap();

        let reply = bus
            .call(
                "registerDevice",
                json!({"productKey": "pk", "deviceName": "lamp"}),
            )
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.params.unwrap()["deviceCloudId"], "cloud-pk-lamp");
    }

    #[tokio::test]
    async fn test_scripted_replies_consumed_in_order() {
        let bus = MockBus::new();
        bus.open().await.unwrap();
        bus.script_reply("startupDevice", ReplyEnvelope::failure(9, "busy"));

        let first = bus.call("startupDevice", json!({})).await.unwrap();
        assert_eq!(first.code, 9);

        let second = bus.call("startupDevice", json!({})).await.unwrap();
        assert!(second.is_success());
        assert_eq!(bus.call_count("startupDevice"), 2);
    }

    #[tokio::test]
    async fn test_name_bookkeeping() {
        let bus = MockBus::new();
        bus.open().await.unwrap();

        bus.request_name("iot.driver.demo").await.unwrap();
        assert_eq!(bus.held_names(), vec!["iot.driver.demo"]);

        bus.release_name("iot.driver.demo").await.unwrap();
        assert!(bus.held_names().is_empty());
        assert_eq!(bus.released_names(), vec!["iot.driver.demo"]);
    }

    #[tokio::test]
    async fn test_scripted_name_exists() {
        let bus = MockBus::new();
        bus.open().await.unwrap();
        bus.script_request_name("iot.driver.demo", Ok(NameReply::Exists));

        let reply = bus.request_name("iot.driver.demo").await.unwrap();
        assert_eq!(reply, NameReply::Exists);
        assert!(bus.held_names().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_exported_interface() {
        struct Echo;

        #[async_trait]
        impl InboundInterface for Echo {
            async fn handle(&self, method: &str, args: &[String]) -> Result<String> {
                Ok(format!("{}:{}", method, args.join(",")))
            }
        }

        let bus = MockBus::new();
        bus.open().await.unwrap();
        bus.export_interface(
            "/iot/driver/demo",
            InterfaceDescriptor::new("iot.driver").with_method("getDeviceList"),
            Arc::new(Echo),
        )
        .await
        .unwrap();

        let reply = bus
            .dispatch("/iot/driver/demo", "getDeviceList", &["a=b".to_string()])
            .await
            .unwrap();
        assert_eq!(reply, "getDeviceList:a=b");
    }
}
