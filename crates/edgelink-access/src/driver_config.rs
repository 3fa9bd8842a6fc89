/*!
 * Remote driver configuration retrieval and change subscription.
 *
 * The gateway stores each module's configuration under a key derived
 * from the module identity. This manager fetches it, normalizes it to
 * its `deviceList`/`config` core, and relays change notifications.
 */
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::session::Session;
use crate::thing_info::DriverConfig;

/// Owner flag passed when subscribing to the module's config key
const SUBSCRIBE_AS_OWNER: &str = "1";

/// Retrieves and watches the module's driver configuration
pub struct DriverConfigManager {
    session: Arc<Session>,
    changes_tx: broadcast::Sender<String>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl DriverConfigManager {
    /// Create a manager over the given session
    pub fn new(session: Arc<Session>) -> Self {
        let (changes_tx, _) = broadcast::channel(16);
        Self {
            session,
            changes_tx,
            forwarder: Mutex::new(None),
        }
    }

    /// The configuration key for this module
    pub fn config_key(&self) -> String {
        format!("gw_driverconfig_{}", self.session.module_name())
    }

    /// Fetch the driver configuration and normalize it to exactly its
    /// `deviceList` and `config` members, returned re-serialized.
    pub async fn get_config(&self) -> Result<String> {
        self.session
            .initialize()
            .await
            .map_err(|e| e.with_kind(ErrorKind::GetConfig))?;

        let key = self.config_key();
        let (code, raw) = self
            .session
            .call_config("get_config", &[key.clone()])
            .await
            .map_err(|e| e.with_kind(ErrorKind::GetConfig))?;
        if code != 0 {
            return Err(Error::new(
                ErrorKind::GetConfig,
                format!("get_config {} returned code {}", key, code),
            ));
        }

        let config = DriverConfig::parse(&raw).map_err(|e| e.with_kind(ErrorKind::GetConfig))?;
        Ok(config.to_normalized_json())
    }

    /// Subscribe to changes of the module's config key.
    ///
    /// Returns a receiver of the raw new values. The module's inbound
    /// config notifications are filtered by key match and forwarded.
    pub async fn listen_changes(&self) -> Result<broadcast::Receiver<String>> {
        self.session
            .initialize()
            .await
            .map_err(|e| e.with_kind(ErrorKind::GetConfig))?;

        let key = self.config_key();
        let (code, _) = self
            .session
            .call_config(
                "subscribe_config",
                &[
                    self.session.module_name().to_string(),
                    key.clone(),
                    SUBSCRIBE_AS_OWNER.to_string(),
                ],
            )
            .await
            .map_err(|e| e.with_kind(ErrorKind::GetConfig))?;
        if code != 0 {
            return Err(Error::new(
                ErrorKind::GetConfig,
                format!("subscribe_config {} returned code {}", key, code),
            ));
        }

        let mut forwarder = self.lock_forwarder();
        if forwarder.is_none() {
            let mut notifications = self.session.subscribe_config_changes();
            let changes_tx = self.changes_tx.clone();
            *forwarder = Some(tokio::spawn(async move {
                while let Ok(change) = notifications.recv().await {
                    if change.key == key {
                        debug!("Forwarding config change for {}", change.key);
                        let _ = changes_tx.send(change.value);
                    }
                }
            }));
            info!("Listening for config changes");
        }

        Ok(self.changes_tx.subscribe())
    }

    /// Stop watching the module's config key
    pub async fn unlisten_changes(&self) -> Result<()> {
        let key = self.config_key();
        let (code, _) = self
            .session
            .call_config(
                "unsubscribe_config",
                &[self.session.module_name().to_string(), key.clone()],
            )
            .await
            .map_err(|e| e.with_kind(ErrorKind::GetConfig))?;
        if code != 0 {
            return Err(Error::new(
                ErrorKind::GetConfig,
                format!("unsubscribe_config {} returned code {}", key, code),
            ));
        }

        if let Some(task) = self.lock_forwarder().take() {
            task.abort();
        }
        info!("Stopped listening for config changes");
        Ok(())
    }

    fn lock_forwarder(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.forwarder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DriverConfigManager {
    fn drop(&mut self) {
        if let Some(task) = self.lock_forwarder().take() {
            task.abort();
        }
    }
}
