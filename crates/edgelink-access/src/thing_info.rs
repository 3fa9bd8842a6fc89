/*!
 * Thing identity records and driver configuration parsing.
 *
 * A thing is identified by a `(productKey, deviceName)` pair, or by a
 * local id derived from its custom configuration when the cloud name is
 * not assigned yet. The driver configuration document delivered by the
 * gateway carries the list of things this module drives plus free-form
 * module configuration.
 */
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Identity and custom configuration of one thing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThingInfo {
    /// The product key the thing belongs to
    #[serde(rename = "productKey")]
    pub product_key: String,

    /// The cloud-assigned device name, when known
    #[serde(rename = "deviceName", default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// Free-form custom configuration for the thing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl ThingInfo {
    /// Create a thing identity from a product key and device name
    pub fn new<S1: Into<String>, S2: Into<String>>(product_key: S1, device_name: S2) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: Some(device_name.into()),
            custom: None,
        }
    }

    /// Create a thing identity with only custom configuration
    pub fn with_custom<S: Into<String>>(product_key: S, custom: Value) -> Self {
        Self {
            product_key: product_key.into(),
            device_name: None,
            custom: Some(custom),
        }
    }

    /// The local identity: the device name, or the `deviceLocalId`
    /// carried by the custom configuration
    pub fn local_id(&self) -> Option<String> {
        if let Some(name) = &self.device_name {
            if !name.is_empty() {
                return Some(name.clone());
            }
        }
        self.custom
            .as_ref()
            .and_then(|custom| custom.get("deviceLocalId"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Validate the record: a non-empty product key and either a device
    /// name or custom configuration are required
    pub fn validate(&self) -> Result<()> {
        if self.product_key.is_empty() {
            return Err(Error::precondition("Thing product key must not be empty"));
        }
        let has_name = self
            .device_name
            .as_ref()
            .map(|name| !name.is_empty())
            .unwrap_or(false);
        if !has_name && self.custom.is_none() {
            return Err(Error::precondition(format!(
                "Thing {} needs a device name or custom configuration",
                self.product_key
            )));
        }
        Ok(())
    }
}

/// The parsed driver configuration document
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// The device list, entries kept verbatim
    device_list: Vec<Value>,
    /// The free-form module configuration
    config: Value,
}

impl DriverConfig {
    /// Parse and validate a raw driver configuration document.
    ///
    /// The device list must be a non-empty array and every entry must
    /// satisfy [`ThingInfo::validate`].
    pub fn parse(raw: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(raw)
            .map_err(|e| Error::protocol(format!("Driver config is not JSON: {}", e)))?;

        let device_list = document
            .get("deviceList")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::protocol("Driver config has no deviceList array"))?;
        if device_list.is_empty() {
            return Err(Error::protocol("Driver config deviceList is empty"));
        }

        for entry in device_list {
            let info: ThingInfo = serde_json::from_value(entry.clone())
                .map_err(|e| Error::protocol(format!("Invalid device entry: {}", e)))?;
            info.validate()?;
        }

        let config = document
            .get("config")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Self {
            device_list: device_list.clone(),
            config,
        })
    }

    /// The typed thing records, in document order
    pub fn things(&self) -> Result<Vec<ThingInfo>> {
        self.device_list
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.clone())
                    .map_err(|e| Error::protocol(format!("Invalid device entry: {}", e)))
            })
            .collect()
    }

    /// The free-form module configuration
    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Re-serialize to exactly `{"deviceList": ..., "config": ...}`,
    /// entries verbatim, any other top-level field discarded
    pub fn to_normalized_json(&self) -> String {
        json!({
            "deviceList": self.device_list,
            "config": self.config,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_id_prefers_device_name() {
        let info = ThingInfo::new("pk1", "lamp");
        assert_eq!(info.local_id().as_deref(), Some("lamp"));
    }

    #[test]
    fn test_local_id_from_custom() {
        let info = ThingInfo::with_custom("pk1", json!({"deviceLocalId": "lamp-7"}));
        assert_eq!(info.local_id().as_deref(), Some("lamp-7"));
    }

    #[test]
    fn test_validate_rejects_empty_product_key() {
        let info = ThingInfo::new("", "lamp");
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_validate_requires_name_or_custom() {
        let info = ThingInfo {
            product_key: "pk1".to_string(),
            device_name: None,
            custom: None,
        };
        assert!(info.validate().is_err());

        let info = ThingInfo::with_custom("pk1", json!({"ip": "10.0.0.2"}));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_parse_rejects_missing_device_list() {
        assert!(DriverConfig::parse(r#"{"config": {}}"#).is_err());
        assert!(DriverConfig::parse(r#"{"deviceList": []}"#).is_err());
        assert!(DriverConfig::parse("not json").is_err());
    }

    #[test]
    fn test_parse_and_normalize_discards_extra_fields() {
        let raw = r#"{
            "deviceList": [
                {"productKey": "pk1", "deviceName": "lamp", "vendor": "acme"},
                {"productKey": "pk1", "deviceName": "fan"}
            ],
            "config": {"pollMs": 500},
            "schemaVersion": 3
        }"#;

        let parsed = DriverConfig::parse(raw).unwrap();
        let normalized: Value =
            serde_json::from_str(&parsed.to_normalized_json()).unwrap();

        let keys: Vec<&String> = normalized.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2);
        assert!(normalized.get("schemaVersion").is_none());

        // entries verbatim, order preserved
        assert_eq!(normalized["deviceList"][0]["vendor"], "acme");
        assert_eq!(normalized["deviceList"][1]["deviceName"], "fan");
        assert_eq!(normalized["config"]["pollMs"], 500);
    }

    #[test]
    fn test_things_in_order() {
        let raw = r#"{
            "deviceList": [
                {"productKey": "pk1", "deviceName": "lamp"},
                {"productKey": "pk2", "custom": {"deviceLocalId": "x-1"}}
            ]
        }"#;

        let things = DriverConfig::parse(raw).unwrap().things().unwrap();
        assert_eq!(things.len(), 2);
        assert_eq!(things[0].device_name.as_deref(), Some("lamp"));
        assert_eq!(things[1].local_id().as_deref(), Some("x-1"));
    }
}
