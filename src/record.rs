use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A watched plan: the unit of state that is persisted to the store and
/// handed back to callbacks on fire or recovery.
///
/// Serialises to a JSON object with exactly the keys `field`,
/// `touch_off_unix` and `customized_attributes`; that encoding is the
/// storage contract and must stay stable across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    /// Watched name, unique within one scheduler namespace.
    pub field: String,

    /// Absolute Unix timestamp (seconds) at which the watch fires.
    /// Zero at registration time means "compute from the requested delay".
    #[serde(default)]
    pub touch_off_unix: i64,

    /// Opaque caller payload, carried through storage verbatim. The
    /// scheduler never interprets its contents.
    #[serde(default)]
    pub customized_attributes: Value,
}

impl Watch {
    /// Create a watch with no payload. `touch_off_unix` is filled in at
    /// registration time.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            touch_off_unix: 0,
            customized_attributes: Value::Null,
        }
    }

    /// Create a watch carrying a caller payload.
    pub fn with_attributes(field: impl Into<String>, attributes: Value) -> Self {
        Self {
            field: field.into(),
            touch_off_unix: 0,
            customized_attributes: attributes,
        }
    }

    /// Encode to the stored JSON form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the stored JSON form.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_payload_verbatim() {
        let mut watch = Watch::with_attributes("task1", json!({"x": 1, "tags": ["a", "b"]}));
        watch.touch_off_unix = 1_700_000_000;

        let raw = watch.encode().unwrap();
        let back = Watch::decode(&raw).unwrap();
        assert_eq!(back, watch);
        assert_eq!(back.customized_attributes["x"], json!(1));
    }

    #[test]
    fn stored_keys_match_the_wire_contract() {
        let raw = Watch::new("t").encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["field"], json!("t"));
        assert_eq!(value["touch_off_unix"], json!(0));
        assert_eq!(value["customized_attributes"], serde_json::Value::Null);
    }

    #[test]
    fn missing_attributes_decode_as_null() {
        let back = Watch::decode(r#"{"field":"t","touch_off_unix":5}"#).unwrap();
        assert_eq!(back.customized_attributes, serde_json::Value::Null);
        assert_eq!(back.touch_off_unix, 5);
    }
}
