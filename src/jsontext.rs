//! Serde adapters for TEXT columns that carry JSON documents.
//!
//! Rows store metadata as raw JSON text (the storage layer never interprets
//! it), but the API contract says metadata is a JSON *object*. These
//! adapters re-serialize the stored text as a structured value on the way
//! out and collapse incoming values back to text on the way in.

/// `String` column holding a JSON object. Unparseable text degrades to `{}`.
pub mod json_object {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(raw: &str, serializer: S) -> Result<S::Ok, S::Error> {
        let value: Value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()));
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.to_string())
    }
}

/// `String` column holding a JSON array. Unparseable text degrades to `[]`.
pub mod json_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(raw: &str, serializer: S) -> Result<S::Ok, S::Error> {
        let value: Value =
            serde_json::from_str(raw).unwrap_or_else(|_| Value::Array(Default::default()));
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value.to_string())
    }
}

/// `Option<String>` column holding JSON. `None` serializes as `null`.
pub mod json_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(raw: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match raw {
            None => serializer.serialize_none(),
            Some(text) => {
                let value: Value = serde_json::from_str(text).unwrap_or(Value::Null);
                value.serialize(serializer)
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.to_string()),
        })
    }
}
