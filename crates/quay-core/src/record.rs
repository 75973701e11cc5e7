//! Record identifiers and schemaless record bodies.
//!
//! Edge devices push records whose only contract is an `id`. Everything else
//! is an opaque JSON object that both stores persist as-is.
//!
//! # Example
//!
//! ```rust
//! use quay_core::record::{Record, RecordId};
//! use serde_json::json;
//!
//! let record = Record::from_value(json!({"id": 42, "kind": "entry"})).unwrap();
//! assert_eq!(record.id().as_str(), "42");
//! assert_eq!(record.body()["id"], "42");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};

/// A JSON object body.
pub type Fields = serde_json::Map<String, Value>;

/// Maximum length of a record identifier, in characters.
pub const MAX_RECORD_ID_LEN: usize = 128;

/// A caller-supplied or generated record identifier.
///
/// Record IDs must be:
/// - Non-empty and at most [`MAX_RECORD_ID_LEN`] characters
/// - Free of `/`, `\` and control characters
/// - Not `.` or `..`
///
/// They end up in object-store paths, so the rules keep a record from
/// escaping its collection prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Creates a new record ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the record ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Generates a fresh ULID-based record ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Reads an identifier from a JSON value.
    ///
    /// Strings are taken as-is; integers are normalised to their decimal form.
    ///
    /// # Errors
    ///
    /// Returns an error for any other JSON type or an invalid string.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Self::new(s.as_str()),
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::new(n.to_string()),
            other => Err(Error::InvalidId {
                message: format!("expected a string or integer id, got {}", json_type(other)),
            }),
        }
    }

    /// Returns the record ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "record ID cannot be empty".to_string(),
            });
        }

        if id.chars().count() > MAX_RECORD_ID_LEN {
            return Err(Error::InvalidId {
                message: format!("record ID is too long (maximum {MAX_RECORD_ID_LEN} characters)"),
            });
        }

        if id == "." || id == ".." {
            return Err(Error::InvalidId {
                message: format!("record ID '{id}' is reserved"),
            });
        }

        if id.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
            return Err(Error::InvalidId {
                message: format!(
                    "record ID '{}' contains invalid characters (slashes and control characters are not allowed)",
                    id.escape_debug()
                ),
            });
        }

        Ok(())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// A schemaless record: an identifier plus the full JSON body.
///
/// The body always contains `"id"` as a string equal to [`Record::id`].
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    body: Fields,
}

impl Record {
    /// Builds a record from a JSON value that must be an object with an `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or the id is missing or invalid.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(body) => Self::from_fields(body),
            other => Err(Error::InvalidInput(format!(
                "record must be a JSON object, got {}",
                json_type(&other)
            ))),
        }
    }

    /// Builds a record from an object body that must carry an `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is missing or invalid.
    pub fn from_fields(mut body: Fields) -> Result<Self> {
        let id = match body.get("id") {
            Some(value) => RecordId::from_json(value)?,
            None => {
                return Err(Error::InvalidId {
                    message: "record is missing an 'id' field".to_string(),
                });
            }
        };
        body.insert("id".to_string(), Value::String(id.to_string()));
        Ok(Self { id, body })
    }

    /// Builds a record with the given id, overriding any `id` in the body.
    #[must_use]
    pub fn with_id(id: RecordId, mut body: Fields) -> Self {
        body.insert("id".to_string(), Value::String(id.to_string()));
        Self { id, body }
    }

    /// Returns the record identifier.
    #[must_use]
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Returns the full body, including `id`.
    #[must_use]
    pub fn body(&self) -> &Fields {
        &self.body
    }

    /// Consumes the record, returning its body.
    #[must_use]
    pub fn into_body(self) -> Fields {
        self.body
    }
}

/// Shallow-merges `patch` into `target`: top-level keys in `patch` replace
/// those in `target`, other keys are kept.
///
/// Returns true if `target` changed.
pub fn shallow_merge(target: &mut Fields, patch: &Fields) -> bool {
    let mut changed = false;
    for (key, value) in patch {
        if target.get(key) != Some(value) {
            target.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Returns the JSON type name of a value, for error messages.
#[must_use]
pub fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_record_ids() {
        assert!(RecordId::new("evt-0001").is_ok());
        assert!(RecordId::new("01J9ZQ4Y7W3D1B2C3D4E5F6G7H").is_ok());
        assert!(RecordId::new("portal:gate 3").is_ok());
        assert!(RecordId::new("a".repeat(MAX_RECORD_ID_LEN)).is_ok());
    }

    #[test]
    fn invalid_record_ids() {
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new(".").is_err());
        assert!(RecordId::new("..").is_err());
        assert!(RecordId::new("a/b").is_err());
        assert!(RecordId::new("a\\b").is_err());
        assert!(RecordId::new("line\nbreak").is_err());
        assert!(RecordId::new("a".repeat(MAX_RECORD_ID_LEN + 1)).is_err());
    }

    #[test]
    fn integer_ids_are_normalised() {
        let id = RecordId::from_json(&json!(1234)).expect("integer id");
        assert_eq!(id.as_str(), "1234");
        assert!(RecordId::from_json(&json!(1.5)).is_err());
        assert!(RecordId::from_json(&json!(null)).is_err());
        assert!(RecordId::from_json(&json!(["x"])).is_err());
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RecordId::generate(), RecordId::generate());
    }

    #[test]
    fn record_requires_object_with_id() {
        assert!(Record::from_value(json!("nope")).is_err());
        assert!(Record::from_value(json!({"name": "no id"})).is_err());

        let record = Record::from_value(json!({"id": 7, "name": "MV Aurora"})).expect("record");
        assert_eq!(record.id().as_str(), "7");
        assert_eq!(record.body()["id"], json!("7"));
        assert_eq!(record.body()["name"], json!("MV Aurora"));
    }

    #[test]
    fn with_id_overrides_body_id() {
        let mut body = Fields::new();
        body.insert("id".into(), json!("other"));
        let record = Record::with_id(RecordId::new("v-1").expect("id"), body);
        assert_eq!(record.body()["id"], json!("v-1"));
    }

    #[test]
    fn shallow_merge_replaces_top_level_keys_only() {
        let mut target = json!({"id": "1", "name": "old", "tags": {"a": 1}})
            .as_object()
            .cloned()
            .expect("object");
        let patch = json!({"name": "new", "tags": {"b": 2}})
            .as_object()
            .cloned()
            .expect("object");

        assert!(shallow_merge(&mut target, &patch));
        assert_eq!(
            Value::Object(target.clone()),
            json!({"id": "1", "name": "new", "tags": {"b": 2}})
        );
        assert!(!shallow_merge(&mut target, &patch));
    }

    #[test]
    fn record_id_deserialization_validates() {
        let ok: RecordId = serde_json::from_value(json!("u-1")).expect("valid");
        assert_eq!(ok.as_str(), "u-1");
        assert!(serde_json::from_value::<RecordId>(json!("../etc")).is_err());
    }
}
