// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed key/value store used for input parameters and the working map.
//!
//! Values are a closed tagged union so that every map can be serialized to the
//! persistence layer and read back without losing its kind. Accessors are
//! explicit about the kind they expect and report a [`MapError::TypeMismatch`]
//! instead of coercing.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single value stored in a [`ParamMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// UTF-8 string.
    String(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Boolean flag.
    Boolean(bool),
    /// UUID, stored in hyphenated form.
    Uuid(Uuid),
    /// Nested record of named values.
    Record(BTreeMap<String, ParamValue>),
    /// Ordered list of values.
    List(Vec<ParamValue>),
    /// Arbitrary serde document (request and response models).
    Json(serde_json::Value),
}

impl ParamValue {
    /// Name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::Uuid(_) => "uuid",
            Self::Record(_) => "record",
            Self::List(_) => "list",
            Self::Json(_) => "json",
        }
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<Uuid> for ParamValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(v: Vec<ParamValue>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, ParamValue>> for ParamValue {
    fn from(v: BTreeMap<String, ParamValue>) -> Self {
        Self::Record(v)
    }
}

/// Errors raised by typed map access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The requested key is absent.
    #[error("missing key '{key}'")]
    MissingKey {
        /// The key that was looked up.
        key: String,
    },

    /// The key holds a value of another kind.
    #[error("type mismatch for key '{key}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// The key that was looked up.
        key: String,
        /// The kind the caller asked for.
        expected: &'static str,
        /// The kind actually stored.
        actual: &'static str,
    },

    /// A typed document could not be converted to or from JSON.
    #[error("serialization error for key '{key}': {details}")]
    Serialization {
        /// The key being converted.
        key: String,
        /// Error details from serde.
        details: String,
    },
}

/// String-keyed map of [`ParamValue`]s.
///
/// Writing an existing key overwrites it. Iteration order is by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMap {
    entries: BTreeMap<String, ParamValue>,
}

macro_rules! typed_getter {
    ($(#[$doc:meta])* $name:ident, $opt_name:ident, $variant:ident, $kind:literal, $ret:ty, |$v:ident| $conv:expr) => {
        $(#[$doc])*
        pub fn $name(&self, key: &str) -> Result<$ret, MapError> {
            match self.entries.get(key) {
                Some(ParamValue::$variant($v)) => Ok($conv),
                Some(other) => Err(MapError::TypeMismatch {
                    key: key.to_string(),
                    expected: $kind,
                    actual: other.kind(),
                }),
                None => Err(MapError::MissingKey {
                    key: key.to_string(),
                }),
            }
        }

        /// Like the required accessor, but absent keys yield `Ok(None)`.
        pub fn $opt_name(&self, key: &str) -> Result<Option<$ret>, MapError> {
            if self.entries.contains_key(key) {
                self.$name(key).map(Some)
            } else {
                Ok(None)
            }
        }
    };
}

impl ParamMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.put(key, value);
        self
    }

    /// Serialize `value` with serde and store it as a JSON document.
    pub fn put_typed<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), MapError> {
        let key = key.into();
        let doc = serde_json::to_value(value).map_err(|e| MapError::Serialization {
            key: key.clone(),
            details: e.to_string(),
        })?;
        self.entries.insert(key, ParamValue::Json(doc));
        Ok(())
    }

    /// Read a JSON document stored with [`put_typed`](Self::put_typed).
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Result<T, MapError> {
        match self.entries.get(key) {
            Some(ParamValue::Json(doc)) => {
                serde_json::from_value(doc.clone()).map_err(|e| MapError::Serialization {
                    key: key.to_string(),
                    details: e.to_string(),
                })
            }
            Some(other) => Err(MapError::TypeMismatch {
                key: key.to_string(),
                expected: "json",
                actual: other.kind(),
            }),
            None => Err(MapError::MissingKey {
                key: key.to_string(),
            }),
        }
    }

    typed_getter!(
        /// Read a string value.
        get_str, get_opt_str, String, "string", &str, |v| v.as_str()
    );
    typed_getter!(
        /// Read an integer value.
        get_i64, get_opt_i64, Integer, "integer", i64, |v| *v
    );
    typed_getter!(
        /// Read a boolean value.
        get_bool, get_opt_bool, Boolean, "boolean", bool, |v| *v
    );
    typed_getter!(
        /// Read a UUID value.
        get_uuid, get_opt_uuid, Uuid, "uuid", Uuid, |v| *v
    );
    typed_getter!(
        /// Read a nested record.
        get_record, get_opt_record, Record, "record", &BTreeMap<String, ParamValue>, |v| v
    );
    typed_getter!(
        /// Read a list.
        get_list, get_opt_list, List, "list", &[ParamValue], |v| v.as_slice()
    );

    /// Raw access to a value of any kind.
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.get(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.entries.remove(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.entries.iter()
    }

    /// Serialize to the JSON text stored by the persistence layer.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON text stored by the persistence layer.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl FromIterator<(String, ParamValue)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
