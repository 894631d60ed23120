//! Write-Compute Merge Engine
//!
//! A write-compute record is a partial update: for each field of the value schema
//! it carries one of
//!
//! - `Set(value)`: replace the field
//! - `NoOp`: leave the field unchanged (absence of the field means the same)
//! - `ListOps { add, remove }`: set-union / set-difference against the stored list
//! - `MapOps { put, remove }`: key upsert / key removal against the stored map
//!
//! Every operation is evaluated against the **currently stored** value, never
//! against a chain of staged deltas, so each one is a replacement relative to
//! the stored field. Re-delivering a record after a partition rewind therefore
//! reproduces the same stored value instead of double-applying it.
//!
//! A merge validates every field before touching anything and returns a fresh
//! value; on error the caller still holds the old value unchanged.
//!
//! ## Example
//!
//! ```ignore
//! let schema = ValueSchema::new()
//!     .with_field("name", FieldKind::Scalar, json!(""))
//!     .with_field("tags", FieldKind::List, json!([]));
//!
//! let update = WriteComputeRecord::new()
//!     .set("name", json!("ada"))
//!     .list_add("tags", vec![json!("admin")]);
//!
//! let merged = apply_update(&schema, None, &update)?;
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shape of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Scalar,
    List,
    Map,
}

impl FieldKind {
    fn as_str(self) -> &'static str {
        match self {
            FieldKind::Scalar => "scalar",
            FieldKind::List => "list",
            FieldKind::Map => "map",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    pub default: Value,
}

/// Record schema of a store's values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueSchema {
    fields: Vec<FieldSchema>,
}

impl ValueSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind, default: Value) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            kind,
            default,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    /// A value holding every field's default.
    pub fn default_value(&self) -> Value {
        let mut object = Map::new();
        for field in &self.fields {
            object.insert(field.name.clone(), field.default.clone());
        }
        Value::Object(object)
    }
}

/// Per-field operation of a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum FieldUpdate {
    Set(Value),
    NoOp,
    ListOps {
        #[serde(default)]
        add: Vec<Value>,
        #[serde(default)]
        remove: Vec<Value>,
    },
    MapOps {
        #[serde(default)]
        put: Map<String, Value>,
        #[serde(default)]
        remove: Vec<String>,
    },
}

impl FieldUpdate {
    fn op_kind(&self) -> Option<FieldKind> {
        match self {
            FieldUpdate::Set(_) | FieldUpdate::NoOp => None,
            FieldUpdate::ListOps { .. } => Some(FieldKind::List),
            FieldUpdate::MapOps { .. } => Some(FieldKind::Map),
        }
    }
}

/// Keyed partial update. Fields not present are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteComputeRecord {
    fields: BTreeMap<String, FieldUpdate>,
}

impl WriteComputeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, update: FieldUpdate) -> Self {
        self.fields.insert(field.into(), update);
        self
    }

    pub fn set(self, field: impl Into<String>, value: Value) -> Self {
        self.with(field, FieldUpdate::Set(value))
    }

    pub fn no_op(self, field: impl Into<String>) -> Self {
        self.with(field, FieldUpdate::NoOp)
    }

    pub fn list_add(self, field: impl Into<String>, items: Vec<Value>) -> Self {
        self.with(
            field,
            FieldUpdate::ListOps {
                add: items,
                remove: Vec::new(),
            },
        )
    }

    pub fn list_remove(self, field: impl Into<String>, items: Vec<Value>) -> Self {
        self.with(
            field,
            FieldUpdate::ListOps {
                add: Vec::new(),
                remove: items,
            },
        )
    }

    pub fn map_put(self, field: impl Into<String>, entries: Map<String, Value>) -> Self {
        self.with(
            field,
            FieldUpdate::MapOps {
                put: entries,
                remove: Vec::new(),
            },
        )
    }

    pub fn map_remove(self, field: impl Into<String>, keys: Vec<String>) -> Self {
        self.with(
            field,
            FieldUpdate::MapOps {
                put: Map::new(),
                remove: keys,
            },
        )
    }

    pub fn get(&self, field: &str) -> Option<&FieldUpdate> {
        self.fields.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Merge `update` into `current` and return the new value.
///
/// `current == None` means the key has no stored value yet; the merge starts from
/// the schema defaults.
pub fn apply_update(
    schema: &ValueSchema,
    current: Option<&Value>,
    update: &WriteComputeRecord,
) -> Result<Value> {
    for (name, op) in &update.fields {
        let field = schema
            .field(name)
            .ok_or_else(|| Error::UnknownField(name.clone()))?;
        if let Some(actual) = op.op_kind() {
            if actual != field.kind {
                return Err(Error::FieldKindMismatch {
                    field: name.clone(),
                    expected: field.kind.as_str(),
                    actual: actual.as_str(),
                });
            }
        }
    }

    let mut merged = match current {
        None => Map::new(),
        Some(Value::Object(object)) => object.clone(),
        Some(other) => return Err(Error::InvalidStoredValue(other.to_string())),
    };
    for field in schema.fields() {
        merged
            .entry(field.name.clone())
            .or_insert_with(|| field.default.clone());
    }

    for (name, op) in &update.fields {
        match op {
            FieldUpdate::NoOp => {}
            FieldUpdate::Set(value) => {
                merged.insert(name.clone(), value.clone());
            }
            FieldUpdate::ListOps { add, remove } => {
                let list = list_field(&mut merged, name)?;
                list.retain(|item| !remove.contains(item));
                for item in add {
                    if !list.contains(item) {
                        list.push(item.clone());
                    }
                }
            }
            FieldUpdate::MapOps { put, remove } => {
                let map = map_field(&mut merged, name)?;
                for key in remove {
                    map.remove(key);
                }
                for (key, value) in put {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
    }

    Ok(Value::Object(merged))
}

fn list_field<'a>(object: &'a mut Map<String, Value>, name: &str) -> Result<&'a mut Vec<Value>> {
    let slot = object.entry(name.to_string()).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => Ok(items),
        other => Err(Error::InvalidStoredValue(format!(
            "field {} holds {}, expected a list",
            name, other
        ))),
    }
}

fn map_field<'a>(
    object: &'a mut Map<String, Value>,
    name: &str,
) -> Result<&'a mut Map<String, Value>> {
    let slot = object.entry(name.to_string()).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(entries) => Ok(entries),
        other => Err(Error::InvalidStoredValue(format!(
            "field {} holds {}, expected a map",
            name, other
        ))),
    }
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_value(value: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}
