//! # Mapping Layer
//!
//! Pure translation between the local schema and the remote API's request and
//! response shapes. Nothing in here performs I/O: the same inputs always give
//! the same output, which keeps the layer safe to share across workers.
//!
//! ## Responsibilities
//!
//! - **Renaming**: local field names to remote field names and back
//! - **Coercion**: dates, list encodings and scalar types the remote expects
//! - **Exclusion**: read-only and system-managed fields never leave the engine
//! - **Dependency folding**: a remote id resolved earlier in the correlation is
//!   written into the payload before dispatch
//!
//! ## Usage
//!
//! ```rust
//! use outbox_sync::mapping::{Coercion, MappingRegistry, TableMapping};
//! use outbox_sync::models::SyncOperation;
//! use serde_json::json;
//!
//! let registry = MappingRegistry::new().with_table(
//!     TableMapping::new("guest")
//!         .resource("guests")
//!         .field("full_name", "Name")
//!         .field_with("tags", "Tags", Coercion::JoinedList { separator: ",".to_string() })
//!         .read_only("created_at"),
//! );
//!
//! let request = registry
//!     .to_remote_shape(
//!         "guest",
//!         SyncOperation::Update,
//!         &json!({"full_name": "Ada", "tags": ["vip", "repeat"], "created_at": "2024-01-01"}),
//!         None,
//!     )
//!     .unwrap();
//!
//! assert_eq!(request.resource, "guests");
//! assert_eq!(request.body, json!({"Name": "Ada", "Tags": "vip,repeat"}));
//! ```

use crate::error::MappingError;
use crate::models::SyncOperation;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Write as _};

/// Value transformation applied while renaming a field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Coercion {
    /// Send the value unchanged
    #[default]
    Passthrough,
    /// Render scalars as strings
    String,
    /// Parse strings and floats with no fractional part into integers
    Integer,
    Float,
    /// Accept booleans, "true"/"false", "yes"/"no" and 0/1
    Boolean,
    /// Reformat an RFC 3339 timestamp or `YYYY-MM-DD` date with a chrono format string
    DateFormat { format: String },
    /// Encode an array as a single delimited string
    JoinedList { separator: String },
    /// Ensure the value is an array, decoding JSON-encoded strings and wrapping scalars
    JsonArray,
}

impl Coercion {
    /// Reject parameters that can never produce a value, such as an unknown
    /// strftime specifier in a date format.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Coercion::DateFormat { format } => {
                if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                    Err(format!("'{format}' is not a valid date format"))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub local: String,
    pub remote: String,
    #[serde(default)]
    pub coercion: Coercion,
}

/// Shape of one local table as seen by the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMapping {
    pub table: String,
    /// Path segment of the remote collection, e.g. `POST /{resource}`.
    /// Empty means the table name.
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    /// Forward fields without an explicit mapping under their local name
    #[serde(default = "default_passthrough")]
    pub passthrough_unmapped: bool,
    #[serde(default)]
    pub read_only: BTreeSet<String>,
    #[serde(default)]
    pub required_on_create: Vec<String>,
    /// Local field that receives a resolved dependency id
    #[serde(default)]
    pub dependency_field: Option<String>,
    /// Local payload field that may carry the target's remote id
    #[serde(default)]
    pub id_field: Option<String>,
}

fn default_passthrough() -> bool {
    true
}

impl TableMapping {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            resource: table.clone(),
            table,
            fields: Vec::new(),
            passthrough_unmapped: true,
            read_only: BTreeSet::new(),
            required_on_create: Vec::new(),
            dependency_field: None,
            id_field: None,
        }
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn field(self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.field_with(local, remote, Coercion::Passthrough)
    }

    pub fn field_with(
        mut self,
        local: impl Into<String>,
        remote: impl Into<String>,
        coercion: Coercion,
    ) -> Self {
        self.fields.push(FieldMapping {
            local: local.into(),
            remote: remote.into(),
            coercion,
        });
        self
    }

    pub fn strict(mut self) -> Self {
        self.passthrough_unmapped = false;
        self
    }

    pub fn read_only(mut self, field: impl Into<String>) -> Self {
        self.read_only.insert(field.into());
        self
    }

    pub fn required(mut self, field: impl Into<String>) -> Self {
        self.required_on_create.push(field.into());
        self
    }

    pub fn dependency_field(mut self, field: impl Into<String>) -> Self {
        self.dependency_field = Some(field.into());
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = Some(field.into());
        self
    }

    /// Check every field coercion of this table
    pub fn validate(&self) -> Result<(), MappingError> {
        for field in &self.fields {
            field
                .coercion
                .validate()
                .map_err(|reason| MappingError::Coercion {
                    table: self.table.clone(),
                    field: field.local.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    fn by_local(&self, local: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.local == local)
    }

    fn by_remote(&self, remote: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.remote == remote)
    }
}

/// A dependency id resolved for the item being mapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub record_id: String,
    pub external_id: String,
}

/// Request body ready for the remote client
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub resource: String,
    pub body: Value,
}

/// Registry of table mappings
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    tables: HashMap<String, TableMapping>,
    /// Treat unregistered tables as identity mappings instead of failing
    allow_unmapped: bool,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that maps any unregistered table one-to-one
    pub fn permissive() -> Self {
        Self {
            tables: HashMap::new(),
            allow_unmapped: true,
        }
    }

    pub fn with_table(mut self, mapping: TableMapping) -> Self {
        self.register(mapping);
        self
    }

    pub fn register(&mut self, mut mapping: TableMapping) {
        if mapping.resource.is_empty() {
            mapping.resource = mapping.table.clone();
        }
        self.tables.insert(mapping.table.clone(), mapping);
    }

    /// Registry built from configured table mappings
    pub fn from_tables(tables: impl IntoIterator<Item = TableMapping>, allow_unmapped: bool) -> Self {
        let mut registry = Self {
            tables: HashMap::new(),
            allow_unmapped,
        };
        for mapping in tables {
            registry.register(mapping);
        }
        registry
    }

    fn table(&self, table: &str) -> Result<std::borrow::Cow<'_, TableMapping>, MappingError> {
        match self.tables.get(table) {
            Some(mapping) => Ok(std::borrow::Cow::Borrowed(mapping)),
            None if self.allow_unmapped => Ok(std::borrow::Cow::Owned(TableMapping::new(table))),
            None => Err(MappingError::UnknownTable {
                table: table.to_string(),
            }),
        }
    }

    /// Remote collection path for a table
    pub fn resource(&self, table: &str) -> Result<String, MappingError> {
        Ok(self.table(table)?.resource.clone())
    }

    /// Translate a local payload into the remote request shape
    pub fn to_remote_shape(
        &self,
        table: &str,
        operation: SyncOperation,
        local_payload: &Value,
        dependency: Option<&ResolvedDependency>,
    ) -> Result<RemoteRequest, MappingError> {
        let mapping = self.table(table)?;
        let mut fields = local_payload
            .as_object()
            .cloned()
            .ok_or_else(|| MappingError::NotAnObject {
                table: table.to_string(),
            })?;

        if operation == SyncOperation::Delete {
            return Ok(RemoteRequest {
                resource: mapping.resource.clone(),
                body: Value::Object(Map::new()),
            });
        }

        if let Some(dependency) = dependency {
            fold_dependency(&mapping, &mut fields, dependency)?;
        }

        if operation == SyncOperation::Create {
            for required in &mapping.required_on_create {
                if fields.get(required).map_or(true, Value::is_null) {
                    return Err(MappingError::MissingField {
                        table: table.to_string(),
                        field: required.clone(),
                    });
                }
            }
        }

        let mut body = Map::new();
        for (local, value) in fields {
            if mapping.read_only.contains(&local) || mapping.id_field.as_deref() == Some(&local) {
                continue;
            }
            match mapping.by_local(&local) {
                Some(field) => {
                    let coerced = coerce(&field.coercion, value).map_err(|reason| {
                        MappingError::Coercion {
                            table: table.to_string(),
                            field: local.clone(),
                            reason,
                        }
                    })?;
                    body.insert(field.remote.clone(), coerced);
                }
                None if mapping.passthrough_unmapped => {
                    body.insert(local, value);
                }
                None => {}
            }
        }

        Ok(RemoteRequest {
            resource: mapping.resource.clone(),
            body: Value::Object(body),
        })
    }

    /// Translate a remote response into a patch keyed by local field names
    pub fn from_remote_shape(&self, table: &str, response: &Value) -> Result<Value, MappingError> {
        let mapping = self.table(table)?;
        let remote = response.as_object().ok_or_else(|| MappingError::NotAnObject {
            table: table.to_string(),
        })?;

        let mut patch = Map::new();
        for (key, value) in remote {
            match mapping.by_remote(key) {
                Some(field) => {
                    patch.insert(field.local.clone(), value.clone());
                }
                None if mapping.passthrough_unmapped => {
                    patch.insert(key.clone(), value.clone());
                }
                None => {}
            }
        }
        Ok(Value::Object(patch))
    }

    /// Remote id carried in the payload itself, if the table declares an id field
    pub fn external_id_from_payload(&self, table: &str, payload: &Value) -> Option<String> {
        let mapping = self.table(table).ok()?;
        let field = mapping.id_field.as_deref()?;
        match payload.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn fold_dependency(
    mapping: &TableMapping,
    fields: &mut Map<String, Value>,
    dependency: &ResolvedDependency,
) -> Result<(), MappingError> {
    if let Some(field) = &mapping.dependency_field {
        fields.insert(field.clone(), Value::String(dependency.external_id.clone()));
        return Ok(());
    }

    let mut placed = false;
    for value in fields.values_mut() {
        if value.as_str() == Some(dependency.record_id.as_str()) {
            *value = Value::String(dependency.external_id.clone());
            placed = true;
        }
    }

    if placed {
        Ok(())
    } else {
        Err(MappingError::UnplacedDependency {
            table: mapping.table.clone(),
            record_id: dependency.record_id.clone(),
        })
    }
}

fn coerce(coercion: &Coercion, value: Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match coercion {
        Coercion::Passthrough => Ok(value),
        Coercion::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("expected a scalar, got {other}")),
        },
        Coercion::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() != 0.0 => Err(format!("{n} is not a whole number")),
                // i64::MAX as f64 rounds up to 2^63, which is already out of range
                Some(f) if f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(format!("{n} is out of range for an integer")),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("'{s}' is not an integer: {e}")),
            other => Err(format!("expected an integer, got {other}")),
        },
        Coercion::Float => match &value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|e| format!("'{s}' is not a number: {e}")),
            other => Err(format!("expected a number, got {other}")),
        },
        Coercion::Boolean => match &value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(format!("{n} is not a boolean")),
            },
            other => Err(format!("expected a boolean, got {other}")),
        },
        Coercion::DateFormat { format } => {
            let raw = value
                .as_str()
                .ok_or_else(|| format!("expected a date string, got {value}"))?;
            if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
                return render_date(ts.format(format), format);
            }
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|e| format!("'{raw}' is not a date: {e}"))?;
            render_date(date.format(format), format)
        }
        Coercion::JoinedList { separator } => match value {
            Value::Array(items) => {
                let parts = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        Value::Number(n) => Ok(n.to_string()),
                        Value::Bool(b) => Ok(b.to_string()),
                        other => Err(format!("list element {other} is not a scalar")),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::String(parts.join(separator)))
            }
            Value::String(_) => Ok(value),
            other => Err(format!("expected a list, got {other}")),
        },
        Coercion::JsonArray => match value {
            Value::Array(_) => Ok(value),
            Value::String(s) if s.trim_start().starts_with('[') => serde_json::from_str(&s)
                .map_err(|e| format!("invalid JSON array: {e}")),
            other => Ok(Value::Array(vec![other])),
        },
    }
}

/// `to_string` on a chrono formatter panics on a bad format; `write!` reports it
fn render_date(rendered: impl fmt::Display, format: &str) -> Result<Value, String> {
    let mut out = String::new();
    write!(out, "{rendered}").map_err(|_| format!("'{format}' is not a valid date format"))?;
    Ok(Value::String(out))
}
