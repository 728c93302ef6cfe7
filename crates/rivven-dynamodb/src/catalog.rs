//! Catalog: which tables to sync and how
//!
//! The catalog is produced by discovery (outside this crate) in the Singer
//! layout: a list of streams, each with a JSON schema and breadcrumb metadata.
//! Only the root breadcrumb (`[]`) is read here.

use crate::error::{DynamoError, Result};
use crate::projection::Projection;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// Replication method of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    /// Full scan of the table every run
    FullTable,
    /// One full scan, then change capture from the table's stream
    LogBased,
}

impl ReplicationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullTable => "FULL_TABLE",
            Self::LogBased => "LOG_BASED",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "FULL_TABLE" => Some(Self::FullTable),
            "LOG_BASED" => Some(Self::LogBased),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub streams: Vec<CatalogEntry>,
}

/// One stream of the catalog document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub key_properties: Vec<String>,
    #[serde(default)]
    pub schema: Value,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

/// Breadcrumb metadata entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub breadcrumb: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Root metadata keys of the projection expression, in lookup order
const PROJECTION_KEYS: &[&str] = &["projection", "tap-mongodb.projection"];

/// Root metadata keys of the expression attribute map, in lookup order
const EXPRESSION_ATTRIBUTE_KEYS: &[&str] = &[
    "expression-attributes",
    "tap-dz-dynamodb.expression-attributes",
];

// first key that is present and not null
fn metadata_value<'a>(md: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| md.get(*key))
        .find(|value| !value.is_null())
}

impl CatalogEntry {
    fn root_metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|entry| entry.breadcrumb.is_empty())
            .map(|entry| &entry.metadata)
    }

    /// Resolve this entry into a table descriptor
    pub fn to_table_stream(&self) -> Result<TableStream> {
        let empty = Map::new();
        let md = self.root_metadata().unwrap_or(&empty);

        let replication_method = match md.get("replication-method") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(ReplicationMethod::parse(text).ok_or_else(|| {
                DynamoError::config(format!(
                    "unknown replication method '{text}' for stream '{}'",
                    self.tap_stream_id
                ))
            })?),
            Some(other) => {
                return Err(DynamoError::config(format!(
                    "replication-method for stream '{}' must be a string, got {other}",
                    self.tap_stream_id
                )))
            }
        };

        let key_properties = match md.get("table-key-properties") {
            Some(Value::Array(keys)) => keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => self.key_properties.clone(),
        };

        let expression_attributes = match metadata_value(md, EXPRESSION_ATTRIBUTE_KEYS) {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        };

        Ok(TableStream {
            tap_stream_id: self.tap_stream_id.clone(),
            table_name: self
                .table_name
                .clone()
                .unwrap_or_else(|| self.tap_stream_id.clone()),
            key_properties,
            replication_method,
            projection: metadata_value(md, PROJECTION_KEYS)
                .and_then(Value::as_str)
                .map(str::to_string),
            expression_attributes,
            selected: md.get("selected").and_then(Value::as_bool).unwrap_or(false),
            schema: self.schema.clone(),
            row_count: md.get("row-count").and_then(Value::as_u64),
        })
    }
}

impl Catalog {
    /// Parse a catalog document
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Selected streams, in catalog order
    pub fn selected_tables(&self) -> Result<Vec<TableStream>> {
        let mut tables = Vec::new();
        for entry in &self.streams {
            let table = entry.to_table_stream()?;
            if !table.selected {
                continue;
            }
            if table.replication_method.is_none() {
                return Err(DynamoError::config(format!(
                    "stream '{}' is selected but has no replication-method",
                    table.tap_stream_id
                )));
            }
            tables.push(table);
        }
        Ok(tables)
    }
}

/// Descriptor of one table to sync
#[derive(Debug, Clone, PartialEq)]
pub struct TableStream {
    pub tap_stream_id: String,
    pub table_name: String,
    pub key_properties: Vec<String>,
    pub replication_method: Option<ReplicationMethod>,
    pub projection: Option<String>,
    pub expression_attributes: Option<String>,
    pub selected: bool,
    pub schema: Value,
    pub row_count: Option<u64>,
}

impl TableStream {
    /// Selected table whose stream id is its name
    pub fn new(table_name: impl Into<String>, method: ReplicationMethod) -> Self {
        let table_name = table_name.into();
        Self {
            tap_stream_id: table_name.clone(),
            table_name,
            key_properties: Vec::new(),
            replication_method: Some(method),
            projection: None,
            expression_attributes: None,
            selected: true,
            schema: serde_json::json!({"type": "object", "properties": {}}),
            row_count: None,
        }
    }

    pub fn with_key_properties(mut self, keys: &[&str]) -> Self {
        self.key_properties = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_projection(mut self, expression: &str, expression_attributes: Option<&str>) -> Self {
        self.projection = Some(expression.to_string());
        self.expression_attributes = expression_attributes.map(str::to_string);
        self
    }

    /// Replication method, required for a table that is being synced
    pub fn method(&self) -> Result<ReplicationMethod> {
        self.replication_method.ok_or_else(|| {
            DynamoError::config(format!(
                "stream '{}' has no replication-method",
                self.tap_stream_id
            ))
        })
    }

    /// Parsed projection, or `None` when the table is not projected
    pub fn parsed_projection(&self) -> Result<Option<Projection>> {
        match self.projection.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(expression) => {
                Projection::parse(expression, self.expression_attributes.as_deref()).map(Some)
            }
        }
    }
}
