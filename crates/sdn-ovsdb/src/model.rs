//! Wire model of the switch configuration database (RFC 7047).
//!
//! Rows are kept as raw JSON objects: the driver only touches a handful of
//! columns and the database schema is owned by the switch.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Database every transaction targets.
pub const DATABASE: &str = "Open_vSwitch";

/// Table names
pub mod tables {
    pub const OPEN_VSWITCH: &str = "Open_vSwitch";
    pub const BRIDGE: &str = "Bridge";
    pub const PORT: &str = "Port";
    pub const INTERFACE: &str = "Interface";
}

/// Column names
pub mod columns {
    pub const UUID: &str = "_uuid";
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const TAG: &str = "tag";
    pub const PORTS: &str = "ports";
    pub const BRIDGES: &str = "bridges";
    pub const INTERFACES: &str = "interfaces";
    pub const OPTIONS: &str = "options";
    pub const OTHER_CONFIG: &str = "other_config";
    pub const STP_ENABLE: &str = "stp_enable";
    pub const REMOTE_IP: &str = "remote_ip";
}

/// Interface types
pub mod interface_types {
    pub const INTERNAL: &str = "internal";
    pub const VXLAN: &str = "vxlan";
}

/// A table row, column name to OVSDB value.
pub type Row = Map<String, Value>;

/// Row changes of one table keyed by row uuid.
pub type TableUpdate = HashMap<String, RowUpdate>;

/// Change batch keyed by table name.
pub type TableUpdates = HashMap<String, TableUpdate>;

/// Old and new image of a changed row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
}

impl RowUpdate {
    /// True when the row was removed.
    pub fn is_delete(&self) -> bool {
        self.new.as_ref().map_or(true, Map::is_empty)
    }

    /// The image describing the row after the change, or before it for a
    /// delete.
    pub fn current(&self) -> Option<&Row> {
        if self.is_delete() {
            self.old.as_ref()
        } else {
            self.new.as_ref()
        }
    }
}

/// `["uuid", id]`
pub fn uuid(id: &str) -> Value {
    json!(["uuid", id])
}

/// `["named-uuid", name]`, a reference to a row inserted earlier in the
/// same transaction.
pub fn named_uuid(name: &str) -> Value {
    json!(["named-uuid", name])
}

/// `["set", [...]]`
pub fn set(values: impl IntoIterator<Item = Value>) -> Value {
    json!(["set", values.into_iter().collect::<Vec<_>>()])
}

/// `["map", [[k, v], ...]]`
pub fn map<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Value
where
    K: Into<Value>,
    V: Into<Value>,
{
    let pairs: Vec<Value> = pairs
        .into_iter()
        .map(|(k, v)| Value::Array(vec![k.into(), v.into()]))
        .collect();
    json!(["map", pairs])
}

/// Extracts the id of a `["uuid", id]` value.
pub fn uuid_of(value: &Value) -> Option<&str> {
    match value.as_array()?.as_slice() {
        [tag, Value::String(id)] if tag == "uuid" => Some(id.as_str()),
        _ => None,
    }
}

/// String column of a row.
pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

/// Kind of a transaction statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Select,
    Update,
    Mutate,
    Delete,
}

/// `[column, function, value]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition(pub String, pub String, pub Value);

impl Condition {
    /// `column == value`
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self(column.to_string(), "==".to_string(), value.into())
    }
}

/// `[column, mutator, value]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation(pub String, pub String, pub Value);

impl Mutation {
    /// Adds the elements of a set or the pairs of a map.
    pub fn insert(column: &str, value: Value) -> Self {
        Self(column.to_string(), "insert".to_string(), value)
    }

    /// Removes the elements of a set or the keys of a map.
    pub fn delete(column: &str, value: Value) -> Self {
        Self(column.to_string(), "delete".to_string(), value)
    }
}

/// One statement of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<Mutation>>,
    #[serde(rename = "uuid-name", default, skip_serializing_if = "Option::is_none")]
    pub uuid_name: Option<String>,
}

impl Operation {
    fn new(op: OpKind, table: &str) -> Self {
        Self {
            op,
            table: table.to_string(),
            row: None,
            conditions: None,
            mutations: None,
            uuid_name: None,
        }
    }

    /// Inserts `row`, naming it `uuid_name` for later statements.
    pub fn insert(table: &str, row: Row, uuid_name: &str) -> Self {
        Self {
            row: Some(row),
            uuid_name: Some(uuid_name.to_string()),
            ..Self::new(OpKind::Insert, table)
        }
    }

    pub fn select(table: &str, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::new(OpKind::Select, table)
        }
    }

    pub fn delete(table: &str, conditions: Vec<Condition>) -> Self {
        Self {
            conditions: Some(conditions),
            ..Self::new(OpKind::Delete, table)
        }
    }

    pub fn mutate(table: &str, conditions: Vec<Condition>, mutations: Vec<Mutation>) -> Self {
        Self {
            conditions: Some(conditions),
            mutations: Some(mutations),
            ..Self::new(OpKind::Mutate, table)
        }
    }

    /// Conditions of the statement, empty for inserts.
    pub fn where_clause(&self) -> &[Condition] {
        self.conditions.as_deref().unwrap_or_default()
    }
}

/// Reply to one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
}

impl OperationResult {
    /// Reply of a successful insert.
    pub fn inserted(id: &str) -> Self {
        Self {
            uuid: Some(uuid(id)),
            ..Self::default()
        }
    }

    /// Reply of a successful delete or mutate.
    pub fn counted(count: u64) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    /// Reply of a successful select.
    pub fn selected(rows: Vec<Row>) -> Self {
        Self {
            rows: Some(rows),
            ..Self::default()
        }
    }

    /// Failed statement.
    pub fn failed(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            details: Some(details.into()),
            ..Self::default()
        }
    }

    /// Id of the inserted row.
    pub fn uuid_str(&self) -> Option<&str> {
        self.uuid.as_ref().and_then(uuid_of)
    }

    /// Error tag, if the statement failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}
