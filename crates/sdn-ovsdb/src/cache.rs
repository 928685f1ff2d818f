//! Local mirror of the switch database.

use std::collections::HashMap;

use crate::model::{row_str, tables, Row, TableUpdates};

/// Table name to (row uuid to row).
#[derive(Debug, Clone, Default)]
pub struct TableCache {
    tables: HashMap<String, HashMap<String, Row>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a change batch. Rows with an empty new image are removed.
    pub fn apply(&mut self, updates: &TableUpdates) {
        for (table, rows) in updates {
            let cached = self.tables.entry(table.clone()).or_default();
            for (uuid, update) in rows {
                match &update.new {
                    Some(new) if !new.is_empty() => {
                        cached.insert(uuid.clone(), new.clone());
                    }
                    _ => {
                        cached.remove(uuid);
                    }
                }
            }
        }
    }

    /// Rows of a table.
    pub fn table(&self, name: &str) -> Option<&HashMap<String, Row>> {
        self.tables.get(name)
    }

    pub fn row(&self, table: &str, uuid: &str) -> Option<&Row> {
        self.tables.get(table)?.get(uuid)
    }

    /// Finds the row whose `name` column equals `name`.
    pub fn find_by_name(&self, table: &str, name: &str) -> Option<(&str, &Row)> {
        self.tables
            .get(table)?
            .iter()
            .find(|(_, row)| row_str(row, "name") == Some(name))
            .map(|(uuid, row)| (uuid.as_str(), row))
    }

    /// Uuid of the row named `name`.
    pub fn uuid_for_name(&self, table: &str, name: &str) -> Option<String> {
        self.find_by_name(table, name)
            .map(|(uuid, _)| uuid.to_string())
    }

    /// Uuid of the single `Open_vSwitch` row.
    pub fn root_uuid(&self) -> Option<&str> {
        self.tables
            .get(tables::OPEN_VSWITCH)?
            .keys()
            .next()
            .map(String::as_str)
    }

    /// Number of rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(HashMap::is_empty)
    }
}
