//! In-memory switch database for tests.
//!
//! Executes the statement kinds the driver issues (insert, select, delete,
//! mutate) atomically against a private copy of the tables, publishes row
//! diffs to the connected session and records every transaction. Faults can
//! be queued to fail the next transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::{Connection, Connector, OvsdbTransport};
use crate::error::{OvsdbError, OvsdbResult};
use crate::model::{
    columns, row_str, tables, uuid, uuid_of, OpKind, Operation, OperationResult, Row, RowUpdate,
    TableUpdates,
};

type Database = HashMap<String, HashMap<String, Row>>;

enum Fault {
    Statement { index: usize, error: String },
    ShortReply,
}

struct MockState {
    db: Database,
    root: String,
    subscriber: Option<mpsc::UnboundedSender<TableUpdates>>,
    transactions: Vec<Vec<Operation>>,
    faults: VecDeque<Fault>,
    connect_failures: u32,
    connect_attempts: u32,
}

/// Fake switch database shared by clones.
#[derive(Clone)]
pub struct MockSwitch {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSwitch {
    /// A database holding only the root row.
    pub fn new() -> Self {
        let root = Uuid::new_v4().to_string();
        let mut db = Database::new();
        for table in [tables::BRIDGE, tables::PORT, tables::INTERFACE] {
            db.insert(table.to_string(), HashMap::new());
        }
        let mut root_row = Row::new();
        root_row.insert(columns::BRIDGES.to_string(), json!(["set", []]));
        db.entry(tables::OPEN_VSWITCH.to_string())
            .or_default()
            .insert(root.clone(), root_row);

        Self {
            state: Arc::new(Mutex::new(MockState {
                db,
                root,
                subscriber: None,
                transactions: Vec::new(),
                faults: VecDeque::new(),
                connect_failures: 0,
                connect_attempts: 0,
            })),
        }
    }

    pub fn root_uuid(&self) -> String {
        self.state.lock().root.clone()
    }

    /// Refuses the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.state.lock().connect_failures = n;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Ends the update stream of the current connection, as a server
    /// restart would.
    pub fn drop_connection(&self) {
        self.state.lock().subscriber = None;
    }

    /// Makes statement `index` of the next transaction fail.
    pub fn fail_statement(&self, index: usize, error: &str) {
        self.state.lock().faults.push_back(Fault::Statement {
            index,
            error: error.to_string(),
        });
    }

    /// Makes the next transaction return one reply too few.
    pub fn fail_short_reply(&self) {
        self.state.lock().faults.push_back(Fault::ShortReply);
    }

    /// Every transaction received so far.
    pub fn transactions(&self) -> Vec<Vec<Operation>> {
        self.state.lock().transactions.clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .db
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_rows(&self, table: &str) -> usize {
        self.state.lock().db.get(table).map_or(0, HashMap::len)
    }

    pub fn row_by_name(&self, table: &str, name: &str) -> Option<Row> {
        let state = self.state.lock();
        find_by_name(&state.db, table, name).map(|(_, row)| row.clone())
    }

    pub fn uuid_by_name(&self, table: &str, name: &str) -> Option<String> {
        let state = self.state.lock();
        find_by_name(&state.db, table, name).map(|(id, _)| id.to_string())
    }

    /// Bridge uuids registered on the root row.
    pub fn root_bridges(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .db
            .get(tables::OPEN_VSWITCH)
            .and_then(|rows| rows.get(&state.root))
            .and_then(|row| row.get(columns::BRIDGES))
            .map(uuid_elements)
            .unwrap_or_default()
    }

    /// Port uuids attached to bridge `name`.
    pub fn bridge_ports(&self, name: &str) -> Vec<String> {
        self.row_by_name(tables::BRIDGE, name)
            .and_then(|row| row.get(columns::PORTS).map(uuid_elements))
            .unwrap_or_default()
    }

    /// Inserts a row named `name` as if another client had done it.
    pub fn insert_row(&self, table: &str, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let mut row = Row::new();
        row.insert(columns::NAME.to_string(), json!(name));

        let mut state = self.state.lock();
        let mut next = state.db.clone();
        next.entry(table.to_string())
            .or_default()
            .insert(id.clone(), row);
        state.commit(next);
        id
    }

    /// Deletes the row named `name` and every reference to it, as an
    /// external reset would.
    pub fn remove_row(&self, table: &str, name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(id) = find_by_name(&state.db, table, name).map(|(id, _)| id.to_string()) else {
            return false;
        };

        let mut next = state.db.clone();
        if let Some(rows) = next.get_mut(table) {
            rows.remove(&id);
        }
        strip_references(&mut next, &id);
        state.commit(next);
        true
    }
}

impl MockState {
    /// Installs `next` and publishes the diff.
    fn commit(&mut self, mut next: Database) {
        collect_garbage(&mut next);
        let updates = diff(&self.db, &next);
        self.db = next;
        if updates.is_empty() {
            return;
        }
        if let Some(tx) = &self.subscriber {
            let _ = tx.send(updates);
        }
    }

    fn transact(&mut self, ops: Vec<Operation>) -> Vec<OperationResult> {
        self.transactions.push(ops.clone());

        if let Some(fault) = self.faults.pop_front() {
            let mut replies = vec![OperationResult::default(); ops.len()];
            match fault {
                Fault::ShortReply => {
                    replies.pop();
                }
                Fault::Statement { index, error } => {
                    if let Some(reply) = replies.get_mut(index) {
                        *reply = OperationResult::failed(error, "injected fault");
                    }
                }
            }
            return replies;
        }

        let mut next = self.db.clone();
        let mut named = HashMap::new();
        let mut replies = Vec::with_capacity(ops.len());

        for op in &ops {
            match execute(&mut next, &mut named, op) {
                Ok(reply) => replies.push(reply),
                Err(error) => {
                    replies.push(OperationResult::failed(error, ""));
                    replies.resize(ops.len(), OperationResult::default());
                    return replies;
                }
            }
        }

        self.commit(next);
        replies
    }
}

#[async_trait]
impl OvsdbTransport for MockSwitch {
    async fn transact(&self, ops: Vec<Operation>) -> OvsdbResult<Vec<OperationResult>> {
        Ok(self.state.lock().transact(ops))
    }

    async fn monitor_all(&self) -> OvsdbResult<TableUpdates> {
        let state = self.state.lock();
        Ok(diff(&Database::new(), &state.db))
    }
}

#[async_trait]
impl Connector for MockSwitch {
    async fn connect(&self) -> OvsdbResult<Connection> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(OvsdbError::connection("mock", "connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriber = Some(tx);
        Ok(Connection {
            transport: Arc::new(self.clone()),
            updates: rx,
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

fn find_by_name<'a>(db: &'a Database, table: &str, name: &str) -> Option<(&'a str, &'a Row)> {
    db.get(table)?
        .iter()
        .find(|(_, row)| row_str(row, columns::NAME) == Some(name))
        .map(|(id, row)| (id.as_str(), row))
}

fn execute(
    db: &mut Database,
    named: &mut HashMap<String, String>,
    op: &Operation,
) -> Result<OperationResult, String> {
    match op.op {
        OpKind::Insert => {
            let mut row = op.row.clone().unwrap_or_default();
            for value in row.values_mut() {
                resolve_named(value, named);
            }

            let rows = db.entry(op.table.clone()).or_default();
            if let Some(name) = row_str(&row, columns::NAME) {
                if rows.values().any(|r| row_str(r, columns::NAME) == Some(name)) {
                    return Err("constraint violation".to_string());
                }
            }

            let id = Uuid::new_v4().to_string();
            rows.insert(id.clone(), row);
            if let Some(name) = &op.uuid_name {
                named.insert(name.clone(), id.clone());
            }
            Ok(OperationResult::inserted(&id))
        }
        OpKind::Select => {
            let rows = matching(db, op)
                .into_iter()
                .filter_map(|id| {
                    let mut row = db.get(&op.table)?.get(&id)?.clone();
                    row.insert(columns::UUID.to_string(), uuid(&id));
                    Some(row)
                })
                .collect();
            Ok(OperationResult::selected(rows))
        }
        OpKind::Delete => {
            let ids = matching(db, op);
            if let Some(rows) = db.get_mut(&op.table) {
                for id in &ids {
                    rows.remove(id);
                }
            }
            Ok(OperationResult::counted(ids.len() as u64))
        }
        OpKind::Mutate => {
            let ids = matching(db, op);
            let mutations = op.mutations.clone().unwrap_or_default();
            if let Some(rows) = db.get_mut(&op.table) {
                for id in &ids {
                    let Some(row) = rows.get_mut(id) else { continue };
                    for mutation in &mutations {
                        let mut value = mutation.2.clone();
                        resolve_named(&mut value, named);
                        mutate(row, &mutation.0, &mutation.1, value)?;
                    }
                }
            }
            Ok(OperationResult::counted(ids.len() as u64))
        }
        OpKind::Update => Err("not supported".to_string()),
    }
}

fn matching(db: &Database, op: &Operation) -> Vec<String> {
    let Some(rows) = db.get(&op.table) else {
        return Vec::new();
    };

    rows.iter()
        .filter(|(id, row)| {
            op.where_clause().iter().all(|cond| {
                cond.1 == "=="
                    && if cond.0 == columns::UUID {
                        uuid_of(&cond.2) == Some(id.as_str())
                    } else {
                        row.get(&cond.0) == Some(&cond.2)
                    }
            })
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn resolve_named(value: &mut Value, named: &HashMap<String, String>) {
    if let Value::Array(items) = value {
        if let [tag, Value::String(name)] = items.as_slice() {
            if tag == "named-uuid" {
                if let Some(id) = named.get(name) {
                    *value = uuid(id);
                    return;
                }
            }
        }
        for item in items.iter_mut() {
            resolve_named(item, named);
        }
    }
}

fn tagged<'a>(value: &'a Value, tag: &str) -> Option<&'a Vec<Value>> {
    match value.as_array()?.as_slice() {
        [t, Value::Array(items)] if t == tag => Some(items),
        _ => None,
    }
}

/// Elements of a set column; a bare atom is a one-element set.
fn set_elements(value: Option<&Value>) -> Vec<Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => tagged(v, "set").cloned().unwrap_or_else(|| vec![v.clone()]),
    }
}

fn map_entries(value: Option<&Value>) -> Vec<(Value, Value)> {
    value
        .and_then(|v| tagged(v, "map"))
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|pair| match pair.as_array()?.as_slice() {
                    [k, v] => Some((k.clone(), v.clone())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn uuid_elements(value: &Value) -> Vec<String> {
    set_elements(Some(value))
        .iter()
        .filter_map(|v| uuid_of(v).map(str::to_string))
        .collect()
}

fn map_value(entries: Vec<(Value, Value)>) -> Value {
    let pairs: Vec<Value> = entries.into_iter().map(|(k, v)| json!([k, v])).collect();
    json!(["map", pairs])
}

fn mutate(row: &mut Row, column: &str, mutator: &str, value: Value) -> Result<(), String> {
    let current = row.get(column);
    let operand_map = tagged(&value, "map").is_some();
    let column_map = current.and_then(|v| tagged(v, "map")).is_some();

    let updated = if operand_map || column_map {
        let mut entries = map_entries(current);
        match (mutator, operand_map) {
            ("insert", true) => {
                for (k, v) in map_entries(Some(&value)) {
                    if !entries.iter().any(|(key, _)| *key == k) {
                        entries.push((k, v));
                    }
                }
            }
            ("delete", true) => {
                let doomed = map_entries(Some(&value));
                entries.retain(|pair| !doomed.contains(pair));
            }
            ("delete", false) => {
                let keys = set_elements(Some(&value));
                entries.retain(|(k, _)| !keys.contains(k));
            }
            (other, _) => return Err(format!("unsupported map mutation {}", other)),
        }
        map_value(entries)
    } else {
        let mut elements = set_elements(current);
        let operand = set_elements(Some(&value));
        match mutator {
            "insert" => {
                for item in operand {
                    if !elements.contains(&item) {
                        elements.push(item);
                    }
                }
            }
            "delete" => elements.retain(|item| !operand.contains(item)),
            other => return Err(format!("unsupported mutator {}", other)),
        }
        json!(["set", elements])
    };

    row.insert(column.to_string(), updated);
    Ok(())
}

/// Drops ports and interfaces nothing refers to, as the server does for
/// non-root tables at commit.
fn collect_garbage(db: &mut Database) {
    loop {
        let mut referenced = HashSet::new();
        for rows in db.values() {
            for row in rows.values() {
                for value in row.values() {
                    collect_uuids(value, &mut referenced);
                }
            }
        }

        let mut removed = false;
        for table in [tables::PORT, tables::INTERFACE] {
            if let Some(rows) = db.get_mut(table) {
                let before = rows.len();
                rows.retain(|id, _| referenced.contains(id));
                removed |= rows.len() != before;
            }
        }
        if !removed {
            break;
        }
    }
}

fn collect_uuids(value: &Value, found: &mut HashSet<String>) {
    if let Some(id) = uuid_of(value) {
        found.insert(id.to_string());
        return;
    }
    if let Value::Array(items) = value {
        for item in items {
            collect_uuids(item, found);
        }
    }
}

fn strip_references(db: &mut Database, id: &str) {
    let target = uuid(id);
    for rows in db.values_mut() {
        for row in rows.values_mut() {
            for value in row.values_mut() {
                if *value == target {
                    *value = json!(["set", []]);
                } else if let Some(items) = tagged(value, "set") {
                    if items.contains(&target) {
                        let kept: Vec<Value> =
                            items.iter().filter(|v| **v != target).cloned().collect();
                        *value = json!(["set", kept]);
                    }
                }
            }
        }
    }
}

fn diff(before: &Database, after: &Database) -> TableUpdates {
    let mut updates = TableUpdates::new();
    let table_names: HashSet<&String> = before.keys().chain(after.keys()).collect();

    for table in table_names {
        let old_rows = before.get(table);
        let new_rows = after.get(table);
        let ids: HashSet<&String> = old_rows
            .into_iter()
            .flat_map(HashMap::keys)
            .chain(new_rows.into_iter().flat_map(HashMap::keys))
            .collect();

        for id in ids {
            let old = old_rows.and_then(|rows| rows.get(id));
            let new = new_rows.and_then(|rows| rows.get(id));
            if old != new {
                updates.entry(table.clone()).or_default().insert(
                    id.clone(),
                    RowUpdate {
                        old: old.cloned(),
                        new: new.cloned(),
                    },
                );
            }
        }
    }
    updates
}
