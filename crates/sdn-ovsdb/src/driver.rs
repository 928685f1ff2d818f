//! Topology driver - bridge, port and tunnel provisioning
//!
//! Every primitive is one atomic transaction. A reply list shorter than the
//! statement list, or any statement carrying an error, fails the whole call:
//! the server rolls the transaction back, so nothing is assumed committed.

use serde_json::{json, Value};
use std::net::Ipv4Addr;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{OvsdbError, OvsdbResult};
use crate::model::{
    columns, interface_types, map, named_uuid, row_str, set, tables, uuid, Condition, Mutation,
    Operation, OperationResult, Row, TableUpdates,
};
use crate::session::SwitchSession;

/// `other_config` key holding the owning container id.
pub const CONTEXT_KEY: &str = "container_id";

/// `other_config` key holding the serialized owner record.
pub const CONTEXT_VALUE: &str = "container_data";

const NAMED_BRIDGE: &str = "bridge";
const NAMED_PORT: &str = "port";
const NAMED_INTERFACE: &str = "intf";

/// Prefix of tunnel port names.
pub const TUNNEL_PORT_PREFIX: &str = "vx";

/// Name of the tunnel port towards `peer`: `vx` plus the address in hex.
pub fn tunnel_port_name(peer: Ipv4Addr) -> String {
    format!("{}{:08x}", TUNNEL_PORT_PREFIX, u32::from(peer))
}

/// True if `name` has the shape of a tunnel port name.
pub fn is_tunnel_port_name(name: &str) -> bool {
    name.strip_prefix(TUNNEL_PORT_PREFIX)
        .is_some_and(|rest| rest.len() == 8 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Fails unless every statement got a reply and none reports an error.
pub fn check_replies(expected: usize, replies: &[OperationResult]) -> OvsdbResult<()> {
    if replies.len() < expected {
        return Err(OvsdbError::ShortReply {
            expected,
            actual: replies.len(),
        });
    }

    match replies.iter().find_map(|reply| {
        reply
            .error()
            .map(|e| (e, reply.details.as_deref().unwrap_or_default()))
    }) {
        Some((error, details)) => Err(OvsdbError::transaction(error, details)),
        None => Ok(()),
    }
}

fn row(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Row {
    pairs
        .into_iter()
        .map(|(column, value)| (column.to_string(), value))
        .collect()
}

fn by_name(name: &str) -> Vec<Condition> {
    vec![Condition::eq(columns::NAME, name)]
}

/// Interface + port insert pair, the port wrapping the interface.
fn port_inserts(name: &str, intf_type: &str, intf_options: Option<Value>, tag: u16) -> Vec<Operation> {
    let mut intf = row([
        (columns::NAME, json!(name)),
        (columns::TYPE, json!(intf_type)),
    ]);
    if let Some(options) = intf_options {
        intf.insert(columns::OPTIONS.to_string(), options);
    }

    let mut port = row([
        (columns::NAME, json!(name)),
        (columns::INTERFACES, named_uuid(NAMED_INTERFACE)),
    ]);
    if tag != 0 {
        port.insert(columns::TAG.to_string(), json!(tag));
    }

    vec![
        Operation::insert(tables::INTERFACE, intf, NAMED_INTERFACE),
        Operation::insert(tables::PORT, port, NAMED_PORT),
    ]
}

/// Bridge mutation adding the port inserted as `NAMED_PORT`.
fn attach_port(bridge: &str) -> Operation {
    Operation::mutate(
        tables::BRIDGE,
        by_name(bridge),
        vec![Mutation::insert(columns::PORTS, set([named_uuid(NAMED_PORT)]))],
    )
}

/// Provisions switch topology through a [`SwitchSession`].
#[derive(Clone)]
pub struct TopologyDriver {
    session: SwitchSession,
}

impl TopologyDriver {
    pub fn new(session: SwitchSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SwitchSession {
        &self.session
    }

    async fn execute(&self, ops: Vec<Operation>) -> OvsdbResult<Vec<OperationResult>> {
        let expected = ops.len();
        let replies = self.session.transact(ops).await?;
        check_replies(expected, &replies)?;
        Ok(replies)
    }

    fn root_uuid(&self) -> OvsdbResult<String> {
        self.session
            .with_cache(|cache| cache.root_uuid().map(str::to_string))
            .ok_or(OvsdbError::MissingRoot)
    }

    /// Uuid of the bridge named `name`, from the mirror.
    pub fn bridge_uuid(&self, name: &str) -> Option<String> {
        self.session
            .with_cache(|cache| cache.uuid_for_name(tables::BRIDGE, name))
    }

    /// Creates bridge `name` with its internal port and registers it on the
    /// root row. Returns the new bridge uuid.
    #[instrument(skip(self))]
    pub async fn create_bridge(&self, name: &str) -> OvsdbResult<String> {
        let root = self.root_uuid()?;

        let mut ops = port_inserts(name, interface_types::INTERNAL, None, 0);
        ops.push(Operation::insert(
            tables::BRIDGE,
            row([
                (columns::NAME, json!(name)),
                (columns::STP_ENABLE, json!(true)),
                (columns::PORTS, named_uuid(NAMED_PORT)),
            ]),
            NAMED_BRIDGE,
        ));
        ops.push(Operation::mutate(
            tables::OPEN_VSWITCH,
            vec![Condition::eq(columns::UUID, uuid(&root))],
            vec![Mutation::insert(columns::BRIDGES, set([named_uuid(NAMED_BRIDGE)]))],
        ));
        let bridge_index = ops.len() - 2;

        let replies = self.execute(ops).await?;
        let bridge_uuid = replies[bridge_index]
            .uuid_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OvsdbError::transaction("missing uuid", "bridge insert returned no uuid"))?
            .to_string();

        info!(bridge = name, uuid = %bridge_uuid, "Created bridge");
        Ok(bridge_uuid)
    }

    /// Returns the uuid of bridge `name`, creating it if the mirror has no
    /// such bridge.
    pub async fn ensure_bridge(&self, name: &str) -> OvsdbResult<String> {
        match self.bridge_uuid(name) {
            Some(existing) => {
                debug!(bridge = name, "Bridge already present");
                Ok(existing)
            }
            None => self.create_bridge(name).await,
        }
    }

    /// Deletes bridge `name` and unregisters `bridge_uuid` from the root row.
    #[instrument(skip(self))]
    pub async fn delete_bridge(&self, name: &str, bridge_uuid: &str) -> OvsdbResult<()> {
        let root = self.root_uuid()?;
        let ops = vec![
            Operation::delete(tables::BRIDGE, by_name(name)),
            Operation::mutate(
                tables::OPEN_VSWITCH,
                vec![Condition::eq(columns::UUID, uuid(&root))],
                vec![Mutation::delete(columns::BRIDGES, set([uuid(bridge_uuid)]))],
            ),
        ];

        self.execute(ops).await?;
        info!(bridge = name, "Deleted bridge");
        Ok(())
    }

    /// Adds internal port `port` to `bridge`. A zero `tag` leaves the port
    /// untagged.
    #[instrument(skip(self))]
    pub async fn add_internal_port(&self, bridge: &str, port: &str, tag: u16) -> OvsdbResult<()> {
        let mut ops = port_inserts(port, interface_types::INTERNAL, None, tag);
        ops.push(attach_port(bridge));

        self.execute(ops).await?;
        info!(bridge, port, tag, "Added internal port");
        Ok(())
    }

    /// Adds a VXLAN port to `bridge` with `peer` as remote endpoint.
    #[instrument(skip(self))]
    pub async fn add_tunnel_port(&self, bridge: &str, port: &str, peer: Ipv4Addr) -> OvsdbResult<()> {
        let options = map([(columns::REMOTE_IP, peer.to_string())]);
        let mut ops = port_inserts(port, interface_types::VXLAN, Some(options), 0);
        ops.push(attach_port(bridge));

        self.execute(ops).await?;
        info!(bridge, port, %peer, "Added tunnel port");
        Ok(())
    }

    /// Removes `port` from `bridge`. Returns false if the port does not
    /// exist.
    #[instrument(skip(self))]
    pub async fn delete_port(&self, bridge: &str, port: &str) -> OvsdbResult<bool> {
        let port_uuid = match self
            .session
            .with_cache(|cache| cache.uuid_for_name(tables::PORT, port))
        {
            Some(id) => id,
            None => match self.lookup_uuid(tables::PORT, port).await? {
                Some(id) => id,
                None => {
                    debug!(port, "No such port");
                    return Ok(false);
                }
            },
        };

        let ops = vec![
            Operation::delete(tables::PORT, by_name(port)),
            Operation::mutate(
                tables::BRIDGE,
                by_name(bridge),
                vec![Mutation::delete(columns::PORTS, set([uuid(&port_uuid)]))],
            ),
        ];

        self.execute(ops).await?;
        info!(bridge, port, "Deleted port");
        Ok(true)
    }

    /// Records the owning container on the port's interface so the port can
    /// be traced back to it.
    #[instrument(skip(self, payload))]
    pub async fn tag_port_with_owner(
        &self,
        port: &str,
        container_id: &str,
        payload: &str,
    ) -> OvsdbResult<()> {
        let other_config = map([(CONTEXT_KEY, container_id), (CONTEXT_VALUE, payload)]);
        let ops = vec![Operation::mutate(
            tables::INTERFACE,
            by_name(port),
            vec![Mutation::insert(columns::OTHER_CONFIG, other_config)],
        )];

        self.execute(ops).await?;
        debug!(port, container_id, "Tagged port with owner");
        Ok(())
    }

    /// Asks the server whether a port named `name` exists.
    pub async fn port_exists(&self, name: &str) -> OvsdbResult<bool> {
        Ok(self.lookup_uuid(tables::PORT, name).await?.is_some())
    }

    async fn lookup_uuid(&self, table: &str, name: &str) -> OvsdbResult<Option<String>> {
        let replies = self
            .execute(vec![Operation::select(table, by_name(name))])
            .await?;

        let Some(rows) = replies[0].rows.as_ref() else {
            return Ok(None);
        };
        let Some(first) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(
            first
                .get(columns::UUID)
                .and_then(crate::model::uuid_of)
                .unwrap_or_default()
                .to_string(),
        ))
    }

    /// Recreates `bridge` whenever a change batch touches it and leaves it
    /// missing from the mirror. Stops when the session closes.
    pub fn spawn_bridge_watch(&self, bridge: impl Into<String>) -> JoinHandle<()> {
        let bridge = bridge.into();
        let driver = self.clone();
        let mut updates = self.session.subscribe();
        let closed = self.session.closed();

        tokio::spawn(async move {
            info!(bridge = %bridge, "Watching integration bridge");
            loop {
                let batch = tokio::select! {
                    _ = closed.cancelled() => break,
                    batch = updates.recv() => batch,
                };

                let touched = match batch {
                    Ok(batch) => names_bridge(&batch, &bridge),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bridge watch lagged behind updates");
                        true
                    }
                    Err(RecvError::Closed) => break,
                };

                if touched && driver.bridge_uuid(&bridge).is_none() {
                    warn!(bridge = %bridge, "Integration bridge missing, recreating");
                    if let Err(e) = driver.create_bridge(&bridge).await {
                        error!(bridge = %bridge, error = %e, "Failed to recreate bridge");
                    }
                }
            }
            debug!(bridge = %bridge, "Bridge watch stopped");
        })
    }
}

/// True if a Bridge row of the batch is named `bridge`, reading the new
/// image for inserts and modifications and the old one for deletes.
fn names_bridge(batch: &TableUpdates, bridge: &str) -> bool {
    batch.get(tables::BRIDGE).is_some_and(|rows| {
        rows.values()
            .filter_map(|update| update.current())
            .any(|row| row_str(row, columns::NAME) == Some(bridge))
    })
}
