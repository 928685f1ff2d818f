//! Command core.
//!
//! One task owns the connection map and processes connection, network and
//! cluster commands one at a time, each to completion before the next is taken.
//! Request handlers talk to it only through [`CoreHandle`]; they read the
//! connection map from a snapshot the core republishes after every change.

use sdn_ipam::{Network, DEFAULT_NETWORK};
use sdn_ovsdb::model::tables;
use sdn_ovsdb::tunnel_port_name;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{SdnError, SdnResult};
use crate::membership::ClusterAgent;
use crate::metrics::MetricsCollector;
use crate::network::NetworkService;
use crate::types::{mac_for_ip, Connection, ConnectionMap, OvsConnection};

/// Pending commands per stream before senders wait.
pub const COMMAND_QUEUE_DEPTH: usize = 128;

/// Prefix of container port names.
pub const PORT_PREFIX: &str = "ovs";

/// New container port name: `ovs` followed by 8 hex digits.
pub fn container_port_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}", PORT_PREFIX, &id[..8])
}

/// True if `name` has the shape of a container port name.
pub fn is_container_port_name(name: &str) -> bool {
    name.strip_prefix(PORT_PREFIX)
        .is_some_and(|rest| rest.len() == 8 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

#[derive(Debug)]
pub enum ConnectionAction {
    Add(Connection),
    /// Container id to detach.
    Delete(String),
}

/// A connection command and where to send its outcome.
#[derive(Debug)]
pub struct ConnectionCommand {
    pub action: ConnectionAction,
    pub reply: oneshot::Sender<SdnResult<Connection>>,
}

#[derive(Debug)]
pub enum NetworkAction {
    /// Network name and subnet as received.
    Create { name: String, subnet: String },
    Delete(String),
}

/// A network command and where to send its outcome.
#[derive(Debug)]
pub struct NetworkCommand {
    pub action: NetworkAction,
    pub reply: oneshot::Sender<SdnResult<Network>>,
}

/// Cluster commands. Outcomes are logged and counted, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterCommand {
    /// Join the cluster through the given node.
    Join(Ipv4Addr),
    Leave,
    /// A peer became reachable; build a tunnel to it.
    PeerUp(Ipv4Addr),
    /// A peer went away; drop its tunnel.
    PeerDown(Ipv4Addr),
}

impl ClusterCommand {
    fn kind(&self) -> &'static str {
        match self {
            ClusterCommand::Join(_) => "join",
            ClusterCommand::Leave => "leave",
            ClusterCommand::PeerUp(_) => "peer_up",
            ClusterCommand::PeerDown(_) => "peer_down",
        }
    }
}

/// Sending side of the command core.
#[derive(Clone)]
pub struct CoreHandle {
    connection_tx: mpsc::Sender<ConnectionCommand>,
    network_tx: mpsc::Sender<NetworkCommand>,
    cluster_tx: mpsc::Sender<ClusterCommand>,
    snapshot: watch::Receiver<Arc<ConnectionMap>>,
}

impl CoreHandle {
    /// Attaches a container and returns the finalized connection.
    pub async fn connect(&self, connection: Connection) -> SdnResult<Connection> {
        self.request(ConnectionAction::Add(connection)).await
    }

    /// Detaches a container and returns the removed connection.
    pub async fn disconnect(&self, container_id: &str) -> SdnResult<Connection> {
        self.request(ConnectionAction::Delete(container_id.to_string()))
            .await
    }

    async fn request(&self, action: ConnectionAction) -> SdnResult<Connection> {
        let (reply, rx) = oneshot::channel();
        self.connection_tx
            .send(ConnectionCommand { action, reply })
            .await
            .map_err(|_| SdnError::CoreStopped)?;
        rx.await.map_err(|_| SdnError::CoreStopped)?
    }

    /// Creates a network and its gateway port.
    pub async fn create_network(&self, name: &str, subnet: &str) -> SdnResult<Network> {
        self.request_network(NetworkAction::Create {
            name: name.to_string(),
            subnet: subnet.to_string(),
        })
        .await
    }

    /// Deletes a network and its gateway port.
    pub async fn delete_network(&self, name: &str) -> SdnResult<Network> {
        self.request_network(NetworkAction::Delete(name.to_string()))
            .await
    }

    async fn request_network(&self, action: NetworkAction) -> SdnResult<Network> {
        let (reply, rx) = oneshot::channel();
        self.network_tx
            .send(NetworkCommand { action, reply })
            .await
            .map_err(|_| SdnError::CoreStopped)?;
        rx.await.map_err(|_| SdnError::CoreStopped)?
    }

    /// Latest connection map.
    pub fn connections(&self) -> Arc<ConnectionMap> {
        self.snapshot.borrow().clone()
    }

    pub fn connection(&self, container_id: &str) -> Option<Connection> {
        self.snapshot.borrow().get(container_id).cloned()
    }

    pub async fn join_cluster(&self, address: Ipv4Addr) -> SdnResult<()> {
        self.send_cluster(ClusterCommand::Join(address)).await
    }

    pub async fn leave_cluster(&self) -> SdnResult<()> {
        self.send_cluster(ClusterCommand::Leave).await
    }

    pub async fn peer_up(&self, peer: Ipv4Addr) -> SdnResult<()> {
        self.send_cluster(ClusterCommand::PeerUp(peer)).await
    }

    pub async fn peer_down(&self, peer: Ipv4Addr) -> SdnResult<()> {
        self.send_cluster(ClusterCommand::PeerDown(peer)).await
    }

    async fn send_cluster(&self, command: ClusterCommand) -> SdnResult<()> {
        self.cluster_tx
            .send(command)
            .await
            .map_err(|_| SdnError::CoreStopped)
    }
}

/// Owner of the connection map.
pub struct CommandCore {
    networks: NetworkService,
    agent: Arc<dyn ClusterAgent>,
    metrics: MetricsCollector,
    connections: ConnectionMap,
    snapshot: watch::Sender<Arc<ConnectionMap>>,
    connection_rx: mpsc::Receiver<ConnectionCommand>,
    network_rx: mpsc::Receiver<NetworkCommand>,
    cluster_rx: mpsc::Receiver<ClusterCommand>,
}

impl CommandCore {
    pub fn new(
        networks: NetworkService,
        agent: Arc<dyn ClusterAgent>,
        metrics: MetricsCollector,
    ) -> (Self, CoreHandle) {
        let (connection_tx, connection_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (network_tx, network_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (cluster_tx, cluster_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snapshot, snapshot_rx) = watch::channel(Arc::new(ConnectionMap::new()));

        let core = Self {
            networks,
            agent,
            metrics,
            connections: ConnectionMap::new(),
            snapshot,
            connection_rx,
            network_rx,
            cluster_rx,
        };
        let handle = CoreHandle {
            connection_tx,
            network_tx,
            cluster_tx,
            snapshot: snapshot_rx,
        };
        (core, handle)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Processes commands until `shutdown` fires or every handle is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(bridge = self.networks.bridge(), "Command core started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(command) = self.connection_rx.recv() => {
                    self.handle_connection(command).await;
                }
                Some(command) = self.network_rx.recv() => {
                    self.handle_network(command).await;
                }
                Some(command) = self.cluster_rx.recv() => {
                    self.handle_cluster(command).await;
                }
                else => break,
            }
        }
        info!(connections = self.connections.len(), "Command core stopped");
    }

    async fn handle_connection(&mut self, command: ConnectionCommand) {
        let started = Instant::now();
        let (kind, result) = match command.action {
            ConnectionAction::Add(connection) => ("connect", self.add_connection(connection).await),
            ConnectionAction::Delete(id) => ("disconnect", self.delete_connection(&id).await),
        };

        self.metrics.record_command(kind, result.is_ok());
        self.metrics
            .command_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(command = kind, error = %e, "Connection command failed");
        }

        if command.reply.send(result).is_err() {
            debug!(command = kind, "Requester went away before the reply");
        }
    }

    async fn handle_network(&mut self, command: NetworkCommand) {
        let started = Instant::now();
        let (kind, result) = match command.action {
            NetworkAction::Create { name, subnet } => (
                "create_network",
                self.networks.create_from_request(&name, &subnet).await,
            ),
            NetworkAction::Delete(name) => ("delete_network", self.networks.delete(&name).await),
        };

        self.metrics.record_command(kind, result.is_ok());
        self.metrics
            .command_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!(command = kind, error = %e, "Network command failed");
        }

        if command.reply.send(result).is_err() {
            debug!(command = kind, "Requester went away before the reply");
        }
    }

    #[instrument(skip(self, connection), fields(container = %connection.container_id))]
    async fn add_connection(&mut self, mut connection: Connection) -> SdnResult<Connection> {
        if connection.container_id.is_empty() {
            return Err(SdnError::bad_request("containerID is required"));
        }
        if let Some(existing) = self.connections.get(&connection.container_id) {
            debug!("Container already connected");
            return Ok(existing.clone());
        }
        if connection.network.is_empty() {
            connection.network = DEFAULT_NETWORK.to_string();
        }

        let network = self.networks.resolve(&connection.network).await?;
        let allocator = self.networks.registry().allocator();
        let ip = allocator.allocate_ip(network.subnet).await?;

        if let Err(e) = self.attach(&mut connection, &network, ip).await {
            if let Err(undo) = allocator.release_ip(ip, network.subnet).await {
                warn!(%ip, error = %undo, "Failed to release address");
            }
            return Err(e);
        }

        self.connections
            .insert(connection.container_id.clone(), connection.clone());
        self.publish();

        info!(
            network = %network.name,
            port = %connection.ovs_port_id,
            %ip,
            "Connected container"
        );
        Ok(connection)
    }

    /// Creates and tags the container port. Leaves no port behind on failure.
    async fn attach(
        &self,
        connection: &mut Connection,
        network: &Network,
        ip: Ipv4Addr,
    ) -> SdnResult<()> {
        let port = container_port_name();
        connection.ovs_port_id = port.clone();
        connection.connection_detail = Some(OvsConnection {
            name: port.clone(),
            ip,
            subnet: network.subnet,
            mac: mac_for_ip(ip),
            gateway: network.gateway,
        });
        let payload = serde_json::to_string(&*connection)?;

        let driver = self.networks.driver();
        let bridge = self.networks.bridge();
        driver
            .add_internal_port(bridge, &port, network.vlan_id)
            .await?;

        if let Err(e) = driver
            .tag_port_with_owner(&port, &connection.container_id, &payload)
            .await
        {
            if let Err(undo) = driver.delete_port(bridge, &port).await {
                warn!(port = %port, error = %undo, "Failed to remove untagged port");
            }
            return Err(e.into());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_connection(&mut self, container_id: &str) -> SdnResult<Connection> {
        let connection = self
            .connections
            .get(container_id)
            .cloned()
            .ok_or_else(|| SdnError::not_found(format!("container {} not found", container_id)))?;

        self.networks
            .driver()
            .delete_port(self.networks.bridge(), &connection.ovs_port_id)
            .await?;

        if let Some(detail) = &connection.connection_detail {
            let allocator = self.networks.registry().allocator();
            match allocator.release_ip(detail.ip, detail.subnet).await {
                Ok(true) => {}
                Ok(false) => debug!(ip = %detail.ip, "Address pool already gone"),
                Err(e) => warn!(ip = %detail.ip, error = %e, "Failed to release address"),
            }
        }

        self.connections.remove(container_id);
        self.publish();
        info!(port = %connection.ovs_port_id, "Disconnected container");
        Ok(connection)
    }

    fn publish(&self) {
        self.metrics.set_connections(self.connections.len());
        self.snapshot.send_replace(Arc::new(self.connections.clone()));
    }

    async fn handle_cluster(&mut self, command: ClusterCommand) {
        let ok = match command {
            ClusterCommand::Join(address) => match self.agent.join(address).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%address, error = %e, "Failed to join cluster");
                    false
                }
            },
            ClusterCommand::Leave => match self.agent.leave().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Failed to leave cluster");
                    false
                }
            },
            ClusterCommand::PeerUp(peer) => self.add_tunnel(peer).await,
            ClusterCommand::PeerDown(peer) => self.remove_tunnel(peer).await,
        };
        self.metrics.record_command(command.kind(), ok);
    }

    async fn add_tunnel(&self, peer: Ipv4Addr) -> bool {
        if peer == self.agent.local_address() {
            debug!(%peer, "Skipping tunnel to self");
            return true;
        }

        let port = tunnel_port_name(peer);
        let driver = self.networks.driver();
        let known = driver
            .session()
            .with_cache(|cache| cache.uuid_for_name(tables::PORT, &port).is_some());
        if known {
            debug!(%peer, port = %port, "Tunnel already present");
            return true;
        }

        match driver
            .add_tunnel_port(self.networks.bridge(), &port, peer)
            .await
        {
            Ok(()) => {
                self.metrics.tunnels.inc();
                true
            }
            Err(e) => {
                self.metrics.record_tunnel_failure();
                warn!(%peer, port = %port, error = %e, "Failed to create tunnel port");
                false
            }
        }
    }

    async fn remove_tunnel(&self, peer: Ipv4Addr) -> bool {
        let port = tunnel_port_name(peer);
        match self
            .networks
            .driver()
            .delete_port(self.networks.bridge(), &port)
            .await
        {
            Ok(true) => {
                self.metrics.tunnels.dec();
                true
            }
            Ok(false) => {
                debug!(%peer, "No tunnel to remove");
                true
            }
            Err(e) => {
                self.metrics.record_tunnel_failure();
                warn!(%peer, port = %port, error = %e, "Failed to remove tunnel port");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_port_name() {
        let name = container_port_name();
        assert_eq!(name.len(), 11);
        assert!(name.starts_with(PORT_PREFIX));
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, container_port_name());
        assert!(is_container_port_name(&name));
        assert!(!is_container_port_name("ovs-br0"));
    }

    #[test]
    fn test_cluster_command_kinds() {
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        assert_eq!(ClusterCommand::Join(peer).kind(), "join");
        assert_eq!(ClusterCommand::Leave.kind(), "leave");
        assert_eq!(ClusterCommand::PeerUp(peer).kind(), "peer_up");
        assert_eq!(ClusterCommand::PeerDown(peer).kind(), "peer_down");
    }
}
