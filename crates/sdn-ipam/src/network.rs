//! Cluster network registry.
//!
//! A network is a named subnet with a gateway address and a VLAN id, stored
//! as a JSON record in the `network` store. Creation claims a VLAN and the
//! gateway lease through the [`Allocator`], then publishes the record with a
//! create-only write so two nodes creating the same name converge on one
//! record.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::allocator::Allocator;
use crate::error::{IpamError, IpamResult};
use crate::store::{CasOutcome, KvStore};

/// Store holding network records keyed by name.
pub const NETWORK_STORE: &str = "network";

/// Name of the network used when a connection does not name one.
pub const DEFAULT_NETWORK: &str = "default";

/// Gateway candidates, tried in order when picking a free subnet.
pub const GATEWAY_ADDRS: &[&str] = &[
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "172.17.42.1/16",
    "10.0.42.1/16",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// A cluster-wide virtual L2 network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub subnet: Ipv4Net,
    pub gateway: Ipv4Addr,
    #[serde(rename = "vlanid")]
    pub vlan_id: u16,
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn parse_candidate(addr: &str) -> IpamResult<Ipv4Net> {
    addr.parse::<Ipv4Net>()
        .map_err(|e| IpamError::invalid_subnet(addr, e.to_string()))
}

/// Reads and writes network records and their resource claims.
#[derive(Clone)]
pub struct NetworkManager {
    allocator: Allocator,
}

impl NetworkManager {
    pub fn new(allocator: Allocator) -> Self {
        Self { allocator }
    }

    /// The allocator backing VLAN and gateway claims.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    fn store(&self) -> &Arc<dyn KvStore> {
        self.allocator.store()
    }

    /// Looks up a network by name.
    pub async fn get_network(&self, name: &str) -> IpamResult<Network> {
        match self.store().get(NETWORK_STORE, name).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(IpamError::NetworkNotFound(name.to_string())),
        }
    }

    /// Returns every registered network.
    pub async fn list_networks(&self) -> IpamResult<Vec<Network>> {
        self.store()
            .get_all(NETWORK_STORE)
            .await?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(IpamError::from))
            .collect()
    }

    /// First gateway candidate whose subnet is not used by a registered
    /// network.
    pub async fn available_subnet(&self) -> IpamResult<Ipv4Net> {
        let taken: Vec<Ipv4Net> = self
            .list_networks()
            .await?
            .into_iter()
            .map(|network| network.subnet)
            .collect();

        for addr in GATEWAY_ADDRS {
            let candidate = parse_candidate(addr)?.trunc();
            if !taken.iter().any(|used| overlaps(used, &candidate)) {
                return Ok(candidate);
            }
        }

        Err(IpamError::exhausted("subnet"))
    }

    /// Gateway CIDR for the integration bridge.
    ///
    /// A configured `bridge_ip` wins; otherwise the first candidate that
    /// does not overlap a registered network is used.
    pub async fn available_gateway(&self, bridge_ip: Option<&str>) -> IpamResult<Ipv4Net> {
        if let Some(bridge_ip) = bridge_ip.filter(|ip| !ip.is_empty()) {
            return parse_candidate(bridge_ip);
        }

        let taken: Vec<Ipv4Net> = self
            .list_networks()
            .await?
            .into_iter()
            .map(|network| network.subnet)
            .collect();

        for addr in GATEWAY_ADDRS {
            let candidate = parse_candidate(addr)?;
            if !taken.iter().any(|used| overlaps(used, &candidate.trunc())) {
                return Ok(candidate);
            }
        }

        Err(IpamError::exhausted("gateway"))
    }

    /// Creates `name` on `subnet`, or returns the existing record.
    #[instrument(skip(self), fields(subnet = %subnet))]
    pub async fn create_network(&self, name: &str, subnet: Ipv4Net) -> IpamResult<Network> {
        match self.get_network(name).await {
            Ok(existing) => return Ok(existing),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let subnet = subnet.trunc();
        let vlan_id = self.allocator.allocate_vlan().await?;
        let gateway = match self.allocator.allocate_ip(subnet).await {
            Ok(gateway) => gateway,
            Err(e) => {
                self.release_claims(vlan_id, None, subnet).await;
                return Err(e);
            }
        };

        let network = Network {
            name: name.to_string(),
            subnet,
            gateway,
            vlan_id,
        };
        let record = serde_json::to_vec(&network)?;

        match self.store().put(NETWORK_STORE, name, &record, None).await {
            Ok(CasOutcome::Applied) => {
                info!(name, vlan_id, %gateway, "Created network");
                Ok(network)
            }
            Ok(CasOutcome::Outdated) => {
                info!(name, "Network created concurrently, adopting existing record");
                self.release_claims(vlan_id, Some(gateway), subnet).await;
                self.get_network(name).await
            }
            Err(e) => {
                self.release_claims(vlan_id, Some(gateway), subnet).await;
                Err(e)
            }
        }
    }

    /// Creates the `default` network on the first free subnet.
    pub async fn create_default_network(&self) -> IpamResult<Network> {
        match self.get_network(DEFAULT_NETWORK).await {
            Ok(existing) => Ok(existing),
            Err(e) if e.is_not_found() => {
                let subnet = self.available_subnet().await?;
                self.create_network(DEFAULT_NETWORK, subnet).await
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes `name` and returns its resources to the pools.
    #[instrument(skip(self))]
    pub async fn delete_network(&self, name: &str) -> IpamResult<Network> {
        let network = self.get_network(name).await?;

        if !self.store().delete(NETWORK_STORE, name).await? {
            return Err(IpamError::NetworkNotFound(name.to_string()));
        }

        // The record is gone; a failed release only leaks the claim.
        self.release_claims(network.vlan_id, Some(network.gateway), network.subnet)
            .await;

        info!(name, vlan_id = network.vlan_id, "Deleted network");
        Ok(network)
    }

    async fn release_claims(&self, vlan_id: u16, gateway: Option<Ipv4Addr>, subnet: Ipv4Net) {
        if let Err(e) = self.allocator.release_vlan(vlan_id).await {
            warn!(vlan_id, error = %e, "Failed to release VLAN");
        }
        if let Some(gateway) = gateway {
            if let Err(e) = self.allocator.release_ip(gateway, subnet).await {
                warn!(%gateway, error = %e, "Failed to release gateway address");
            }
        }
    }
}
