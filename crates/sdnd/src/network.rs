//! Networks as seen by this node: registry records plus the gateway port
//! each network gets on the integration bridge.

use ipnet::Ipv4Net;
use sdn_ipam::{Network, NetworkManager, DEFAULT_NETWORK};
use sdn_ovsdb::{is_tunnel_port_name, TopologyDriver};
use tracing::{info, instrument, warn};

use crate::command::is_container_port_name;
use crate::error::{SdnError, SdnResult};

#[derive(Clone)]
pub struct NetworkService {
    registry: NetworkManager,
    driver: TopologyDriver,
    bridge: String,
}

impl NetworkService {
    pub fn new(registry: NetworkManager, driver: TopologyDriver, bridge: impl Into<String>) -> Self {
        Self {
            registry,
            driver,
            bridge: bridge.into(),
        }
    }

    pub fn registry(&self) -> &NetworkManager {
        &self.registry
    }

    pub fn driver(&self) -> &TopologyDriver {
        &self.driver
    }

    /// Integration bridge name.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub async fn get(&self, name: &str) -> SdnResult<Network> {
        Ok(self.registry.get_network(name).await?)
    }

    pub async fn list(&self) -> SdnResult<Vec<Network>> {
        Ok(self.registry.list_networks().await?)
    }

    /// Creates `name` on `subnet` and provisions its gateway port.
    #[instrument(skip(self), fields(subnet = %subnet))]
    pub async fn create(&self, name: &str, subnet: Ipv4Net) -> SdnResult<Network> {
        self.check_name(name)?;
        let network = self.registry.create_network(name, subnet).await?;
        self.ensure_gateway_port(&network).await?;
        Ok(network)
    }

    /// Parses `subnet` and creates the network.
    pub async fn create_from_request(&self, name: &str, subnet: &str) -> SdnResult<Network> {
        self.check_name(name)?;
        let subnet: Ipv4Net = subnet
            .parse()
            .map_err(|e| SdnError::bad_request(format!("invalid subnet '{}': {}", subnet, e)))?;
        self.create(name, subnet).await
    }

    /// Returns network `name`, creating the default network on first use.
    pub async fn resolve(&self, name: &str) -> SdnResult<Network> {
        if name == DEFAULT_NETWORK {
            let network = self.registry.create_default_network().await?;
            self.ensure_gateway_port(&network).await?;
            return Ok(network);
        }
        self.get(name).await
    }

    /// Deletes `name`, its gateway port and its resource claims.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> SdnResult<Network> {
        let network = self.registry.get_network(name).await?;
        if self.owns_port_name(name) {
            if let Err(e) = self.driver.delete_port(&self.bridge, &network.name).await {
                warn!(network = name, error = %e, "Failed to remove gateway port");
            }
        } else {
            warn!(network = name, "Network name aliases another port, leaving it in place");
        }
        Ok(self.registry.delete_network(name).await?)
    }

    /// Gateway ports share the network's name, so a name must not alias the
    /// bridge's own port or a generated container or tunnel port.
    fn check_name(&self, name: &str) -> SdnResult<()> {
        if name.is_empty() {
            return Err(SdnError::bad_request("network name is empty"));
        }
        if !self.owns_port_name(name) {
            return Err(SdnError::bad_request(format!(
                "network name {} is reserved for switch ports",
                name
            )));
        }
        Ok(())
    }

    fn owns_port_name(&self, name: &str) -> bool {
        name != self.bridge && !is_container_port_name(name) && !is_tunnel_port_name(name)
    }

    async fn ensure_gateway_port(&self, network: &Network) -> SdnResult<()> {
        if self.driver.port_exists(&network.name).await? {
            return Ok(());
        }
        self.driver
            .add_internal_port(&self.bridge, &network.name, network.vlan_id)
            .await?;
        info!(
            network = %network.name,
            vlan_id = network.vlan_id,
            gateway = %network.gateway,
            "Provisioned gateway port"
        );
        Ok(())
    }
}
