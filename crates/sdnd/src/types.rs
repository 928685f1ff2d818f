//! Wire types shared by the command core and the control surface.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Connections keyed by container id.
pub type ConnectionMap = HashMap<String, Connection>;

/// Switch-side detail of a container attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OvsConnection {
    pub name: String,
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Net,
    pub mac: String,
    pub gateway: Ipv4Addr,
}

/// A container attached to a network through a switch port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "containerID")]
    pub container_id: String,
    #[serde(rename = "containerName", default)]
    pub container_name: String,
    #[serde(rename = "containerPID", default)]
    pub container_pid: String,
    /// Target network; empty selects the default network.
    #[serde(default)]
    pub network: String,
    #[serde(rename = "ovsPortID", default)]
    pub ovs_port_id: String,
    #[serde(rename = "ovs_connectionDetails", default)]
    pub connection_detail: Option<OvsConnection>,
}

impl Connection {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Self::default()
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }
}

/// Locally administered MAC derived from the container address.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

/// Request body of `POST /network`.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkRequest {
    pub name: String,
    #[serde(default)]
    pub subnet: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_mac_for_ip() {
        assert_eq!(mac_for_ip(Ipv4Addr::new(10, 1, 0, 2)), "02:42:0a:01:00:02");
        assert_eq!(mac_for_ip(Ipv4Addr::new(172, 16, 42, 255)), "02:42:ac:10:2a:ff");
    }

    #[test]
    fn test_connection_request_without_network() {
        let conn: Connection = serde_json::from_value(json!({
            "containerID": "c1",
            "containerName": "web",
            "containerPID": "4242"
        }))
        .unwrap();

        assert_eq!(conn.container_id, "c1");
        assert_eq!(conn.network, "");
        assert!(conn.connection_detail.is_none());
    }

    #[test]
    fn test_connection_json_keys() {
        let conn = Connection {
            container_id: "c1".to_string(),
            container_name: "web".to_string(),
            container_pid: "4242".to_string(),
            network: "default".to_string(),
            ovs_port_id: "ovs1a2b3c4d".to_string(),
            connection_detail: Some(OvsConnection {
                name: "ovs1a2b3c4d".to_string(),
                ip: Ipv4Addr::new(10, 1, 0, 2),
                subnet: "10.1.0.0/16".parse().unwrap(),
                mac: "02:42:0a:01:00:02".to_string(),
                gateway: Ipv4Addr::new(10, 1, 0, 1),
            }),
        };

        let value = serde_json::to_value(&conn).unwrap();
        assert_eq!(value["containerID"], "c1");
        assert_eq!(value["ovsPortID"], "ovs1a2b3c4d");
        assert_eq!(value["ovs_connectionDetails"]["subnet"], "10.1.0.0/16");
        assert_eq!(value["ovs_connectionDetails"]["ip"], "10.1.0.2");
    }
}
