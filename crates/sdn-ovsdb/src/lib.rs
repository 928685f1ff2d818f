//! sdn-ovsdb - switch configuration database client and topology driver
//!
//! Talks JSON-RPC to the local Open vSwitch database, mirrors its tables
//! through a [`SwitchSession`] and provisions bridges, ports and VXLAN
//! tunnels through the [`TopologyDriver`].

mod cache;
mod client;
mod driver;
mod error;
#[cfg(any(test, feature = "mock"))]
mod mock;
pub mod model;
mod session;

pub use cache::TableCache;
pub use client::{
    Connection, Connector, Endpoint, JsonRpcClient, OvsdbTransport, UpdateStream, DEFAULT_ENDPOINT,
};
pub use driver::{
    check_replies, is_tunnel_port_name, tunnel_port_name, TopologyDriver, CONTEXT_KEY,
    CONTEXT_VALUE, TUNNEL_PORT_PREFIX,
};
pub use error::{OvsdbError, OvsdbResult};
#[cfg(any(test, feature = "mock"))]
pub use mock::MockSwitch;
pub use session::{SessionConfig, SwitchSession};
