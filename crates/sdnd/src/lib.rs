//! sdnd - SDN control-plane daemon
//!
//! Attaches containers to cluster-wide virtual networks. Each network gets a
//! VLAN and a subnet from the shared allocator, container ports are created
//! on the local integration bridge, and every node in the cluster is joined
//! by a full mesh of VXLAN tunnels.
//!
//! # Architecture
//!
//! ```text
//!  HTTP ──▶ CoreHandle ──▶ CommandCore ──▶ NetworkService ──▶ sdn-ipam (cluster store)
//!                              ▲                  │
//!  ClusterAgent ──▶ listener ──┘                  └──────────▶ sdn-ovsdb (local switch)
//! ```

pub mod api;
pub mod command;
pub mod config;
pub mod daemon;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod types;

pub use api::{create_router, AppState, VERSION};
pub use command::{ClusterCommand, CommandCore, CoreHandle, NetworkAction, NetworkCommand};
pub use config::{Args, BridgeConf, DaemonConfig};
pub use daemon::{open_store, Daemon};
pub use error::{SdnError, SdnResult};
pub use membership::{spawn_membership_listener, ClusterAgent, MembershipEvent, StaticMembership};
pub use metrics::MetricsCollector;
pub use network::NetworkService;
pub use types::{Connection, ConnectionMap, OvsConnection};
