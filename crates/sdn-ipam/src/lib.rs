//! sdn-ipam - cluster-wide VLAN and IP address management
//!
//! Hands out unique VLAN ids and per-subnet IP addresses from bitmaps held in
//! a shared key-value store. There is no coordinator: every node updates the
//! bitmaps with a compare-and-swap on the full previous value and retries
//! when another node got there first.

mod allocator;
mod bitmap;
mod error;
mod network;
#[cfg(feature = "redis")]
mod redis_store;
mod retry;
mod store;

pub use allocator::*;
pub use bitmap::{byte_len, Bitmap};
pub use error::{IpamError, IpamResult};
pub use network::{Network, NetworkManager, DEFAULT_NETWORK, GATEWAY_ADDRS, NETWORK_STORE};
#[cfg(feature = "redis")]
pub use redis_store::{RedisStore, DEFAULT_KEY_PREFIX};
pub use retry::RetryPolicy;
pub use store::{CasOutcome, KvStore, MemoryStore};
