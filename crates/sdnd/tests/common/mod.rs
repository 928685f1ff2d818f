//! Shared harness: a daemon running against the in-memory store and the
//! mock switch.

#![allow(dead_code)]

use sdn_ipam::MemoryStore;
use sdn_ovsdb::MockSwitch;
use sdnd::config::RetryConfig;
use sdnd::{Daemon, DaemonConfig, StaticMembership};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 1);
pub const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 2);

pub struct TestDaemon {
    pub daemon: Daemon,
    pub switch: MockSwitch,
    pub agent: Arc<StaticMembership>,
    pub store: Arc<MemoryStore>,
}

pub fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.switch.retry_delay_ms = 5;
    config.switch.root_poll_ms = 5;
    config.retry = RetryConfig {
        max_attempts: 16,
        base_delay_ms: 0,
        max_delay_ms: 0,
    };
    config.advertise = Some(LOCAL);
    config
}

impl TestDaemon {
    pub async fn start() -> Self {
        let switch = MockSwitch::new();
        let store = Arc::new(MemoryStore::new());
        let agent = Arc::new(StaticMembership::new(LOCAL));

        let daemon = Daemon::start(&test_config(), &switch, store.clone(), agent.clone())
            .await
            .expect("daemon starts");

        Self {
            daemon,
            switch,
            agent,
            store,
        }
    }
}

/// Polls `pred` until it holds or a second has passed.
pub async fn eventually(pred: impl Fn() -> bool) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
