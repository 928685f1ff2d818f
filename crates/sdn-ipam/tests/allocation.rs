//! Allocation behaviour under concurrent writers sharing one store.

use ipnet::Ipv4Net;
use sdn_ipam::{
    Allocator, Bitmap, KvStore, MemoryStore, NetworkManager, RetryPolicy, VLAN_COUNT, VLAN_KEY,
    VLAN_STORE,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn shared_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// One allocator per simulated node, all over the same store.
fn node(store: &Arc<MemoryStore>) -> Allocator {
    let store: Arc<dyn KvStore> = store.clone();
    Allocator::new(store).with_retry(RetryPolicy::default().with_max_attempts(10_000))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_vlan_allocations_are_unique() {
    let store = shared_store();
    let n = 200;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let alloc = node(&store);
            tokio::spawn(async move { alloc.allocate_vlan().await })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        let id = handle.await.unwrap().unwrap();
        assert!((1..=VLAN_COUNT as u16).contains(&id));
        assert!(ids.insert(id), "VLAN {} handed out twice", id);
    }
    assert_eq!(ids.len(), n);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ip_allocations_are_unique() {
    let store = shared_store();
    let subnet: Ipv4Net = "10.1.0.0/24".parse().unwrap();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let alloc = node(&store);
            tokio::spawn(async move { alloc.allocate_ip(subnet).await })
        })
        .collect();

    let mut addrs = HashSet::new();
    for handle in handles {
        let addr = handle.await.unwrap().unwrap();
        assert!(subnet.contains(&addr));
        assert_ne!(addr, subnet.network());
        assert_ne!(addr, subnet.broadcast());
        assert!(addrs.insert(addr));
    }
}

#[tokio::test]
async fn full_vlan_pool_reports_exhaustion_and_reuses_released_id() {
    let store = shared_store();
    let alloc = node(&store);

    for expected in 1..=VLAN_COUNT as u16 {
        assert_eq!(alloc.allocate_vlan().await.unwrap(), expected);
    }
    assert!(alloc.allocate_vlan().await.unwrap_err().is_exhaustion());

    alloc.release_vlan(1234).await.unwrap();
    assert_eq!(alloc.allocate_vlan().await.unwrap(), 1234);
    assert!(alloc.allocate_vlan().await.unwrap_err().is_exhaustion());
}

#[tokio::test]
async fn ip_round_trip_returns_same_address() {
    let store = shared_store();
    let alloc = node(&store);
    let subnet: Ipv4Net = "10.1.0.0/24".parse().unwrap();

    let first = alloc.allocate_ip(subnet).await.unwrap();
    assert_eq!(first, Ipv4Addr::new(10, 1, 0, 1));

    assert!(alloc.release_ip(first, subnet).await.unwrap());
    assert_eq!(alloc.allocate_ip(subnet).await.unwrap(), first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_network_creation_converges() {
    let store = shared_store();
    let subnet: Ipv4Net = "10.7.0.0/24".parse().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let mgr = NetworkManager::new(node(&store));
            tokio::spawn(async move { mgr.create_network("shared", subnet).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));

    let mgr = NetworkManager::new(node(&store));
    assert_eq!(mgr.list_networks().await.unwrap().len(), 1);

    // Losing creators handed their VLAN back.
    let mut vlans = store.get(VLAN_STORE, VLAN_KEY).await.unwrap().unwrap();
    let bitmap = Bitmap::new(&mut vlans, VLAN_COUNT);
    assert_eq!(bitmap.count_set(), 1);
    assert!(bitmap.is_set(usize::from(results[0].vlan_id) - 1));
}
