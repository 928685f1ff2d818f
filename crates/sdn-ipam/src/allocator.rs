//! Lock-free VLAN and IP allocation over shared bitmaps.
//!
//! Every pool is a single record in the cluster store. An allocation reads
//! the record, flips a bit locally and writes the result back conditioned on
//! the exact bytes it read. Losing the race means someone else changed the
//! pool, so the whole read-modify-write starts over.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::bitmap::{byte_len, Bitmap};
use crate::error::{IpamError, IpamResult};
use crate::retry::RetryPolicy;
use crate::store::{CasOutcome, KvStore};

/// Store holding the VLAN pool.
pub const VLAN_STORE: &str = "vlan";

/// Key of the single VLAN pool record.
pub const VLAN_KEY: &str = "vlan";

/// Store holding one IP pool per subnet.
pub const IP_STORE: &str = "ip";

/// Size of the VLAN pool. Bit `i` stands for VLAN `i + 1`.
pub const VLAN_COUNT: usize = 4096;

/// Smallest prefix accepted for an IP pool.
pub const MIN_PREFIX_LEN: u8 = 8;

/// Number of leasable host addresses in `subnet` (network and broadcast
/// excluded).
pub fn usable_hosts(subnet: &Ipv4Net) -> usize {
    let host_bits = 32 - u32::from(subnet.prefix_len());
    if host_bits < 2 {
        0
    } else {
        (1usize << host_bits) - 2
    }
}

/// Canonical pool key of a subnet, e.g. `10.1.0.0/24`.
pub fn pool_key(subnet: &Ipv4Net) -> String {
    subnet.trunc().to_string()
}

/// Address leased by bit `index` of the pool of `subnet`.
pub fn offset_to_addr(subnet: &Ipv4Net, index: usize) -> Ipv4Addr {
    let base = u32::from(subnet.network());
    Ipv4Addr::from(base.wrapping_add(index as u32).wrapping_add(1))
}

/// Bit index of `addr` in the pool of `subnet`.
pub fn addr_to_offset(subnet: &Ipv4Net, addr: Ipv4Addr) -> IpamResult<usize> {
    let base = u32::from(subnet.network());
    let value = u32::from(addr);
    let out_of_range = || IpamError::AddressOutOfRange {
        addr,
        subnet: pool_key(subnet),
    };

    if value <= base {
        return Err(out_of_range());
    }
    let index = (value - base - 1) as usize;
    if index >= usable_hosts(subnet) {
        return Err(out_of_range());
    }
    Ok(index)
}

/// Cluster resource allocator.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn KvStore>,
    retry: RetryPolicy,
}

impl Allocator {
    /// Creates an allocator over `store` with the default retry policy.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Claims the lowest free VLAN id in `1..=4096`.
    #[instrument(skip(self))]
    pub async fn allocate_vlan(&self) -> IpamResult<u16> {
        let index = self
            .update_pool(VLAN_STORE, VLAN_KEY, VLAN_COUNT, true, |bitmap| {
                bitmap
                    .test_and_set()
                    .ok_or_else(|| IpamError::exhausted("vlan"))
            })
            .await?
            .ok_or_else(|| IpamError::exhausted("vlan"))?;

        let vlan_id = (index + 1) as u16;
        info!(vlan_id, "Allocated VLAN");
        Ok(vlan_id)
    }

    /// Returns `vlan_id` to the pool. Releasing a free id is not an error.
    #[instrument(skip(self))]
    pub async fn release_vlan(&self, vlan_id: u16) -> IpamResult<()> {
        if vlan_id == 0 || usize::from(vlan_id) > VLAN_COUNT {
            return Err(IpamError::VlanOutOfRange(u32::from(vlan_id)));
        }

        let index = usize::from(vlan_id) - 1;
        self.update_pool(VLAN_STORE, VLAN_KEY, VLAN_COUNT, false, |bitmap| {
            bitmap.clear(index);
            Ok(())
        })
        .await?;

        info!(vlan_id, "Released VLAN");
        Ok(())
    }

    /// Leases the lowest free address of `subnet`.
    #[instrument(skip(self), fields(subnet = %subnet))]
    pub async fn allocate_ip(&self, subnet: Ipv4Net) -> IpamResult<Ipv4Addr> {
        let subnet = subnet.trunc();
        let key = pool_key(&subnet);
        if subnet.prefix_len() < MIN_PREFIX_LEN {
            return Err(IpamError::invalid_subnet(key, "subnet too large for an IP pool"));
        }

        let capacity = usable_hosts(&subnet);
        if capacity == 0 {
            return Err(IpamError::exhausted(key));
        }

        let index = self
            .update_pool(IP_STORE, &key, capacity, true, |bitmap| {
                bitmap
                    .test_and_set()
                    .ok_or_else(|| IpamError::exhausted(key.clone()))
            })
            .await?
            .ok_or_else(|| IpamError::exhausted(key.clone()))?;

        let addr = offset_to_addr(&subnet, index);
        info!(%addr, "Leased address");
        Ok(addr)
    }

    /// Returns `addr` to the pool of `subnet`.
    ///
    /// Returns `false` if the subnet has no pool record yet.
    #[instrument(skip(self), fields(subnet = %subnet))]
    pub async fn release_ip(&self, addr: Ipv4Addr, subnet: Ipv4Net) -> IpamResult<bool> {
        let subnet = subnet.trunc();
        let index = addr_to_offset(&subnet, addr)?;
        let capacity = usable_hosts(&subnet);

        let released = self
            .update_pool(IP_STORE, &pool_key(&subnet), capacity, false, |bitmap| {
                bitmap.clear(index);
                Ok(())
            })
            .await?
            .is_some();

        if released {
            info!(%addr, "Released address");
        }
        Ok(released)
    }

    /// Read-modify-CAS loop shared by all pools.
    ///
    /// Returns `Ok(None)` when the record is missing and `create` is false.
    async fn update_pool<T>(
        &self,
        store: &str,
        key: &str,
        capacity: usize,
        create: bool,
        mut apply: impl FnMut(&mut Bitmap<'_>) -> IpamResult<T>,
    ) -> IpamResult<Option<T>> {
        let len = byte_len(capacity);

        for attempt in 0..self.retry.max_attempts {
            let current = self.store.get(store, key).await?;
            let mut next = match &current {
                Some(bytes) => bytes.clone(),
                None if create => Vec::new(),
                None => return Ok(None),
            };
            if next.len() < len {
                next.resize(len, 0);
            }

            let outcome = {
                let mut bitmap = Bitmap::new(&mut next, capacity);
                apply(&mut bitmap)?
            };

            if current.as_deref() == Some(next.as_slice()) {
                return Ok(Some(outcome));
            }

            match self.store.put(store, key, &next, current.as_deref()).await? {
                CasOutcome::Applied => return Ok(Some(outcome)),
                CasOutcome::Outdated => {
                    debug!(store, key, attempt, "Pool changed concurrently, retrying");
                    let delay = self.retry.backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    } else {
                        tokio::task::yield_now().await;
                    }
                }
            }
        }

        Err(IpamError::Contention {
            store: store.to_string(),
            key: key.to_string(),
            attempts: self.retry.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn allocator() -> Allocator {
        Allocator::new(Arc::new(MemoryStore::new())).with_retry(RetryPolicy::immediate(16))
    }

    fn subnet(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_usable_hosts() {
        assert_eq!(usable_hosts(&subnet("10.1.0.0/24")), 254);
        assert_eq!(usable_hosts(&subnet("10.1.0.0/16")), 65534);
        assert_eq!(usable_hosts(&subnet("10.1.0.0/30")), 2);
        assert_eq!(usable_hosts(&subnet("10.1.0.0/31")), 0);
        assert_eq!(usable_hosts(&subnet("10.1.0.1/32")), 0);
    }

    #[test]
    fn test_offset_mapping() {
        let net = subnet("10.1.0.0/24");
        assert_eq!(offset_to_addr(&net, 0), Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(addr_to_offset(&net, Ipv4Addr::new(10, 1, 0, 1)).unwrap(), 0);
        assert_eq!(addr_to_offset(&net, Ipv4Addr::new(10, 1, 0, 254)).unwrap(), 253);
        assert!(addr_to_offset(&net, Ipv4Addr::new(10, 1, 0, 0)).is_err());
        assert!(addr_to_offset(&net, Ipv4Addr::new(10, 1, 0, 255)).is_err());
        assert!(addr_to_offset(&net, Ipv4Addr::new(10, 2, 0, 1)).is_err());
    }

    #[test]
    fn test_pool_key_is_canonical() {
        assert_eq!(pool_key(&subnet("10.1.42.1/16")), "10.1.0.0/16");
    }

    #[tokio::test]
    async fn test_vlan_allocation_is_sequential() {
        let alloc = allocator();
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 1);
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 2);
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_vlan_release_then_reallocate() {
        let alloc = allocator();
        for _ in 0..5 {
            alloc.allocate_vlan().await.unwrap();
        }
        alloc.release_vlan(2).await.unwrap();
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 2);
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_vlan_release_is_idempotent() {
        let alloc = allocator();
        alloc.release_vlan(7).await.unwrap();
        alloc.allocate_vlan().await.unwrap();
        alloc.release_vlan(1).await.unwrap();
        alloc.release_vlan(1).await.unwrap();
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vlan_release_rejects_out_of_range() {
        let alloc = allocator();
        assert!(matches!(
            alloc.release_vlan(0).await,
            Err(IpamError::VlanOutOfRange(0))
        ));
        assert!(alloc.release_vlan(4097).await.is_err());
    }

    #[tokio::test]
    async fn test_vlan_pool_exhaustion() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(VLAN_STORE, VLAN_KEY, &[0xFF; VLAN_COUNT / 8], None)
            .await
            .unwrap();
        let alloc = Allocator::new(store.clone()).with_retry(RetryPolicy::immediate(4));

        let err = alloc.allocate_vlan().await.unwrap_err();
        assert!(err.is_exhaustion());

        alloc.release_vlan(4096).await.unwrap();
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 4096);
        assert!(alloc.allocate_vlan().await.unwrap_err().is_exhaustion());
    }

    #[tokio::test]
    async fn test_ip_allocation_round_trip() {
        let alloc = allocator();
        let net = subnet("10.1.0.0/24");

        let first = alloc.allocate_ip(net).await.unwrap();
        assert_eq!(first, Ipv4Addr::new(10, 1, 0, 1));

        assert!(alloc.release_ip(first, net).await.unwrap());
        assert_eq!(alloc.allocate_ip(net).await.unwrap(), first);
        assert_eq!(alloc.allocate_ip(net).await.unwrap(), Ipv4Addr::new(10, 1, 0, 2));
    }

    #[tokio::test]
    async fn test_ip_release_without_pool_returns_false() {
        let alloc = allocator();
        let net = subnet("10.9.0.0/24");
        assert!(!alloc
            .release_ip(Ipv4Addr::new(10, 9, 0, 5), net)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ip_pool_exhaustion() {
        let alloc = allocator();
        let net = subnet("192.168.7.0/30");

        assert_eq!(alloc.allocate_ip(net).await.unwrap(), Ipv4Addr::new(192, 168, 7, 1));
        assert_eq!(alloc.allocate_ip(net).await.unwrap(), Ipv4Addr::new(192, 168, 7, 2));
        assert!(alloc.allocate_ip(net).await.unwrap_err().is_exhaustion());
        assert!(alloc
            .allocate_ip(subnet("192.168.7.9/32"))
            .await
            .unwrap_err()
            .is_exhaustion());
    }

    #[tokio::test]
    async fn test_ip_pools_are_per_subnet() {
        let alloc = allocator();
        let a = alloc.allocate_ip(subnet("10.1.0.0/24")).await.unwrap();
        let b = alloc.allocate_ip(subnet("10.2.0.0/24")).await.unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(b, Ipv4Addr::new(10, 2, 0, 1));
    }

    /// Store whose first `conflicts` conditional writes are rejected.
    struct ConflictingStore {
        inner: MemoryStore,
        conflicts: Mutex<u32>,
    }

    #[async_trait]
    impl KvStore for ConflictingStore {
        async fn get(&self, store: &str, key: &str) -> IpamResult<Option<Vec<u8>>> {
            self.inner.get(store, key).await
        }

        async fn get_all(&self, store: &str) -> IpamResult<Vec<Vec<u8>>> {
            self.inner.get_all(store).await
        }

        async fn put(
            &self,
            store: &str,
            key: &str,
            value: &[u8],
            expected: Option<&[u8]>,
        ) -> IpamResult<CasOutcome> {
            {
                let mut conflicts = self.conflicts.lock();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Ok(CasOutcome::Outdated);
                }
            }
            self.inner.put(store, key, value, expected).await
        }

        async fn delete(&self, store: &str, key: &str) -> IpamResult<bool> {
            self.inner.delete(store, key).await
        }
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_transparently() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            conflicts: Mutex::new(3),
        });
        let alloc = Allocator::new(store).with_retry(RetryPolicy::immediate(8));
        assert_eq!(alloc.allocate_vlan().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contention_bound_surfaces_error() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            conflicts: Mutex::new(100),
        });
        let alloc = Allocator::new(store).with_retry(RetryPolicy::immediate(5));

        match alloc.allocate_vlan().await {
            Err(IpamError::Contention { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected contention error, got {:?}", other),
        }
    }
}
