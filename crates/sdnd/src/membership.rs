//! Cluster membership.
//!
//! A [`ClusterAgent`] joins and leaves the cluster and reports peers coming
//! and going. The membership listener turns those reports into peer-up and
//! peer-down commands for the command core.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::CoreHandle;
use crate::error::SdnResult;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A membership change reported by the cluster agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(Ipv4Addr),
    Left(Ipv4Addr),
}

/// Membership substrate the daemon is linked against.
#[async_trait]
pub trait ClusterAgent: Send + Sync {
    /// Joins the cluster through the node at `address`.
    async fn join(&self, address: Ipv4Addr) -> SdnResult<()>;

    /// Leaves the cluster.
    async fn leave(&self) -> SdnResult<()>;

    /// Address this node is known by.
    fn local_address(&self) -> Ipv4Addr;

    /// Membership changes from now on.
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Membership built from explicit join requests, for deployments without a
/// gossip layer.
pub struct StaticMembership {
    local: Ipv4Addr,
    peers: Mutex<BTreeSet<Ipv4Addr>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(local: Ipv4Addr) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            peers: Mutex::new(BTreeSet::new()),
            events,
        }
    }

    /// Known peers, in address order.
    pub fn peers(&self) -> Vec<Ipv4Addr> {
        self.peers.lock().iter().copied().collect()
    }
}

#[async_trait]
impl ClusterAgent for StaticMembership {
    async fn join(&self, address: Ipv4Addr) -> SdnResult<()> {
        if !self.peers.lock().insert(address) {
            debug!(%address, "Peer already known");
            return Ok(());
        }
        info!(%address, "Node joined");
        let _ = self.events.send(MembershipEvent::Joined(address));
        Ok(())
    }

    async fn leave(&self) -> SdnResult<()> {
        let peers = std::mem::take(&mut *self.peers.lock());
        info!(peers = peers.len(), "Leaving cluster");
        for address in peers {
            let _ = self.events.send(MembershipEvent::Left(address));
        }
        Ok(())
    }

    fn local_address(&self) -> Ipv4Addr {
        self.local
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}

/// Forwards membership events to the command core until `shutdown` fires.
pub fn spawn_membership_listener(
    agent: &dyn ClusterAgent,
    core: CoreHandle,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut events = agent.subscribe();

    tokio::spawn(async move {
        debug!("Membership listener started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            let forwarded = match event {
                Ok(MembershipEvent::Joined(peer)) => core.peer_up(peer).await,
                Ok(MembershipEvent::Left(peer)) => core.peer_down(peer).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership listener lagged behind events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if let Err(e) = forwarded {
                warn!(error = %e, "Command core stopped, membership listener exiting");
                break;
            }
        }
        debug!("Membership listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_join_announces_new_peers_once() {
        let agent = StaticMembership::new(Ipv4Addr::new(10, 0, 0, 1));
        let mut events = agent.subscribe();
        let peer = Ipv4Addr::new(10, 0, 0, 2);

        agent.join(peer).await.unwrap();
        agent.join(peer).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Joined(peer));
        assert!(events.try_recv().is_err());
        assert_eq!(agent.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_leave_reports_every_peer() {
        let agent = StaticMembership::new(Ipv4Addr::new(10, 0, 0, 1));
        let a = Ipv4Addr::new(10, 0, 0, 2);
        let b = Ipv4Addr::new(10, 0, 0, 3);
        agent.join(b).await.unwrap();
        agent.join(a).await.unwrap();

        let mut events = agent.subscribe();
        agent.leave().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(a));
        assert_eq!(events.recv().await.unwrap(), MembershipEvent::Left(b));
        assert!(agent.peers().is_empty());
    }

    #[test]
    fn test_local_address() {
        let agent = StaticMembership::new(Ipv4Addr::new(192, 168, 7, 9));
        assert_eq!(agent.local_address(), Ipv4Addr::new(192, 168, 7, 9));

        // Joining self is announced like any other node.
        tokio_test::block_on(agent.join(agent.local_address())).unwrap();
        assert_eq!(agent.peers(), vec![Ipv4Addr::new(192, 168, 7, 9)]);
    }
}
