//! Daemon assembly: wires the store, switch session, command core,
//! membership listener and control surface together.

use parking_lot::RwLock;
use sdn_ipam::{Allocator, KvStore, MemoryStore, NetworkManager, RedisStore};
use sdn_ovsdb::{Connector, OvsdbError, SwitchSession, TopologyDriver};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::api::{create_router, AppState};
use crate::config::{DaemonConfig, MEMORY_STORE};
use crate::command::{CommandCore, CoreHandle};
use crate::error::SdnResult;
use crate::membership::{spawn_membership_listener, ClusterAgent};
use crate::metrics::MetricsCollector;
use crate::network::NetworkService;

/// Opens the cluster store named by `store` ("memory" or a redis:// URL).
pub async fn open_store(store: &str) -> SdnResult<Arc<dyn KvStore>> {
    if store == MEMORY_STORE {
        info!("Using process-local cluster store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let redis = RedisStore::connect(store).await?;
    info!(store, "Using Redis cluster store");
    Ok(Arc::new(redis))
}

/// A running daemon.
pub struct Daemon {
    state: AppState,
    session: SwitchSession,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Brings every component up in dependency order. Blocks until the
    /// switch database is reachable.
    #[instrument(skip_all, fields(bridge = %config.bridge.bridge_name))]
    pub async fn start(
        config: &DaemonConfig,
        connector: &dyn Connector,
        store: Arc<dyn KvStore>,
        agent: Arc<dyn ClusterAgent>,
    ) -> SdnResult<Self> {
        let metrics = MetricsCollector::new()?;

        let session = SwitchSession::connect(connector, &config.switch.session()).await;
        let driver = TopologyDriver::new(session.clone());

        let bridge_name = config.bridge.bridge_name.clone();
        let bridge_uuid = driver.ensure_bridge(&bridge_name).await?;
        debug!(uuid = %bridge_uuid, "Integration bridge ready");

        let registry = NetworkManager::new(Allocator::new(store).with_retry(config.retry.policy()));
        let mut bridge = config.bridge.clone();
        let gateway = registry
            .available_gateway(Some(bridge.bridge_ip.as_str()))
            .await?;
        bridge.bridge_ip = gateway.addr().to_string();
        bridge.bridge_cidr = gateway.to_string();

        let shutdown = CancellationToken::new();
        let mut tasks = vec![
            driver.spawn_bridge_watch(bridge_name.clone()),
            spawn_session_guard(&session, shutdown.clone()),
        ];

        let networks = NetworkService::new(registry, driver, bridge_name);
        let (core, handle) = CommandCore::new(networks.clone(), agent.clone(), metrics.clone());
        tasks.push(core.spawn(shutdown.child_token()));
        tasks.push(spawn_membership_listener(
            agent.as_ref(),
            handle.clone(),
            shutdown.child_token(),
        ));

        info!(
            local = %agent.local_address(),
            gateway = %bridge.bridge_cidr,
            "Daemon started"
        );

        Ok(Self {
            state: AppState {
                core: handle,
                networks,
                bridge: Arc::new(RwLock::new(bridge)),
                metrics,
            },
            session,
            shutdown,
            tasks,
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn core(&self) -> &CoreHandle {
        &self.state.core
    }

    pub fn session(&self) -> &SwitchSession {
        &self.session
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves the control surface until shutdown. Fails if the switch
    /// session was lost, so the process exits and can be restarted.
    pub async fn serve(&self, listener: TcpListener) -> SdnResult<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Control surface listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        if self.session.is_closed() {
            return Err(OvsdbError::Closed.into());
        }
        Ok(())
    }

    /// Stops background tasks and closes the switch session.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.session.close();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Daemon stopped");
    }
}

/// Stops the daemon when the switch session closes on its own.
fn spawn_session_guard(session: &SwitchSession, shutdown: CancellationToken) -> JoinHandle<()> {
    let closed = session.closed();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = closed.cancelled() => {
                if !shutdown.is_cancelled() {
                    error!("Switch database session lost, stopping daemon");
                    shutdown.cancel();
                }
            }
        }
    })
}
