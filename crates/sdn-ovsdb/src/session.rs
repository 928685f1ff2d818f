//! Switch session: one connection, its table mirror and the consumer loop.
//!
//! The session is the sole writer of the cache. Readers take the read lock
//! through [`SwitchSession::with_cache`], which never spans an await point.
//! Every applied batch is re-published on a broadcast channel so watchers see
//! changes only after the cache already reflects them.
//!
//! A session does not reconnect. When the server stops sending updates the
//! session closes itself and every later transaction fails with
//! [`OvsdbError::Closed`]; owners watch [`SwitchSession::closed`] and tear
//! down.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::TableCache;
use crate::client::{Connector, OvsdbTransport, UpdateStream};
use crate::error::{OvsdbError, OvsdbResult};
use crate::model::{Operation, OperationResult, TableUpdates};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed delay between connection attempts.
    pub retry_delay: Duration,
    /// Poll interval while waiting for the root row.
    pub root_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(2),
            root_poll_interval: Duration::from_secs(1),
        }
    }
}

/// A live connection to the local switch database.
#[derive(Clone)]
pub struct SwitchSession {
    transport: Arc<dyn OvsdbTransport>,
    cache: Arc<RwLock<TableCache>>,
    updates: broadcast::Sender<Arc<TableUpdates>>,
    shutdown: CancellationToken,
}

impl SwitchSession {
    /// Connects, retrying forever with a fixed delay, seeds the cache from a
    /// full snapshot and starts the change consumer.
    ///
    /// Returns once the root configuration row is mirrored.
    #[instrument(skip_all, fields(switch = %connector.describe()))]
    pub async fn connect(connector: &dyn Connector, config: &SessionConfig) -> Self {
        let mut attempt: u64 = 0;
        let session = loop {
            attempt += 1;
            match Self::try_connect(connector).await {
                Ok(session) => break session,
                Err(e) => {
                    warn!(attempt, error = %e, "Error connecting to switch database, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        };

        while session.with_cache(|cache| cache.root_uuid().is_none()) {
            debug!("Waiting for root configuration row");
            tokio::time::sleep(config.root_poll_interval).await;
        }

        info!("Connected to switch database");
        session
    }

    /// Single connection attempt.
    pub async fn try_connect(connector: &dyn Connector) -> OvsdbResult<Self> {
        let connection = connector.connect().await?;
        let snapshot = connection.transport.monitor_all().await?;

        let mut cache = TableCache::new();
        cache.apply(&snapshot);
        debug!(tables = snapshot.len(), "Seeded switch cache");

        Ok(Self::start(connection.transport, connection.updates, cache))
    }

    fn start(
        transport: Arc<dyn OvsdbTransport>,
        updates: UpdateStream,
        cache: TableCache,
    ) -> Self {
        let (tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let session = Self {
            transport,
            cache: Arc::new(RwLock::new(cache)),
            updates: tx,
            shutdown: CancellationToken::new(),
        };

        tokio::spawn(consume_updates(
            updates,
            session.cache.clone(),
            session.updates.clone(),
            session.shutdown.clone(),
        ));
        session
    }

    /// Runs one transaction.
    pub async fn transact(&self, ops: Vec<Operation>) -> OvsdbResult<Vec<OperationResult>> {
        if self.is_closed() {
            return Err(OvsdbError::Closed);
        }
        self.transport.transact(ops).await
    }

    /// Reads the cache under the lock.
    pub fn with_cache<R>(&self, f: impl FnOnce(&TableCache) -> R) -> R {
        f(&self.cache.read())
    }

    /// Batches applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TableUpdates>> {
        self.updates.subscribe()
    }

    /// Token cancelled when the session closes.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops the consumer and every watcher tied to the session.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Closing switch session");
            self.shutdown.cancel();
        }
    }
}

async fn consume_updates(
    mut updates: UpdateStream,
    cache: Arc<RwLock<TableCache>>,
    publish: broadcast::Sender<Arc<TableUpdates>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = updates.recv() => match batch {
                Some(batch) => {
                    cache.write().apply(&batch);
                    let _ = publish.send(Arc::new(batch));
                }
                None => {
                    warn!("Switch database stopped sending updates");
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
    debug!("Update consumer stopped");
}
