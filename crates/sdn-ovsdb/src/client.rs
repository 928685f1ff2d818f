//! JSON-RPC client for the switch configuration database.
//!
//! OVSDB speaks JSON-RPC 1.0 over a stream socket with no framing: messages
//! are concatenated JSON objects. The reader task splits the byte stream
//! with `serde_json`'s streaming deserializer, completes pending requests by
//! id, answers server `echo` requests and forwards `update` notifications.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{OvsdbError, OvsdbResult};
use crate::model::{Operation, OperationResult, TableUpdates, DATABASE};

/// Default switch endpoint.
pub const DEFAULT_ENDPOINT: &str = "tcp:127.0.0.1:6640";

/// Monitor id used for the session-wide subscription.
const MONITOR_ID: &str = "sdn";

const READ_CHUNK: usize = 16 * 1024;

/// Stream of change batches pushed by the server.
pub type UpdateStream = mpsc::UnboundedReceiver<TableUpdates>;

/// Transactional channel to the switch database.
#[async_trait]
pub trait OvsdbTransport: Send + Sync {
    /// Runs `ops` as one atomic transaction and returns one reply per
    /// executed statement.
    async fn transact(&self, ops: Vec<Operation>) -> OvsdbResult<Vec<OperationResult>>;

    /// Subscribes to every table and returns the current contents.
    async fn monitor_all(&self) -> OvsdbResult<TableUpdates>;
}

/// An open channel plus the notifications it will deliver.
pub struct Connection {
    pub transport: Arc<dyn OvsdbTransport>,
    pub updates: UpdateStream,
}

/// Something that can open a [`Connection`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> OvsdbResult<Connection>;

    /// Human readable target for logs.
    fn describe(&self) -> String;
}

/// Where the database server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `tcp:HOST:PORT`
    Tcp(String),
    /// `unix:PATH`
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp("127.0.0.1:6640".to_string())
    }
}

impl FromStr for Endpoint {
    type Err = OvsdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("tcp", addr)) if addr.contains(':') => Ok(Endpoint::Tcp(addr.to_string())),
            Some(("unix", path)) if !path.is_empty() => Ok(Endpoint::Unix(PathBuf::from(path))),
            _ => Err(OvsdbError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[async_trait]
impl Connector for Endpoint {
    async fn connect(&self) -> OvsdbResult<Connection> {
        let (client, updates) = JsonRpcClient::connect(self).await?;
        Ok(Connection {
            transport: Arc::new(client),
            updates,
        })
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<OvsdbResult<Value>>>>>;

/// JSON-RPC connection to an OVSDB server.
pub struct JsonRpcClient {
    writer: Arc<tokio::sync::Mutex<Writer>>,
    pending: Pending,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl JsonRpcClient {
    /// Dials `endpoint` and starts the reader task.
    #[instrument(skip(endpoint), fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint) -> OvsdbResult<(Self, UpdateStream)> {
        let (reader, writer): (Reader, Writer) = match endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| OvsdbError::connection(endpoint.to_string(), e.to_string()))?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| OvsdbError::connection(endpoint.to_string(), e.to_string()))?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        debug!("Connected to switch database");
        Ok(Self::from_parts(reader, writer))
    }

    /// Builds a client over an already established byte stream.
    pub fn from_parts(reader: Reader, writer: Writer) -> (Self, UpdateStream) {
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let task = ReaderTask {
            writer: writer.clone(),
            pending: pending.clone(),
            updates: updates_tx,
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = task.run(reader) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Switch database connection lost");
                    }
                }
            }
            token.cancel();
        });

        let client = Self {
            writer,
            pending,
            next_id: AtomicU64::new(1),
            shutdown,
        };
        (client, updates_rx)
    }

    /// Sends a request and waits for the matching response.
    pub async fn call(&self, method: &str, params: Value) -> OvsdbResult<Value> {
        if self.shutdown.is_cancelled() {
            return Err(OvsdbError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let request = json!({"method": method, "params": params, "id": id});
        trace!(id, method, "Sending request");
        if let Err(e) = write_message(&self.writer, &request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        tokio::select! {
            biased;
            reply = rx => match reply {
                Ok(result) => result.map_err(|e| match e {
                    OvsdbError::Rpc { message, .. } => OvsdbError::rpc(method, message),
                    other => other,
                }),
                Err(_) => Err(OvsdbError::Closed),
            },
            _ = self.shutdown.cancelled() => {
                self.pending.lock().remove(&id);
                Err(OvsdbError::Closed)
            }
        }
    }

    /// Table names of the database schema.
    pub async fn table_names(&self) -> OvsdbResult<Vec<String>> {
        let schema = self.call("get_schema", json!([DATABASE])).await?;
        let tables = schema
            .get("tables")
            .and_then(Value::as_object)
            .ok_or_else(|| OvsdbError::rpc("get_schema", "schema without tables"))?;
        Ok(tables.keys().cloned().collect())
    }

    /// Stops the reader task and fails outstanding requests.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.pending.lock().clear();
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl OvsdbTransport for JsonRpcClient {
    async fn transact(&self, ops: Vec<Operation>) -> OvsdbResult<Vec<OperationResult>> {
        let mut params = vec![json!(DATABASE)];
        for op in &ops {
            params.push(serde_json::to_value(op)?);
        }

        let result = self.call("transact", Value::Array(params)).await?;
        let replies: Vec<Option<OperationResult>> = serde_json::from_value(result)?;
        Ok(replies.into_iter().map(Option::unwrap_or_default).collect())
    }

    async fn monitor_all(&self) -> OvsdbResult<TableUpdates> {
        let requests: serde_json::Map<String, Value> = self
            .table_names()
            .await?
            .into_iter()
            .map(|table| (table, json!({})))
            .collect();

        let result = self
            .call("monitor", json!([DATABASE, MONITOR_ID, requests]))
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

async fn write_message(writer: &tokio::sync::Mutex<Writer>, message: &Value) -> OvsdbResult<()> {
    let bytes = serde_json::to_vec(message)?;
    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

struct ReaderTask {
    writer: Arc<tokio::sync::Mutex<Writer>>,
    pending: Pending,
    updates: mpsc::UnboundedSender<TableUpdates>,
}

impl ReaderTask {
    async fn run(self, mut reader: Reader) -> OvsdbResult<()> {
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                self.pending.lock().clear();
                return Err(OvsdbError::Closed);
            }
            buf.extend_from_slice(&chunk[..n]);

            for message in split_messages(&mut buf)? {
                self.dispatch(message).await?;
            }
        }
    }

    async fn dispatch(&self, message: Value) -> OvsdbResult<()> {
        match message.get("method").and_then(Value::as_str) {
            Some("echo") => {
                let reply = json!({
                    "id": message.get("id").cloned().unwrap_or(Value::Null),
                    "result": message.get("params").cloned().unwrap_or(Value::Null),
                    "error": Value::Null,
                });
                write_message(&self.writer, &reply).await
            }
            Some("update") => {
                let updates = message
                    .get("params")
                    .and_then(|params| params.get(1))
                    .cloned()
                    .unwrap_or(Value::Null);
                match serde_json::from_value::<TableUpdates>(updates) {
                    Ok(updates) => {
                        let _ = self.updates.send(updates);
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed update notification"),
                }
                Ok(())
            }
            Some(other) => {
                debug!(method = other, "Ignoring server notification");
                Ok(())
            }
            None => {
                let Some(id) = message.get("id").and_then(Value::as_u64) else {
                    debug!("Ignoring response without numeric id");
                    return Ok(());
                };
                let Some(tx) = self.pending.lock().remove(&id) else {
                    debug!(id, "Response for unknown request");
                    return Ok(());
                };

                let error = message.get("error").filter(|e| !e.is_null());
                let result = match error {
                    Some(error) => Err(OvsdbError::rpc("", error.to_string())),
                    None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
                Ok(())
            }
        }
    }
}

/// Pops every complete JSON value from the front of `buf`.
fn split_messages(buf: &mut Vec<u8>) -> OvsdbResult<Vec<Value>> {
    let mut messages = Vec::new();
    let mut consumed = 0;

    {
        let mut stream = serde_json::Deserializer::from_slice(buf.as_slice()).into_iter::<Value>();
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    consumed = stream.byte_offset();
                    messages.push(value);
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
    }

    buf.drain(..consumed);
    Ok(messages)
}
