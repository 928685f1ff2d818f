//! Error types for the switch database client and topology driver.

use thiserror::Error;

/// Result type alias for switch database operations.
pub type OvsdbResult<T> = Result<T, OvsdbError>;

/// Errors raised while talking to the switch configuration database.
#[derive(Debug, Error)]
pub enum OvsdbError {
    /// Could not reach the database server.
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection {
        /// Endpoint that was dialed.
        endpoint: String,
        /// Error message.
        message: String,
    },

    /// Endpoint string is not `tcp:HOST:PORT` or `unix:PATH`.
    #[error("Invalid switch endpoint: {0}")]
    InvalidEndpoint(String),

    /// Socket failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message on the wire.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The server answered a request with a JSON-RPC error.
    #[error("RPC {method} failed: {message}")]
    Rpc {
        /// Request method.
        method: String,
        /// Error payload rendered as text.
        message: String,
    },

    /// Fewer replies than submitted statements.
    #[error("Number of replies ({actual}) is less than number of operations ({expected})")]
    ShortReply {
        /// Statements submitted.
        expected: usize,
        /// Replies received.
        actual: usize,
    },

    /// A statement of the transaction failed, so none of it was applied.
    #[error("Transaction failed due to an error: {error} details: {details}")]
    Transaction {
        /// Error tag reported by the server.
        error: String,
        /// Server supplied details, possibly empty.
        details: String,
    },

    /// The root `Open_vSwitch` row has not been mirrored yet.
    #[error("Root configuration row not available")]
    MissingRoot,

    /// The session or connection has been shut down.
    #[error("Switch connection closed")]
    Closed,
}

impl OvsdbError {
    /// Creates a connection error.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates an RPC error.
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Creates a transaction error.
    pub fn transaction(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Transaction {
            error: error.into(),
            details: details.into(),
        }
    }
}
