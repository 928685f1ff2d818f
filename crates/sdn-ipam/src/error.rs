//! Error types for allocation and network registry operations.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type alias for ipam operations.
pub type IpamResult<T> = Result<T, IpamError>;

/// Errors that can occur while allocating cluster resources.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Every slot of a pool is in use.
    #[error("All {pool} slots have been used")]
    Exhausted {
        /// Pool description (e.g. "vlan", "10.1.0.0/24").
        pool: String,
    },

    /// The conditional write kept losing to concurrent writers.
    #[error("Gave up updating {store}/{key} after {attempts} conflicting attempts")]
    Contention {
        /// Logical store name.
        store: String,
        /// Record key.
        key: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The backing store failed for a reason other than a CAS conflict.
    #[error("Store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g. "get", "put").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Network record not present in the store.
    #[error("Network {0} not exist")]
    NetworkNotFound(String),

    /// Address does not belong to the usable range of the subnet.
    #[error("Address {addr} is outside the usable range of {subnet}")]
    AddressOutOfRange {
        /// Offending address.
        addr: Ipv4Addr,
        /// Subnet the address was checked against.
        subnet: String,
    },

    /// VLAN id outside of 1..=4096.
    #[error("VLAN id {0} is out of range")]
    VlanOutOfRange(u32),

    /// Malformed stored record.
    #[error("Invalid record: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid subnet or gateway configuration.
    #[error("Invalid subnet '{value}': {message}")]
    InvalidSubnet {
        /// The rejected input.
        value: String,
        /// Error message.
        message: String,
    },
}

impl IpamError {
    /// Creates a pool exhaustion error.
    pub fn exhausted(pool: impl Into<String>) -> Self {
        Self::Exhausted { pool: pool.into() }
    }

    /// Creates a store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid subnet error.
    pub fn invalid_subnet(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSubnet {
            value: value.into(),
            message: message.into(),
        }
    }

    /// Returns true for resource exhaustion, which callers must not retry.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, IpamError::Exhausted { .. })
    }

    /// Returns true if the error names a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpamError::NetworkNotFound(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for IpamError {
    fn from(err: redis::RedisError) -> Self {
        IpamError::store("redis", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpamError::exhausted("vlan");
        assert_eq!(err.to_string(), "All vlan slots have been used");
        assert!(err.is_exhaustion());

        let err = IpamError::NetworkNotFound("blue".to_string());
        assert_eq!(err.to_string(), "Network blue not exist");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_contention_display() {
        let err = IpamError::Contention {
            store: "vlan".to_string(),
            key: "vlan".to_string(),
            attempts: 8,
        };
        assert!(err.to_string().contains("8 conflicting attempts"));
        assert!(!err.is_exhaustion());
    }
}
