//! Error types for the SDN daemon.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sdn_ipam::IpamError;
use sdn_ovsdb::OvsdbError;
use thiserror::Error;
use tracing::error;

/// Result type alias for daemon operations.
pub type SdnResult<T> = Result<T, SdnError>;

/// Errors surfaced by the command core and the control surface.
#[derive(Debug, Error)]
pub enum SdnError {
    /// Allocation or network registry failure.
    #[error(transparent)]
    Ipam(#[from] IpamError),

    /// Switch database failure.
    #[error(transparent)]
    Ovsdb(#[from] OvsdbError),

    /// Unknown connection or peer.
    #[error("{0}")]
    NotFound(String),

    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// The command core is no longer accepting commands.
    #[error("Command core stopped")]
    CoreStopped,

    /// Cluster membership failure.
    #[error("Membership error: {0}")]
    Membership(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdnError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// HTTP status for this error.
    ///
    /// Subnets and addresses rejected by the allocator are client errors.
    /// Unknown networks are reported as server errors, matching the
    /// established behavior of the network endpoints.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SdnError::BadRequest(_)
            | SdnError::Ipam(IpamError::InvalidSubnet { .. })
            | SdnError::Ipam(IpamError::AddressOutOfRange { .. }) => StatusCode::BAD_REQUEST,
            SdnError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SdnError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SdnError::bad_request("address missing").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SdnError::not_found("container not found").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(SdnError::CoreStopped.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_unknown_network_is_server_error() {
        let err: SdnError = IpamError::NetworkNotFound("blue".to_string()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Network blue not exist");
    }

    #[test]
    fn test_rejected_input_is_client_error() {
        let err: SdnError = IpamError::InvalidSubnet {
            value: "0.0.0.0/4".to_string(),
            message: "subnet too large for an IP pool".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err: SdnError = IpamError::AddressOutOfRange {
            addr: "10.2.0.1".parse().unwrap(),
            subnet: "10.1.0.0/24".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err: SdnError = IpamError::exhausted("vlan").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_switch_errors_are_server_errors() {
        let err: SdnError = OvsdbError::Closed.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
