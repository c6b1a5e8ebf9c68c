//! Error types for the vSphere lifecycle crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VctErrorKind {
    /// Session exposes no view manager, so the inventory cannot be browsed
    InventoryUnavailable,
    /// Named cluster / compute resource does not exist in the view
    ClusterNotFound,
    /// Named datacenter, datastore, network or VM does not exist
    ObjectNotFound,
    /// A device references a controller or device key unknown to the batch
    KeyLinkageViolation,
    /// Device parameters are contradictory or out of range
    InvalidDeviceConfig,
    /// Datastore reports zero capacity
    DivideByZeroCapacity,
    /// Question resolver picked a key the question does not offer
    InvalidAnswer,
    /// Endpoint unreachable or session missing
    ConnectionError,
    /// Authentication failed (401)
    AuthenticationError,
    /// Permission denied (403)
    AccessDenied,
    /// HTTP / API error with status code
    ApiError(u16),
    /// JSON parse / deserialization error
    ParseError,
    /// HTTP timeout
    Timeout,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct VctError {
    pub kind: VctErrorKind,
    pub message: String,
}

impl VctError {
    pub fn new(kind: VctErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn inventory_unavailable(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::InventoryUnavailable, msg)
    }

    pub fn cluster_not_found(name: &str) -> Self {
        Self::new(VctErrorKind::ClusterNotFound, format!("Cluster '{name}' not found"))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::ObjectNotFound, msg)
    }

    pub fn key_linkage(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::KeyLinkageViolation, msg)
    }

    pub fn invalid_device(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::InvalidDeviceConfig, msg)
    }

    pub fn zero_capacity(datastore: &str) -> Self {
        Self::new(
            VctErrorKind::DivideByZeroCapacity,
            format!("Datastore '{datastore}' reports zero capacity"),
        )
    }

    pub fn invalid_answer(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::InvalidAnswer, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::AuthenticationError, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::ParseError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(VctErrorKind::Timeout, msg)
    }

    /// True for the name-resolution kinds callers usually answer with a re-prompt.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            VctErrorKind::ObjectNotFound | VctErrorKind::ClusterNotFound
        )
    }
}

impl fmt::Display for VctError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for VctError {}

impl From<reqwest::Error> for VctError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::new(VctErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for VctError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

impl From<url::ParseError> for VctError {
    fn from(e: url::ParseError) -> Self {
        Self::connection(format!("Invalid endpoint URL: {e}"))
    }
}

/// Convenience alias.
pub type VctResult<T> = Result<T, VctError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let err = VctError::cluster_not_found("prod-01");
        let s = err.to_string();
        assert!(s.contains("ClusterNotFound"));
        assert!(s.contains("prod-01"));
    }

    #[test]
    fn not_found_kinds() {
        assert!(VctError::not_found("datastore 'ds9'").is_not_found());
        assert!(VctError::cluster_not_found("c1").is_not_found());
        assert!(!VctError::key_linkage("controller -7").is_not_found());
    }

    #[test]
    fn json_errors_become_parse_errors() {
        let err: VctError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.kind, VctErrorKind::ParseError);
    }
}
