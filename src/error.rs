//! Error types for the availability controller

use thiserror::Error;

/// Main error type for availability reconciliation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency rejection on a status write
    #[error("conflict writing status for {0}")]
    Conflict(String),

    /// The object disappeared between the cache read and the write
    #[error("apiservice {0} not found")]
    NotFound(String),

    /// Discovery probe against the backing service failed
    #[error("discovery probe failed: {0}")]
    Probe(String),

    /// Service could not be resolved to a reachable URL
    #[error("service resolution failed: {0}")]
    Resolution(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid controller configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a probe error with the given message
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a resolution error with the given message
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a kube error from a status write, splitting out 409 and 404
    pub fn from_status_write(name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(name.to_string()),
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(name.to_string()),
            _ => Self::Kube(err),
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::Probe(_) => "probe",
            Self::Resolution(_) => "resolution",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}
