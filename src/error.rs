use thiserror::Error;

#[derive(Error, Debug)]
pub enum RhizomeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    #[error("circular schema reference: {0}")]
    CircularSchema(String),

    #[error("trust policy rejected delta: {0}")]
    TrustRejected(String),

    #[error("protocol mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: String, remote: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("subscription buffer overflow: {0}")]
    BufferOverflow(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Internal cache signal; never surfaced to callers, who see a
    /// rebuild instead.
    #[error("cache miss for {0}")]
    CacheMiss(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("federation error: {0}")]
    Federation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Clone for RhizomeError {
    fn clone(&self) -> Self {
        match self {
            RhizomeError::Io(e) => RhizomeError::Storage(e.to_string()),
            RhizomeError::InvalidDelta(s) => RhizomeError::InvalidDelta(s.clone()),
            RhizomeError::SchemaNotFound(s) => RhizomeError::SchemaNotFound(s.clone()),
            RhizomeError::CircularSchema(s) => RhizomeError::CircularSchema(s.clone()),
            RhizomeError::TrustRejected(s) => RhizomeError::TrustRejected(s.clone()),
            RhizomeError::ProtocolMismatch { local, remote } => RhizomeError::ProtocolMismatch {
                local: local.clone(),
                remote: remote.clone(),
            },
            RhizomeError::ConnectionLost(s) => RhizomeError::ConnectionLost(s.clone()),
            RhizomeError::BufferOverflow(s) => RhizomeError::BufferOverflow(s.clone()),
            RhizomeError::Cancelled => RhizomeError::Cancelled,
            RhizomeError::CacheMiss(s) => RhizomeError::CacheMiss(s.clone()),
            RhizomeError::Storage(s) => RhizomeError::Storage(s.clone()),
            RhizomeError::Serialization(s) => RhizomeError::Serialization(s.clone()),
            RhizomeError::Configuration(s) => RhizomeError::Configuration(s.clone()),
            RhizomeError::Timeout(s) => RhizomeError::Timeout(s.clone()),
            RhizomeError::NotFound(s) => RhizomeError::NotFound(s.clone()),
            RhizomeError::InvalidState(s) => RhizomeError::InvalidState(s.clone()),
            RhizomeError::Federation(s) => RhizomeError::Federation(s.clone()),
            RhizomeError::Internal(s) => RhizomeError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RhizomeError>;

// Error conversions for common error types

impl From<serde_json::Error> for RhizomeError {
    fn from(e: serde_json::Error) -> Self {
        RhizomeError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for RhizomeError {
    fn from(e: sled::Error) -> Self {
        RhizomeError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhizomeError::InvalidDelta("empty id".to_string());
        assert_eq!(err.to_string(), "invalid delta: empty id");

        let err = RhizomeError::ProtocolMismatch {
            local: "v1".to_string(),
            remote: "v2".to_string(),
        };
        assert!(err.to_string().contains("v1"));
        assert!(err.to_string().contains("v2"));
    }

    #[test]
    fn test_error_clone() {
        let err = RhizomeError::TrustRejected("untrusted author".to_string());
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_io_error_clones_to_storage() {
        let err: RhizomeError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        match err.clone() {
            RhizomeError::Storage(s) => assert!(s.contains("missing")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
