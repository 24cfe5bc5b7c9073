// # Database Configuration
//
// Host-facing configuration surface. Loading this from files or the
// process environment is the host's concern; the engine only consumes the
// resolved struct.

use crate::{Result, RhizomeError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Default bound on cached materialized views.
pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Which storage backend backs the delta log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    Disk,
}

/// Listener settings for the federation server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationServerConfig {
    pub port: u16,
    pub path: String,
}

impl Default for FederationServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            path: "/federation".to_string(),
        }
    }
}

/// Federation-wide settings (per-link settings live in `LinkConfig`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederationSettings {
    /// Accept inbound peer connections.
    #[serde(default)]
    pub enable_server: bool,
    #[serde(default)]
    pub server: FederationServerConfig,
    /// Re-broadcast deltas received from one peer to the others.
    #[serde(default)]
    pub auto_broadcast: bool,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Identifier this instance stamps on deltas it authors. Generated
    /// when absent.
    #[serde(default)]
    pub system_id: Option<String>,
    pub storage: StorageKind,
    /// Required for `StorageKind::Disk`.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_true")]
    pub enable_indexing: bool,
    #[serde(default)]
    pub validate_schemas: bool,
    #[serde(default)]
    pub federation: FederationSettings,
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            system_id: None,
            storage: StorageKind::Memory,
            storage_path: None,
            cache_size: DEFAULT_CACHE_SIZE,
            enable_indexing: true,
            validate_schemas: false,
            federation: FederationSettings::default(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory instance with defaults.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Disk-backed instance rooted at `path`.
    pub fn disk<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            storage: StorageKind::Disk,
            storage_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_system_id<S: Into<String>>(mut self, system_id: S) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_indexing(mut self, enabled: bool) -> Self {
        self.enable_indexing = enabled;
        self
    }

    pub fn with_schema_validation(mut self, enabled: bool) -> Self {
        self.validate_schemas = enabled;
        self
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            return Err(RhizomeError::Configuration(
                "cache_size must be greater than 0".to_string(),
            ));
        }
        if self.storage == StorageKind::Disk && self.storage_path.is_none() {
            return Err(RhizomeError::Configuration(
                "disk storage requires storage_path".to_string(),
            ));
        }
        if let Some(system_id) = &self.system_id {
            if system_id.is_empty() {
                return Err(RhizomeError::Configuration(
                    "system_id must be non-empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The configured system id, or a generated one.
    pub fn resolved_system_id(&self) -> String {
        self.system_id
            .clone()
            .unwrap_or_else(|| format!("system-{}", Uuid::new_v4()))
    }
}
