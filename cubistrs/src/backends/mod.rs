//! Store connections.
//!
//! Backends are registered by key in a static table of constructors; a
//! store's `type` in the configuration selects one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};

use crate::config::{CubistConfig, ResolvedStoreConfig};
use crate::dialect::Dialect;
use crate::error::{CubistError, Result};
use crate::schema_cache::TableSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
}

/// Rows of an executed statement, keyed by column label.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

/// Unified interface for all database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn dialect(&self) -> &(dyn Dialect + Send + Sync);
    async fn fetch_schema(&self, schema: Option<&str>, table: &str) -> Result<TableSchema>;
    async fn execute_sql(&self, sql: &str) -> Result<QueryResult>;
}

/// Builds a connection for a store from its resolved configuration.
pub type BackendConstructor = fn(&str, &ResolvedStoreConfig) -> Result<Arc<dyn BackendConnection>>;

static BACKENDS: Lazy<HashMap<&'static str, BackendConstructor>> = Lazy::new(|| {
    #[allow(unused_mut)]
    let mut backends: HashMap<&'static str, BackendConstructor> = HashMap::new();
    #[cfg(feature = "duckdb")]
    backends.insert("duckdb", self::duckdb::DuckDbConnection::from_config);
    backends
});

/// Constructor registered under `key`.
pub fn backend(key: &str) -> Option<BackendConstructor> {
    BACKENDS.get(key).copied()
}

pub fn available_backends() -> Vec<&'static str> {
    let mut keys: Vec<&'static str> = BACKENDS.keys().copied().collect();
    keys.sort_unstable();
    keys
}

/// Connections keyed by store name.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn BackendConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for every store in `config`.
    pub fn from_config(config: &CubistConfig) -> Result<Self> {
        let mut manager = Self::new();
        let mut names: Vec<&String> = config.stores.keys().collect();
        names.sort();
        for name in names {
            let resolved = config.for_store(name);
            let constructor = backend(&resolved.backend).ok_or_else(|| {
                CubistError::Config(format!(
                    "store '{name}' uses unknown backend '{}' (available: {})",
                    resolved.backend,
                    available_backends().join(", ")
                ))
            })?;
            let connection = constructor(name, &resolved)?;
            tracing::info!(store = name.as_str(), backend = %resolved.backend, "opened store");
            manager.insert(name.as_str(), connection);
        }
        Ok(manager)
    }

    pub fn insert(&mut self, name: impl Into<String>, conn: Arc<dyn BackendConnection>) {
        self.connections.insert(name.into(), conn);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackendConnection>> {
        self.connections.get(name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbConnection;
