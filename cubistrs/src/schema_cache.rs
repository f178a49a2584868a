use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SchemaCacheConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// Read-only introspection of the tables a store exposes.
pub trait PhysicalSchema {
    fn table(&self, schema: Option<&str>, name: &str) -> Option<&TableSchema>;
}

/// In-memory table catalog keyed by `(schema, table)`.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    tables: HashMap<(Option<String>, String), TableSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables
            .insert((table.schema.clone(), table.name.clone()), table);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl PhysicalSchema for SchemaCatalog {
    fn table(&self, schema: Option<&str>, name: &str) -> Option<&TableSchema> {
        self.tables
            .get(&(schema.map(str::to_string), name.to_string()))
    }
}

impl FromIterator<TableSchema> for SchemaCatalog {
    fn from_iter<I: IntoIterator<Item = TableSchema>>(iter: I) -> Self {
        let mut catalog = SchemaCatalog::new();
        for table in iter {
            catalog.insert(table);
        }
        catalog
    }
}

type CacheKey = (String, Option<String>, String);

/// Cache entry with timestamp for TTL tracking.
#[derive(Debug, Clone)]
struct CacheEntry {
    schema: TableSchema,
    inserted_at: Instant,
}

/// Fetched table schemas per store, with TTL and size limits.
#[derive(Debug)]
pub struct SchemaCache {
    schemas: HashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }

    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        Self {
            schemas: HashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size,
        }
    }

    pub fn insert(&mut self, store: &str, schema: TableSchema) {
        // Evict oldest entry if at capacity
        if self.schemas.len() >= self.max_size {
            self.evict_oldest();
        }
        let key = (store.to_string(), schema.schema.clone(), schema.name.clone());
        self.schemas.insert(
            key,
            CacheEntry {
                schema,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, store: &str, schema: Option<&str>, table: &str) -> Option<&TableSchema> {
        let key = (
            store.to_string(),
            schema.map(str::to_string),
            table.to_string(),
        );
        self.schemas
            .get(&key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| &entry.schema)
    }

    pub fn contains(&self, store: &str, schema: Option<&str>, table: &str) -> bool {
        self.get(store, schema, table).is_some()
    }

    /// Remove expired entries from the cache.
    pub fn evict_expired(&mut self) {
        self.schemas
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .schemas
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!(
                store = %oldest_key.0,
                table = %oldest_key.2,
                "evicting oldest schema from cache"
            );
            self.schemas.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn clear(&mut self) {
        self.schemas.clear();
    }
}
