//! Configuration system for cubist.
//!
//! Supports TOML-based configuration with global defaults and per-store overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CubistError, Result};
use crate::metadata::CubeOptions;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CubistConfig {
    /// Global defaults applied to all stores unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-store configuration (keyed by store name).
    #[serde(default)]
    pub stores: HashMap<String, StoreConfig>,
}

/// Global default settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub naming: NamingConfig,
    pub mapper: MapperConfig,
    pub query: QueryConfig,
    pub schema_cache: SchemaCacheConfig,
}

/// Physical naming conventions used when a cube has no explicit mapping.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Default database schema.
    pub schema: Option<String>,
    pub fact_schema: Option<String>,
    pub dimension_schema: Option<String>,
    pub fact_prefix: String,
    pub fact_suffix: String,
    pub dimension_prefix: String,
    pub dimension_suffix: String,
    /// Explicit denormalized view name; `denormalized_view_prefix` + cube name otherwise.
    pub denormalized_view: Option<String>,
    pub denormalized_view_prefix: String,
    pub denormalized_view_schema: Option<String>,
    /// Read attributes of plain dimensions straight from the fact table.
    pub simplify_dimension_references: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MapperPolicy {
    #[default]
    Star,
    Denormalized,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MapperConfig {
    pub policy: MapperPolicy,
}

/// Query compilation and execution configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Query timeout in milliseconds (default: 30000).
    pub timeout_ms: u64,
    /// Page size used when a request gives a page but no page size.
    pub default_page_size: Option<u64>,
    /// Replace NULL inputs/results of aggregates with their missing value.
    pub coalesce_missing_values: bool,
    /// Locale used when a request does not name one.
    pub locale: Option<String>,
}

/// Schema cache configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Cache TTL in seconds (default: 3600).
    pub ttl_secs: u64,
    /// Maximum cached schemas (default: 1000).
    pub max_size: usize,
}

/// Per-store configuration (can override globals).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend key in the backend registry, e.g. `duckdb`.
    #[serde(rename = "type")]
    pub backend: Option<String>,
    /// Database location for file-based backends.
    pub path: Option<String>,
    pub max_concurrency: Option<usize>,
    pub naming: Option<NamingConfig>,
    pub mapper: Option<MapperConfig>,
    pub query: Option<QueryConfig>,
}

// Default implementations

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            schema: None,
            fact_schema: None,
            dimension_schema: None,
            fact_prefix: String::new(),
            fact_suffix: String::new(),
            dimension_prefix: String::new(),
            dimension_suffix: String::new(),
            denormalized_view: None,
            denormalized_view_prefix: "mft_".to_string(),
            denormalized_view_schema: None,
            simplify_dimension_references: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            default_page_size: None,
            coalesce_missing_values: true,
            locale: None,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_size: 1000,
        }
    }
}

impl NamingConfig {
    /// Apply cube-level naming overrides; values set on the cube win.
    pub fn merge(&self, options: &CubeOptions) -> NamingConfig {
        NamingConfig {
            schema: options.schema.clone().or_else(|| self.schema.clone()),
            fact_schema: options
                .fact_schema
                .clone()
                .or_else(|| self.fact_schema.clone()),
            dimension_schema: options
                .dimension_schema
                .clone()
                .or_else(|| self.dimension_schema.clone()),
            fact_prefix: options
                .fact_prefix
                .clone()
                .unwrap_or_else(|| self.fact_prefix.clone()),
            fact_suffix: options
                .fact_suffix
                .clone()
                .unwrap_or_else(|| self.fact_suffix.clone()),
            dimension_prefix: options
                .dimension_prefix
                .clone()
                .unwrap_or_else(|| self.dimension_prefix.clone()),
            dimension_suffix: options
                .dimension_suffix
                .clone()
                .unwrap_or_else(|| self.dimension_suffix.clone()),
            denormalized_view: options
                .denormalized_view
                .clone()
                .or_else(|| self.denormalized_view.clone()),
            denormalized_view_prefix: self.denormalized_view_prefix.clone(),
            denormalized_view_schema: options
                .denormalized_view_schema
                .clone()
                .or_else(|| self.denormalized_view_schema.clone()),
            simplify_dimension_references: options
                .simplify_dimension_references
                .unwrap_or(self.simplify_dimension_references),
        }
    }
}

impl CubistConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CubistError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&contents)
            .map_err(|e| CubistError::Config(format!("failed to parse config: {e}")))
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| CubistError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `CUBIST_CONFIG` environment variable
    /// 2. `./cubist.toml` (current directory)
    /// 3. `~/.config/cubist/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("CUBIST_CONFIG") {
            if let Ok(cfg) = Self::from_file(&path) {
                tracing::info!(path = %path, "loaded config from CUBIST_CONFIG");
                return cfg;
            }
        }

        if let Ok(cfg) = Self::from_file("cubist.toml") {
            tracing::info!("loaded config from ./cubist.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("cubist").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Get resolved config for a specific store (merges global defaults).
    pub fn for_store(&self, name: &str) -> ResolvedStoreConfig {
        ResolvedStoreConfig::merge(&self.defaults, self.stores.get(name))
    }
}

/// Fully resolved configuration for a store (no Option overrides left).
#[derive(Debug, Clone)]
pub struct ResolvedStoreConfig {
    pub backend: String,
    pub path: Option<String>,
    pub max_concurrency: usize,
    pub naming: NamingConfig,
    pub mapper: MapperConfig,
    pub query: QueryConfig,
    pub schema_cache: SchemaCacheConfig,
}

impl ResolvedStoreConfig {
    fn merge(defaults: &GlobalDefaults, store: Option<&StoreConfig>) -> Self {
        let store = store.cloned().unwrap_or_default();
        Self {
            backend: store.backend.unwrap_or_else(|| "duckdb".to_string()),
            path: store.path,
            max_concurrency: store.max_concurrency.unwrap_or(16),
            naming: store.naming.unwrap_or_else(|| defaults.naming.clone()),
            mapper: store.mapper.unwrap_or_else(|| defaults.mapper.clone()),
            query: store.query.unwrap_or_else(|| defaults.query.clone()),
            schema_cache: defaults.schema_cache.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CubistConfig::default();
        assert_eq!(cfg.defaults.query.timeout_ms, 30_000);
        assert!(cfg.defaults.query.coalesce_missing_values);
        assert_eq!(cfg.defaults.naming.denormalized_view_prefix, "mft_");
        assert!(cfg.defaults.naming.simplify_dimension_references);
        assert_eq!(cfg.defaults.mapper.policy, MapperPolicy::Star);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[defaults.naming]
schema = "warehouse"
dimension_prefix = "dim_"
fact_prefix = "fact_"

[defaults.query]
timeout_ms = 60000
locale = "en"

[stores.analytics]
type = "duckdb"
path = "/tmp/analytics.duckdb"

[stores.analytics.mapper]
policy = "denormalized"
"#;
        let cfg = CubistConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.defaults.query.timeout_ms, 60_000);
        assert_eq!(cfg.defaults.naming.dimension_prefix, "dim_");

        let resolved = cfg.for_store("analytics");
        assert_eq!(resolved.backend, "duckdb");
        assert_eq!(resolved.path.as_deref(), Some("/tmp/analytics.duckdb"));
        assert_eq!(resolved.mapper.policy, MapperPolicy::Denormalized);
        assert_eq!(resolved.naming.schema.as_deref(), Some("warehouse"));
        assert_eq!(resolved.query.locale.as_deref(), Some("en"));
    }

    #[test]
    fn test_unknown_store_uses_defaults() {
        let cfg = CubistConfig::from_toml("[defaults.query]\ntimeout_ms = 5").unwrap();
        let resolved = cfg.for_store("missing");
        assert_eq!(resolved.query.timeout_ms, 5);
        assert_eq!(resolved.max_concurrency, 16);
    }

    #[test]
    fn test_cube_options_override_naming() {
        let naming = NamingConfig {
            schema: Some("public".to_string()),
            dimension_prefix: "dim_".to_string(),
            ..NamingConfig::default()
        };
        let options = CubeOptions {
            dimension_prefix: Some("d_".to_string()),
            simplify_dimension_references: Some(false),
            ..CubeOptions::default()
        };
        let merged = naming.merge(&options);
        assert_eq!(merged.schema.as_deref(), Some("public"));
        assert_eq!(merged.dimension_prefix, "d_");
        assert!(!merged.simplify_dimension_references);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = CubistConfig::from_toml("[defaults.query]\ntimeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, CubistError::Config(_)));
    }
}
