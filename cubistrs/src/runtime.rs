//! Compiling and running requests against configured stores.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::backends::{BackendConnection, ConnectionManager, QueryResult};
use crate::config::{CubistConfig, ResolvedStoreConfig};
use crate::error::{CubistError, Result};
use crate::mapper::create_mapper;
use crate::model::{Cube, Model};
use crate::query_builder::{AggregateRequest, FactsRequest, MembersRequest, SqlBuilder};
use crate::schema_cache::{SchemaCache, SchemaCatalog, TableSchema};
use crate::sql_ast::{SelectQuery, SqlRenderer};

/// Store used by cubes that do not name one.
pub const DEFAULT_STORE: &str = "default";

/// A model bound to its stores.
pub struct Workspace {
    model: Arc<Model>,
    config: CubistConfig,
    connections: ConnectionManager,
    schemas: RwLock<SchemaCache>,
}

impl Workspace {
    pub fn new(model: Arc<Model>, config: CubistConfig, connections: ConnectionManager) -> Self {
        let schemas = SchemaCache::with_config(&config.defaults.schema_cache);
        Self {
            model,
            config,
            connections,
            schemas: RwLock::new(schemas),
        }
    }

    /// Open every configured store and bind `model` to them.
    pub fn from_config(model: Arc<Model>, config: CubistConfig) -> Result<Self> {
        let connections = ConnectionManager::from_config(&config)?;
        Ok(Self::new(model, config, connections))
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub async fn aggregate(&self, request: &AggregateRequest) -> Result<QueryResult> {
        let cube = self.model.cube(&request.cube)?;
        self.run(cube, |builder| builder.aggregate_query(&self.model, request))
            .await
    }

    pub async fn facts(&self, request: &FactsRequest) -> Result<QueryResult> {
        let cube = self.model.cube(&request.cube)?;
        self.run(cube, |builder| builder.facts_query(&self.model, request))
            .await
    }

    /// Number of fact rows in the cell.
    pub async fn fact_count(&self, request: &FactsRequest) -> Result<u64> {
        let cube = self.model.cube(&request.cube)?;
        let result = self
            .run(cube, |builder| builder.fact_count_query(&self.model, request))
            .await?;
        result
            .rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(|v| v.as_u64())
            .ok_or_else(|| CubistError::Execution("fact count returned no number".to_string()))
    }

    pub async fn members(&self, request: &MembersRequest) -> Result<QueryResult> {
        let cube = self.model.cube(&request.cube)?;
        self.run(cube, |builder| builder.members_query(&self.model, request))
            .await
    }

    async fn run<F>(&self, cube: &Cube, compile: F) -> Result<QueryResult>
    where
        F: FnOnce(&SqlBuilder<'_>) -> Result<SelectQuery>,
    {
        let store = cube.store().unwrap_or(DEFAULT_STORE);
        let connection = self.connections.get(store).ok_or_else(|| {
            CubistError::Config(format!(
                "cube '{}' uses store '{store}', which is not configured",
                cube.name()
            ))
        })?;
        let config = self.config.for_store(store);

        let catalog = self.catalog(store, cube, &config, connection.as_ref()).await?;
        let sql = {
            let builder = SqlBuilder::from_config(&config).with_schema(&catalog);
            let query = compile(&builder)?;
            SqlRenderer::new(connection.dialect()).render_select(&query)
        };

        let timeout = Duration::from_millis(config.query.timeout_ms);
        tracing::debug!(cube = cube.name(), store, sql = %sql, "executing statement");
        match tokio::time::timeout(timeout, connection.execute_sql(&sql)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(cube = cube.name(), store, ?timeout, "query timed out");
                Err(CubistError::Timeout(timeout))
            }
        }
    }

    /// Physical schemas of every table the cube may read, fetched through the cache.
    async fn catalog(
        &self,
        store: &str,
        cube: &Cube,
        config: &ResolvedStoreConfig,
        connection: &dyn BackendConnection,
    ) -> Result<SchemaCatalog> {
        let tables = {
            let mapper = create_mapper(cube, &config.naming, config.mapper.policy, None);
            let fact = mapper.fact_table();
            let mut tables = vec![(fact.schema.clone(), fact.name.clone())];
            for join in mapper.joins() {
                if let Some(table) = &join.detail.table {
                    let schema = join
                        .detail
                        .schema
                        .clone()
                        .or_else(|| mapper.default_schema().map(str::to_string));
                    if !tables.iter().any(|(s, t)| s == &schema && t == table) {
                        tables.push((schema, table.clone()));
                    }
                }
            }
            tables
        };

        let mut catalog = SchemaCatalog::new();
        for (schema, table) in tables {
            catalog.insert(self.table_schema(store, schema.as_deref(), &table, connection).await?);
        }
        Ok(catalog)
    }

    async fn table_schema(
        &self,
        store: &str,
        schema: Option<&str>,
        table: &str,
        connection: &dyn BackendConnection,
    ) -> Result<TableSchema> {
        if let Some(hit) = self.schemas.read().await.get(store, schema, table) {
            return Ok(hit.clone());
        }
        let fetched = connection.fetch_schema(schema, table).await?;
        tracing::debug!(store, table, columns = fetched.columns.len(), "cached table schema");
        let mut cache = self.schemas.write().await;
        cache.insert(store, fetched.clone());
        Ok(fetched)
    }

    /// Forget cached table schemas, e.g. after a migration.
    pub async fn clear_schema_cache(&self) {
        self.schemas.write().await.clear();
    }
}
