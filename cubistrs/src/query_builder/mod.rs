use tracing::Span;

use crate::config::{MapperPolicy, NamingConfig, QueryConfig, ResolvedStoreConfig};
use crate::dialect::Dialect;
use crate::error::Result;
use crate::mapper::create_mapper;
use crate::model::{Cube, Model};
use crate::schema_cache::PhysicalSchema;
use crate::sql_ast::{SelectQuery, SqlRenderer};

mod columns;
mod requests;
mod statements;

pub use requests::{AggregateRequest, Drilldown, FactsRequest, MembersRequest, OrderSpec};
pub use statements::{QueryBuilder, FACT_COUNT_LABEL};

/// Entry point for turning requests against a model into SQL text.
///
/// Naming, mapper policy and query settings usually come from a resolved
/// store configuration; a physical schema catalog is optional and enables
/// table and column checks at compile time.
#[derive(Clone, Default)]
pub struct SqlBuilder<'a> {
    naming: NamingConfig,
    policy: MapperPolicy,
    query: QueryConfig,
    physical: Option<&'a dyn PhysicalSchema>,
    span: Option<Span>,
}

impl<'a> SqlBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ResolvedStoreConfig) -> Self {
        Self {
            naming: config.naming.clone(),
            policy: config.mapper.policy,
            query: config.query.clone(),
            physical: None,
            span: None,
        }
    }

    pub fn with_naming(mut self, naming: NamingConfig) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_policy(mut self, policy: MapperPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_query_config(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }

    /// Check tables and columns against `physical` while compiling.
    pub fn with_schema(mut self, physical: &'a dyn PhysicalSchema) -> Self {
        self.physical = Some(physical);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn query_config(&self) -> &QueryConfig {
        &self.query
    }

    /// Statement builder for one cube.
    pub fn query_builder<'c>(&self, cube: &'c Cube) -> Result<QueryBuilder<'c>>
    where
        'a: 'c,
    {
        let mapper = create_mapper(cube, &self.naming, self.policy, self.query.locale.as_deref());
        let builder = QueryBuilder::new(cube, mapper, self.physical, self.query.clone())?;
        Ok(match &self.span {
            Some(span) => builder.with_span(span.clone()),
            None => builder,
        })
    }

    pub fn aggregate_query(&self, model: &Model, request: &AggregateRequest) -> Result<SelectQuery> {
        let cube = model.cube(&request.cube)?;
        self.query_builder(cube)?.aggregate(request)
    }

    pub fn facts_query(&self, model: &Model, request: &FactsRequest) -> Result<SelectQuery> {
        let cube = model.cube(&request.cube)?;
        self.query_builder(cube)?.facts(request)
    }

    pub fn fact_count_query(&self, model: &Model, request: &FactsRequest) -> Result<SelectQuery> {
        let cube = model.cube(&request.cube)?;
        self.query_builder(cube)?.fact_count(&request.conditions)
    }

    pub fn members_query(&self, model: &Model, request: &MembersRequest) -> Result<SelectQuery> {
        let cube = model.cube(&request.cube)?;
        self.query_builder(cube)?.members(request)
    }

    pub fn build_aggregate(
        &self,
        model: &Model,
        request: &AggregateRequest,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let query = self.aggregate_query(model, request)?;
        Ok(render(&query, dialect, "aggregate"))
    }

    pub fn build_facts(
        &self,
        model: &Model,
        request: &FactsRequest,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let query = self.facts_query(model, request)?;
        Ok(render(&query, dialect, "facts"))
    }

    pub fn build_fact_count(
        &self,
        model: &Model,
        request: &FactsRequest,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let query = self.fact_count_query(model, request)?;
        Ok(render(&query, dialect, "fact_count"))
    }

    pub fn build_members(
        &self,
        model: &Model,
        request: &MembersRequest,
        dialect: &dyn Dialect,
    ) -> Result<String> {
        let query = self.members_query(model, request)?;
        Ok(render(&query, dialect, "members"))
    }
}

fn render(query: &SelectQuery, dialect: &dyn Dialect, kind: &str) -> String {
    let sql = SqlRenderer::new(dialect).render_select(query);
    tracing::debug!(kind, sql = %sql, "rendered statement");
    sql
}
