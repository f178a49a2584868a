use std::collections::{HashMap, HashSet};

use tracing::Span;

use crate::aggregates::AggregateCompiler;
use crate::conditions::{BoundCondition, Condition};
use crate::config::QueryConfig;
use crate::depsort::DependencyMap;
use crate::error::{CubistError, Result};
use crate::mapper::{ColumnReference, Mapper};
use crate::metadata::SortDirection;
use crate::model::{Aggregate, Attribute, AttributeRef, Cube, Level};
use crate::schema_cache::PhysicalSchema;
use crate::sql_ast::{
    Aggregation, FromItem, OrderItem, SelectItem, SelectQuery, SqlBinaryOperator, SqlExpr,
    SqlJoinType,
};
use crate::star::StarSchema;

use super::columns::ColumnSet;
use super::requests::{AggregateRequest, Drilldown, FactsRequest, MembersRequest, OrderSpec};

/// Label of the row count in fact count statements.
pub const FACT_COUNT_LABEL: &str = "count";

/// Alias of the latest-snapshot subquery joined for non-additive aggregates.
pub const SNAPSHOT_ALIAS: &str = "__semiadditive";

/// Statement compiler for one cube.
///
/// Holds the cube's mapper and join graph; both are reused by every
/// statement built through it.
pub struct QueryBuilder<'c> {
    cube: &'c Cube,
    mapper: Box<dyn Mapper + 'c>,
    star: StarSchema<'c>,
    dependencies: DependencyMap,
    config: QueryConfig,
    span: Option<Span>,
}

impl<'c> QueryBuilder<'c> {
    pub fn new(
        cube: &'c Cube,
        mapper: Box<dyn Mapper + 'c>,
        physical: Option<&'c dyn PhysicalSchema>,
        config: QueryConfig,
    ) -> Result<Self> {
        let star = StarSchema::new(
            mapper.fact_table(),
            mapper.joins(),
            mapper.default_schema(),
            physical,
        )?;
        Ok(Self {
            cube,
            dependencies: cube.dependency_map(),
            mapper,
            star,
            config,
            span: None,
        })
    }

    /// Record compilation events under `span` instead of the current span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn cube(&self) -> &'c Cube {
        self.cube
    }

    pub fn mapper(&self) -> &(dyn Mapper + 'c) {
        self.mapper.as_ref()
    }

    fn span(&self) -> Span {
        self.span.clone().unwrap_or_else(Span::current)
    }

    fn columns<'q>(&'q self, locale: Option<&'q str>) -> ColumnSet<'q, 'c> {
        ColumnSet::new(
            self.cube,
            self.mapper.as_ref(),
            &self.star,
            &self.dependencies,
            locale,
        )
    }

    fn filters(
        &self,
        conditions: &[Condition],
        columns: &mut ColumnSet<'_, 'c>,
    ) -> Result<Vec<SqlExpr>> {
        let bound = conditions
            .iter()
            .map(|c| c.bind(self.cube))
            .collect::<Result<Vec<BoundCondition<'c>>>>()?;
        bound
            .iter()
            .map(|c| c.evaluate(&mut |attr: &'c Attribute| columns.expr(AttributeRef::Attribute(attr))))
            .collect()
    }

    fn requested_aggregates(&self, names: &[String]) -> Result<Vec<&'c Aggregate>> {
        if names.is_empty() {
            return Ok(self.cube.aggregates().iter().collect());
        }
        names.iter().map(|n| self.cube.aggregate(n)).collect()
    }

    fn aggregate_items(
        &self,
        requested: &[&'c Aggregate],
        columns: &mut ColumnSet<'_, 'c>,
    ) -> Result<Vec<SelectItem>> {
        let compiler = AggregateCompiler::new(self.cube, self.config.coalesce_missing_values);
        let mut context: HashMap<String, SqlExpr> = HashMap::new();
        for agg in compiler.closure(requested) {
            for dep in &agg.depends_on {
                if context.contains_key(dep) || self.cube.aggregate(dep).is_ok() {
                    continue;
                }
                let expr = columns.expr(self.cube.attribute(dep)?)?;
                context.insert(dep.clone(), expr);
            }
        }
        compiler.compile(requested, &context)
    }

    /// Time keys at which non-additive aggregates are read: the finest key
    /// of every drilled time dimension, else of the cube's first time
    /// dimension. Empty when every requested aggregate is additive.
    fn snapshot_keys(
        &self,
        requested: &[&'c Aggregate],
        drilldown: &[Drilldown],
        columns: &mut ColumnSet<'_, 'c>,
    ) -> Result<Vec<SqlExpr>> {
        let Some(aggregate) = requested
            .iter()
            .find(|a| self.cube.is_nonadditive_over_time(a))
        else {
            return Ok(Vec::new());
        };

        let mut dimensions = Vec::new();
        for item in drilldown {
            let dimension = self.cube.dimension(&item.dimension)?;
            if dimension.role() == Some("time") {
                dimensions.push(dimension);
            }
        }
        if dimensions.is_empty() {
            dimensions.extend(self.cube.time_dimensions().next());
        }
        if dimensions.is_empty() {
            return Err(CubistError::Model(format!(
                "aggregate '{}' is non-additive over time but cube '{}' has no time dimension",
                aggregate.name,
                self.cube.name()
            )));
        }

        let mut keys = Vec::with_capacity(dimensions.len());
        for dimension in dimensions {
            let finest = dimension.levels_in(None)?.last().copied().ok_or_else(|| {
                CubistError::Model(format!("dimension '{}' has no levels", dimension.name()))
            })?;
            keys.push(columns.expr(AttributeRef::Attribute(finest.key()))?);
        }
        tracing::debug!(
            cube = self.cube.name(),
            aggregate = %aggregate.name,
            keys = keys.len(),
            "reading non-additive aggregates at the latest snapshot"
        );
        Ok(keys)
    }

    fn page_bounds(&self, page: Option<u64>, page_size: Option<u64>) -> (Option<u64>, Option<u64>) {
        if page.is_none() && page_size.is_none() {
            return (None, None);
        }
        match page_size.or(self.config.default_page_size) {
            Some(size) => (Some(size), page.map(|p| p.saturating_mul(size))),
            None => (None, None),
        }
    }

    /// Aggregation statement. Without drilldown this is the one-row summary.
    pub fn aggregate(&self, request: &AggregateRequest) -> Result<SelectQuery> {
        if request.drilldown.is_empty() {
            return self.summary(request);
        }
        let span = self.span();
        let _enter = span.enter();

        let mut columns = self.columns(request.locale.as_deref());
        let mut query = SelectQuery::default();
        let mut labels = Vec::new();
        let mut natural = Vec::new();
        let mut seen_dimensions = HashSet::new();

        for drilldown in &request.drilldown {
            if !seen_dimensions.insert(drilldown.dimension.as_str()) {
                return Err(CubistError::Argument(format!(
                    "dimension '{}' is drilled down more than once",
                    drilldown.dimension
                )));
            }
            for level in self.drilldown_levels(drilldown)? {
                for attr in level_columns(level) {
                    let expr = columns.expr(AttributeRef::Attribute(attr))?;
                    query.group_by.push(expr.clone());
                    query.select.push(SelectItem {
                        expr,
                        alias: Some(attr.reference()),
                    });
                    labels.push(attr.reference());
                }
                let order = level.order_attribute();
                natural.push((order.reference(), order.order.unwrap_or_default()));
            }
        }

        let requested = self.requested_aggregates(&request.aggregates)?;
        let aggregates = self.aggregate_items(&requested, &mut columns)?;
        labels.extend(aggregates.iter().filter_map(|a| a.alias.clone()));
        query.select.extend(aggregates);
        query.filters = self.filters(&request.conditions, &mut columns)?;
        let snapshot = self.snapshot_keys(&requested, &request.drilldown, &mut columns)?;
        query.from = self.star.join_expression(columns.columns(), true)?;
        if !snapshot.is_empty() {
            let from = std::mem::take(&mut query.from);
            query.from = latest_snapshot(from, &query.group_by, &query.filters, &snapshot);
        }
        query.order_by = order_by(&request.order, &labels, &natural)?;
        (query.limit, query.offset) = self.page_bounds(request.page, request.page_size);

        tracing::debug!(
            cube = self.cube.name(),
            groups = query.group_by.len(),
            joins = query.from.join_count(),
            "built aggregate statement"
        );
        Ok(query)
    }

    /// One-row aggregation of the whole cell. Never ordered or paged.
    pub fn summary(&self, request: &AggregateRequest) -> Result<SelectQuery> {
        let span = self.span();
        let _enter = span.enter();

        let mut columns = self.columns(request.locale.as_deref());
        let requested = self.requested_aggregates(&request.aggregates)?;
        let select = self.aggregate_items(&requested, &mut columns)?;
        let filters = self.filters(&request.conditions, &mut columns)?;
        let snapshot = self.snapshot_keys(&requested, &[], &mut columns)?;
        let mut from = self.star.join_expression(columns.columns(), true)?;
        if !snapshot.is_empty() {
            from = latest_snapshot(from, &[], &filters, &snapshot);
        }
        tracing::debug!(cube = self.cube.name(), "built summary statement");
        Ok(SelectQuery {
            select,
            from,
            filters,
            ..SelectQuery::default()
        })
    }

    /// Fact rows of the cell.
    pub fn facts(&self, request: &FactsRequest) -> Result<SelectQuery> {
        let span = self.span();
        let _enter = span.enter();

        let mut columns = self.columns(request.locale.as_deref());
        let mut query = SelectQuery::default();
        let mut labels = Vec::new();
        let mut natural = Vec::new();

        if request.fields.is_empty() {
            if let Some(key) = self.cube.key() {
                let fact = self.mapper.fact_table();
                let expr = columns.physical(ColumnReference::new(
                    fact.schema.as_deref(),
                    &fact.name,
                    key,
                ))?;
                query.select.push(SelectItem {
                    expr,
                    alias: Some(key.to_string()),
                });
                labels.push(key.to_string());
                natural.push((key.to_string(), SortDirection::Asc));
            }
            for attr in self.cube.fact_attributes() {
                self.select_attribute(attr, &mut columns, &mut query, &mut labels)?;
            }
        } else {
            for field in &request.fields {
                let attr = self.cube.attribute(field)?;
                self.select_attribute(attr, &mut columns, &mut query, &mut labels)?;
            }
        }

        query.filters = self.filters(&request.conditions, &mut columns)?;
        query.from = self.star.join_expression(columns.columns(), true)?;
        query.order_by = order_by(&request.order, &labels, &natural)?;
        (query.limit, query.offset) = self.page_bounds(request.page, request.page_size);
        tracing::debug!(
            cube = self.cube.name(),
            fields = query.select.len(),
            "built facts statement"
        );
        Ok(query)
    }

    fn select_attribute(
        &self,
        attr: AttributeRef<'c>,
        columns: &mut ColumnSet<'_, 'c>,
        query: &mut SelectQuery,
        labels: &mut Vec<String>,
    ) -> Result<()> {
        let label = attr.reference();
        if labels.contains(&label) {
            return Ok(());
        }
        let expr = columns.expr(attr)?;
        query.select.push(SelectItem {
            expr,
            alias: Some(label.clone()),
        });
        labels.push(label);
        Ok(())
    }

    /// Number of fact rows in the cell. Never paged.
    pub fn fact_count(&self, conditions: &[Condition]) -> Result<SelectQuery> {
        let span = self.span();
        let _enter = span.enter();

        let mut columns = self.columns(None);
        let filters = self.filters(conditions, &mut columns)?;
        let from = self.star.join_expression(columns.columns(), true)?;
        tracing::debug!(cube = self.cube.name(), "built fact count statement");
        Ok(SelectQuery {
            select: vec![SelectItem {
                expr: SqlExpr::Aggregate {
                    agg: Aggregation::Count,
                    expr: None,
                },
                alias: Some(FACT_COUNT_LABEL.to_string()),
            }],
            from,
            filters,
            ..SelectQuery::default()
        })
    }

    /// Distinct members of a dimension down to a level.
    pub fn members(&self, request: &MembersRequest) -> Result<SelectQuery> {
        let span = self.span();
        let _enter = span.enter();

        let dimension = self.cube.dimension(&request.dimension)?;
        let hierarchy = request.hierarchy.as_deref();
        let levels = match &request.level {
            Some(level) => dimension.levels_through(hierarchy, level)?,
            None => dimension.levels_in(hierarchy)?,
        };

        let mut columns = self.columns(request.locale.as_deref());
        let mut query = SelectQuery {
            distinct: true,
            ..SelectQuery::default()
        };
        let mut labels = Vec::new();
        let mut natural = Vec::new();
        for level in levels {
            for attr in level.attributes() {
                self.select_attribute(
                    AttributeRef::Attribute(attr),
                    &mut columns,
                    &mut query,
                    &mut labels,
                )?;
            }
            let order = level.order_attribute();
            natural.push((order.reference(), order.order.unwrap_or_default()));
        }

        query.filters = self.filters(&request.conditions, &mut columns)?;
        let fact_key = self.star.fact_key();
        let mut include_fact = !request.conditions.is_empty();
        for column in columns.columns() {
            if self.star.table_for(column)?.key() == *fact_key {
                include_fact = true;
            }
        }
        query.from = self.star.join_expression(columns.columns(), include_fact)?;
        query.order_by = order_by(&request.order, &labels, &natural)?;
        (query.limit, query.offset) = self.page_bounds(request.page, request.page_size);
        tracing::debug!(
            cube = self.cube.name(),
            dimension = dimension.name(),
            include_fact,
            "built members statement"
        );
        Ok(query)
    }

    fn drilldown_levels(&self, drilldown: &Drilldown) -> Result<Vec<&'c Level>> {
        let dimension = self.cube.dimension(&drilldown.dimension)?;
        let hierarchy = drilldown.hierarchy.as_deref();
        match &drilldown.level {
            Some(level) => dimension.levels_through(hierarchy, level),
            None => dimension.default_levels(hierarchy),
        }
    }
}

/// Join `from` with the latest value of each snapshot key per group, so that
/// only rows of the latest snapshot are aggregated.
fn latest_snapshot(from: FromItem, groups: &[SqlExpr], filters: &[SqlExpr], keys: &[SqlExpr]) -> FromItem {
    let mut subquery = SelectQuery {
        from: from.clone(),
        filters: filters.to_vec(),
        group_by: groups.to_vec(),
        ..SelectQuery::default()
    };
    let mut on = Vec::with_capacity(groups.len() + keys.len());
    let labeled = groups
        .iter()
        .enumerate()
        .map(|(i, expr)| (format!("__group_{i}"), expr.clone(), expr.clone()))
        .chain(keys.iter().enumerate().map(|(i, key)| {
            let latest = SqlExpr::Aggregate {
                agg: Aggregation::Max,
                expr: Some(Box::new(key.clone())),
            };
            (format!("__latest_{i}"), latest, key.clone())
        }));
    for (label, selected, outer) in labeled {
        on.push(SqlExpr::binary(
            SqlBinaryOperator::Eq,
            outer,
            SqlExpr::column(Some(SNAPSHOT_ALIAS), &label),
        ));
        subquery.select.push(SelectItem {
            expr: selected,
            alias: Some(label),
        });
    }
    FromItem::Join {
        join_type: SqlJoinType::Inner,
        left: Box::new(from),
        right: Box::new(FromItem::Subquery {
            query: Box::new(subquery),
            alias: SNAPSHOT_ALIAS.to_string(),
        }),
        on,
    }
}

/// Key of a level plus its order attribute when that differs.
fn level_columns(level: &Level) -> Vec<&Attribute> {
    let key = level.key();
    let order = level.order_attribute();
    if order.name == key.name {
        vec![key]
    } else {
        vec![key, order]
    }
}

/// User order first, then the natural order of anything not mentioned.
/// Every user item must name a selected column.
fn order_by(
    user: &[OrderSpec],
    selected: &[String],
    natural: &[(String, SortDirection)],
) -> Result<Vec<OrderItem>> {
    let mut items = Vec::new();
    let mut ordered: HashSet<&str> = HashSet::new();
    for spec in user {
        if !selected.iter().any(|s| s == &spec.attribute) {
            return Err(CubistError::Argument(format!(
                "cannot order by '{}': it is not a selected column",
                spec.attribute
            )));
        }
        if ordered.insert(spec.attribute.as_str()) {
            items.push(OrderItem {
                expr: SqlExpr::column(None, &spec.attribute),
                direction: spec.direction,
            });
        }
    }
    for (label, direction) in natural {
        if ordered.insert(label.as_str()) {
            items.push(OrderItem {
                expr: SqlExpr::column(None, label),
                direction: *direction,
            });
        }
    }
    Ok(items)
}
