use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::aggregates::aggregate_function;
use crate::depsort::{depsort, DependencyMap};
use crate::error::{CubistError, Result};
use crate::metadata::{ColumnSpec, CubeDef, CubeOptions};
use crate::star::JoinSpec;

use super::attribute::{check_name, Additivity, Aggregate, Attribute, AttributeRef, Measure};
use super::dimension::Dimension;

/// Analyzable fact table with its dimensions, measures and aggregates.
///
/// A `Cube` is only obtainable through [`Cube::from_def`], which validates
/// every reference before returning.
#[derive(Debug, Clone)]
pub struct Cube {
    name: String,
    label: Option<String>,
    description: Option<String>,
    fact: Option<String>,
    key: Option<String>,
    store: Option<String>,
    dimensions: Vec<Arc<Dimension>>,
    measures: Vec<Measure>,
    aggregates: Vec<Aggregate>,
    details: Vec<Attribute>,
    mappings: BTreeMap<String, ColumnSpec>,
    joins: Vec<JoinSpec>,
    options: CubeOptions,
    info: Option<Value>,
}

impl Cube {
    pub fn from_def(def: &CubeDef, dimensions: &BTreeMap<String, Arc<Dimension>>) -> Result<Self> {
        check_name(&def.name, "cube")?;
        let cube_name = def.name.as_str();

        let mut cube_dims = Vec::with_capacity(def.dimensions.len());
        let mut dim_names = HashSet::new();
        for name in &def.dimensions {
            if !dim_names.insert(name.as_str()) {
                return Err(CubistError::Model(format!(
                    "dimension '{name}' listed twice in cube '{cube_name}'"
                )));
            }
            let dim = dimensions.get(name).ok_or_else(|| {
                CubistError::Model(format!(
                    "cube '{cube_name}' uses unknown dimension '{name}'"
                ))
            })?;
            cube_dims.push(Arc::clone(dim));
        }

        let measures = def
            .measures
            .iter()
            .cloned()
            .map(|m| Measure::from_def(m.into_object()))
            .collect::<Result<Vec<_>>>()?;
        let details = def
            .details
            .iter()
            .cloned()
            .map(|a| Attribute::from_def(a.into_object(), None))
            .collect::<Result<Vec<_>>>()?;
        let mut aggregates = def
            .aggregates
            .iter()
            .cloned()
            .map(Aggregate::from_def)
            .collect::<Result<Vec<_>>>()?;

        for measure in &measures {
            for function in &measure.aggregates {
                let name = format!("{}_{function}", measure.name);
                if !aggregates.iter().any(|a| a.name == name) {
                    aggregates.push(Aggregate::for_measure(measure, function));
                }
            }
        }
        if aggregates.is_empty() {
            aggregates.push(Aggregate::record_count());
        }

        let joins = def
            .joins
            .iter()
            .map(|j| j.to_join_spec())
            .collect::<Result<Vec<_>>>()?;
        for join in &joins {
            if join.master.columns.len() != join.detail.columns.len() {
                return Err(CubistError::Model(format!(
                    "join to '{}' in cube '{cube_name}' has {} master and {} detail key columns",
                    join.detail_label(),
                    join.master.columns.len(),
                    join.detail.columns.len()
                )));
            }
        }

        let cube = Self {
            name: def.name.clone(),
            label: def.label.clone(),
            description: def.description.clone(),
            fact: def.fact.clone(),
            key: def.key.clone(),
            store: def.store.clone(),
            dimensions: cube_dims,
            measures,
            aggregates,
            details,
            mappings: def.mappings.clone(),
            joins,
            options: def.options.clone(),
            info: def.info.clone(),
        };
        cube.validate()?;
        Ok(cube)
    }

    fn validate(&self) -> Result<()> {
        let mut fact_names = HashSet::new();
        let names = self
            .details
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.measures.iter().map(|m| m.name.as_str()))
            .chain(self.aggregates.iter().map(|a| a.name.as_str()));
        for name in names {
            if !fact_names.insert(name) {
                return Err(CubistError::Model(format!(
                    "duplicate attribute '{name}' in cube '{}'",
                    self.name
                )));
            }
        }

        let is_fact_value = |name: &str| {
            self.measures.iter().any(|m| m.name == name)
                || self.details.iter().any(|d| d.name == name)
        };
        for (what, name, deps) in self
            .measures
            .iter()
            .map(|m| ("measure", &m.name, &m.depends_on))
            .chain(self.details.iter().map(|d| ("detail", &d.name, &d.depends_on)))
        {
            if let Some(missing) = deps.iter().find(|d| !is_fact_value(d)) {
                return Err(CubistError::Model(format!(
                    "{what} '{name}' in cube '{}' refers to unknown attribute '{missing}'",
                    self.name
                )));
            }
        }

        for agg in &self.aggregates {
            self.validate_aggregate(agg)?;
        }

        if let Some(key) = self.mappings.keys().find(|k| !self.maps_attribute(k)) {
            return Err(CubistError::Model(format!(
                "mapping '{key}' in cube '{}' does not name an attribute of the cube",
                self.name
            )));
        }

        let deps = self.dependency_map();
        let all: Vec<&String> = deps.keys().collect();
        depsort(&all, &deps)?;
        Ok(())
    }

    /// Whether a mapping key is `<reference>` or `<reference>.<locale>` of an
    /// attribute or measure of this cube.
    fn maps_attribute(&self, key: &str) -> bool {
        let mappable = |reference: &str| match self.attribute(reference) {
            Ok(AttributeRef::Attribute(attr)) => Some(attr.locales.as_slice()),
            Ok(AttributeRef::Measure(_)) => Some(&[][..]),
            _ => None,
        };
        if mappable(key).is_some() {
            return true;
        }
        key.rsplit_once('.')
            .and_then(|(reference, locale)| {
                mappable(reference).map(|locales| locales.iter().any(|l| l == locale))
            })
            .unwrap_or(false)
    }

    /// Add model-wide mappings that name attributes of this cube. The cube's
    /// own mappings take precedence; the rest are ignored.
    pub(crate) fn with_shared_mappings(mut self, shared: &BTreeMap<String, ColumnSpec>) -> Self {
        for (key, spec) in shared {
            if !self.mappings.contains_key(key) && self.maps_attribute(key) {
                self.mappings.insert(key.clone(), spec.clone());
            }
        }
        self
    }

    fn validate_aggregate(&self, agg: &Aggregate) -> Result<()> {
        let cube = &self.name;
        match (&agg.function, &agg.expression) {
            (Some(_), Some(_)) => {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' in cube '{cube}' has both a function and an expression",
                    agg.name
                )))
            }
            (None, None) => {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' in cube '{cube}' has neither a function nor an expression",
                    agg.name
                )))
            }
            (Some(function), None) => {
                let func = aggregate_function(function).ok_or_else(|| {
                    CubistError::Model(format!(
                        "aggregate '{}' in cube '{cube}' uses unknown function '{function}'",
                        agg.name
                    ))
                })?;
                func.check_arity(&agg.name, agg.depends_on.len())?;
                let is_aggregate = |dep: &String| self.aggregates.iter().any(|a| &a.name == dep);
                let misplaced = if func.is_post_aggregate() {
                    agg.depends_on.iter().find(|d| !is_aggregate(d))
                } else {
                    agg.depends_on.iter().find(|d| is_aggregate(d))
                };
                if let Some(dep) = misplaced {
                    let expected = if func.is_post_aggregate() {
                        "aggregates"
                    } else {
                        "measures or details"
                    };
                    return Err(CubistError::Model(format!(
                        "aggregate '{}' in cube '{cube}' applies '{function}' to '{dep}'; \
                         its arguments must be {expected}",
                        agg.name
                    )));
                }
            }
            (None, Some(_)) => {
                if agg.depends_on.is_empty() {
                    return Err(CubistError::Model(format!(
                        "aggregate expression '{}' in cube '{cube}' references nothing",
                        agg.name
                    )));
                }
                let is_aggregate = |dep: &String| self.aggregates.iter().any(|a| &a.name == dep);
                if let Some(dep) = agg.depends_on.iter().find(|d| !is_aggregate(d)) {
                    return Err(CubistError::Model(format!(
                        "aggregate expression '{}' in cube '{cube}' refers to '{dep}', \
                         which is not an aggregate",
                        agg.name
                    )));
                }
            }
        }
        for dep in &agg.depends_on {
            let known = self.measures.iter().any(|m| &m.name == dep)
                || self.aggregates.iter().any(|a| &a.name == dep)
                || self.details.iter().any(|d| &d.name == dep);
            if !known {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' in cube '{cube}' depends on unknown '{dep}'",
                    agg.name
                )));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Explicit physical fact table name, if configured.
    pub fn fact(&self) -> Option<&str> {
        self.fact.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter().map(|d| d.as_ref())
    }

    pub fn measures(&self) -> &[Measure] {
        &self.measures
    }

    pub fn aggregates(&self) -> &[Aggregate] {
        &self.aggregates
    }

    pub fn details(&self) -> &[Attribute] {
        &self.details
    }

    pub fn mappings(&self) -> &BTreeMap<String, ColumnSpec> {
        &self.mappings
    }

    pub fn joins(&self) -> &[JoinSpec] {
        &self.joins
    }

    pub fn options(&self) -> &CubeOptions {
        &self.options
    }

    pub fn dimension(&self, name: &str) -> Result<&Dimension> {
        self.dimensions()
            .find(|d| d.name() == name)
            .ok_or_else(|| CubistError::NoSuchDimension(format!("{name} in cube {}", self.name)))
    }

    pub fn measure(&self, name: &str) -> Result<&Measure> {
        self.measures.iter().find(|m| m.name == name).ok_or_else(|| {
            CubistError::NoSuchAttribute(format!("measure '{name}' in cube {}", self.name))
        })
    }

    pub fn aggregate(&self, name: &str) -> Result<&Aggregate> {
        self.aggregates.iter().find(|a| a.name == name).ok_or_else(|| {
            CubistError::NoSuchAttribute(format!("aggregate '{name}' in cube {}", self.name))
        })
    }

    /// Look up any attribute by logical reference: `dimension.attribute` for
    /// dimension attributes, a bare name for details, measures and aggregates.
    pub fn attribute(&self, reference: &str) -> Result<AttributeRef<'_>> {
        if let Some((dim, attr)) = reference.split_once('.') {
            let dimension = self.dimension(dim)?;
            return dimension
                .attribute(attr)
                .map(AttributeRef::Attribute)
                .map_err(|_| CubistError::NoSuchAttribute(reference.to_string()));
        }
        if let Some(d) = self.details.iter().find(|d| d.name == reference) {
            return Ok(AttributeRef::Attribute(d));
        }
        if let Some(m) = self.measures.iter().find(|m| m.name == reference) {
            return Ok(AttributeRef::Measure(m));
        }
        if let Some(a) = self.aggregates.iter().find(|a| a.name == reference) {
            return Ok(AttributeRef::Aggregate(a));
        }
        // A plain dimension may be referred to by its own name.
        if let Ok(dim) = self.dimension(reference) {
            if dim.is_plain() {
                return Ok(AttributeRef::Attribute(dim.default_level().key()));
            }
        }
        Err(CubistError::NoSuchAttribute(format!(
            "{reference} in cube {}",
            self.name
        )))
    }

    /// Whether an aggregate reads, directly or through other aggregates, a
    /// measure that must not be summed over time.
    pub fn is_nonadditive_over_time(&self, aggregate: &Aggregate) -> bool {
        let mut pending: Vec<&str> = aggregate.depends_on.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        while let Some(name) = pending.pop() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(measure) = self.measures.iter().find(|m| m.name == name) {
                if measure.additivity == Additivity::NonAdditiveTime {
                    return true;
                }
                pending.extend(measure.depends_on.iter().map(String::as_str));
            } else if let Some(agg) = self.aggregates.iter().find(|a| a.name == name) {
                pending.extend(agg.depends_on.iter().map(String::as_str));
            }
        }
        false
    }

    /// Time-role dimensions of the cube, in declaration order.
    pub fn time_dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions().filter(|d| d.role() == Some("time"))
    }

    /// Direct dependencies of every attribute, measure and aggregate, keyed by
    /// logical reference.
    pub fn dependency_map(&self) -> DependencyMap {
        let mut map = DependencyMap::new();
        for dim in self.dimensions() {
            for attr in dim.attributes() {
                map.insert(attr.reference(), attr.depends_on.clone());
            }
        }
        for attr in &self.details {
            map.insert(attr.reference(), attr.depends_on.clone());
        }
        for measure in &self.measures {
            map.insert(measure.name.clone(), measure.depends_on.clone());
        }
        for agg in &self.aggregates {
            map.insert(
                agg.name.clone(),
                agg.depends_on.iter().cloned().collect::<BTreeSet<_>>(),
            );
        }
        map
    }

    /// Attributes listed in a fact listing when none are requested:
    /// dimension attributes, details and measures.
    pub fn fact_attributes(&self) -> Vec<AttributeRef<'_>> {
        self.dimensions()
            .flat_map(|d| d.attributes().map(AttributeRef::Attribute))
            .chain(self.details.iter().map(AttributeRef::Attribute))
            .chain(self.measures.iter().map(AttributeRef::Measure))
            .collect()
    }
}
