//! Serialized model descriptions as they appear in YAML/JSON model files.
//!
//! These are loose input shapes. `crate::model` turns them into validated,
//! immutable entities; nothing here is used while compiling queries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::mapper::ColumnReference;
use crate::star::{JoinKey, JoinMethod, JoinSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Physical column locator in any of its accepted spellings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    /// `column`, `table.column` or `schema.table.column`
    Path(String),
    /// `[table, column]` or `[schema, table, column]`
    Parts(Vec<String>),
    Object(ColumnObject),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnObject {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    pub column: String,
    #[serde(default)]
    pub extract: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
}

impl ColumnSpec {
    /// Parse into a column reference. Missing table and schema fall back to
    /// the given defaults.
    pub fn to_column_reference(
        &self,
        default_table: Option<&str>,
        default_schema: Option<&str>,
    ) -> Result<ColumnReference> {
        let (schema, table, column, extract, function) = match self {
            ColumnSpec::Path(path) => {
                let parts: Vec<&str> = path.split('.').collect();
                match parts.as_slice() {
                    [column] => (None, None, column.to_string(), None, None),
                    [table, column] => (
                        None,
                        Some(table.to_string()),
                        column.to_string(),
                        None,
                        None,
                    ),
                    [schema, table, column] => (
                        Some(schema.to_string()),
                        Some(table.to_string()),
                        column.to_string(),
                        None,
                        None,
                    ),
                    _ => {
                        return Err(CubistError::Argument(format!(
                            "column reference '{path}' must have 1 to 3 dot-separated parts"
                        )))
                    }
                }
            }
            ColumnSpec::Parts(parts) => match parts.as_slice() {
                [table, column] => (None, Some(table.clone()), column.clone(), None, None),
                [schema, table, column] => (
                    Some(schema.clone()),
                    Some(table.clone()),
                    column.clone(),
                    None,
                    None,
                ),
                _ => {
                    return Err(CubistError::Argument(format!(
                        "column reference list must have 2 or 3 elements, got {}",
                        parts.len()
                    )))
                }
            },
            ColumnSpec::Object(obj) => {
                if obj.extract.is_some() && obj.function.is_some() {
                    return Err(CubistError::Argument(format!(
                        "column '{}' cannot have both extract and function",
                        obj.column
                    )));
                }
                (
                    obj.schema.clone(),
                    obj.table.clone(),
                    obj.column.clone(),
                    obj.extract.clone(),
                    obj.function.clone(),
                )
            }
        };
        if column.is_empty() {
            return Err(CubistError::Argument(
                "column reference has an empty column name".to_string(),
            ));
        }
        Ok(ColumnReference {
            schema: schema.or_else(|| default_schema.map(str::to_string)),
            table: table.or_else(|| default_table.map(str::to_string)),
            column,
            extract,
            function,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// One side of a join in any of its accepted spellings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum JoinKeySpec {
    Path(String),
    Parts(Vec<String>),
    Object(JoinKeyObject),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JoinKeyObject {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    pub column: OneOrMany,
}

impl JoinKeySpec {
    pub fn to_join_key(&self) -> Result<JoinKey> {
        let key = match self {
            JoinKeySpec::Path(path) => single_column_key(ColumnSpec::Path(path.clone()))?,
            JoinKeySpec::Parts(parts) => single_column_key(ColumnSpec::Parts(parts.clone()))?,
            JoinKeySpec::Object(obj) => JoinKey {
                schema: obj.schema.clone(),
                table: obj.table.clone(),
                columns: obj.column.clone().into_vec(),
            },
        };
        if key.columns.is_empty() || key.columns.iter().any(String::is_empty) {
            return Err(CubistError::Argument(
                "join key must name at least one column".to_string(),
            ));
        }
        Ok(key)
    }
}

fn single_column_key(spec: ColumnSpec) -> Result<JoinKey> {
    let column = spec.to_column_reference(None, None)?;
    Ok(JoinKey {
        schema: column.schema,
        table: column.table,
        columns: vec![column.column],
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JoinDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub master: Option<JoinKeySpec>,
    #[serde(default)]
    pub detail: Option<JoinKeySpec>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub method: Option<JoinMethod>,
}

impl JoinDef {
    /// Key used to match joins when merging model-wide and cube joins.
    pub fn merge_key(&self) -> Option<String> {
        if let Some(name) = &self.name {
            return Some(name.clone());
        }
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        match &self.detail {
            Some(JoinKeySpec::Object(obj)) => obj.table.clone(),
            Some(detail) => detail.to_join_key().ok().and_then(|k| k.table),
            None => None,
        }
    }

    /// Field-wise overlay: values set on `overlay` win.
    pub fn merge(&self, overlay: &JoinDef) -> JoinDef {
        JoinDef {
            name: overlay.name.clone().or_else(|| self.name.clone()),
            master: overlay.master.clone().or_else(|| self.master.clone()),
            detail: overlay.detail.clone().or_else(|| self.detail.clone()),
            alias: overlay.alias.clone().or_else(|| self.alias.clone()),
            method: overlay.method.or(self.method),
        }
    }

    pub fn to_join_spec(&self) -> Result<JoinSpec> {
        let label = self
            .merge_key()
            .unwrap_or_else(|| "<unnamed>".to_string());
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| CubistError::Model(format!("join '{label}' has no master")))?
            .to_join_key()?;
        let detail = self
            .detail
            .as_ref()
            .ok_or_else(|| CubistError::Model(format!("join '{label}' has no detail")))?
            .to_join_key()?;
        if detail.table.is_none() {
            return Err(CubistError::Model(format!(
                "join '{label}' detail must name a table"
            )));
        }
        Ok(JoinSpec {
            master,
            detail,
            alias: self.alias.clone(),
            method: self.method.unwrap_or_default(),
        })
    }
}

/// Merge model-wide joins with cube joins. Joins with the same merge key are
/// combined field by field with the cube entry winning; the rest are kept in
/// declaration order, model joins first.
pub fn merge_joins(base: &[JoinDef], overlay: &[JoinDef]) -> Vec<JoinDef> {
    let mut merged: Vec<JoinDef> = base.to_vec();
    for join in overlay {
        let key = join.merge_key();
        let existing = key
            .as_ref()
            .and_then(|k| merged.iter().position(|j| j.merge_key().as_ref() == Some(k)));
        match existing {
            Some(idx) => merged[idx] = merged[idx].merge(join),
            None => merged.push(join.clone()),
        }
    }
    merged
}

/// Merge mapping dictionaries; entries in `overlay` replace those in `base`.
pub fn merge_mappings(
    base: &BTreeMap<String, ColumnSpec>,
    overlay: &BTreeMap<String, ColumnSpec>,
) -> BTreeMap<String, ColumnSpec> {
    let mut merged = base.clone();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Per-cube naming overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CubeOptions {
    pub schema: Option<String>,
    pub fact_schema: Option<String>,
    pub dimension_schema: Option<String>,
    pub fact_prefix: Option<String>,
    pub fact_suffix: Option<String>,
    pub dimension_prefix: Option<String>,
    pub dimension_suffix: Option<String>,
    pub denormalized_view: Option<String>,
    pub denormalized_view_schema: Option<String>,
    pub simplify_dimension_references: Option<bool>,
}

impl CubeOptions {
    pub fn merge(&self, overlay: &CubeOptions) -> CubeOptions {
        fn pick<T: Clone>(over: &Option<T>, base: &Option<T>) -> Option<T> {
            over.clone().or_else(|| base.clone())
        }
        CubeOptions {
            schema: pick(&overlay.schema, &self.schema),
            fact_schema: pick(&overlay.fact_schema, &self.fact_schema),
            dimension_schema: pick(&overlay.dimension_schema, &self.dimension_schema),
            fact_prefix: pick(&overlay.fact_prefix, &self.fact_prefix),
            fact_suffix: pick(&overlay.fact_suffix, &self.fact_suffix),
            dimension_prefix: pick(&overlay.dimension_prefix, &self.dimension_prefix),
            dimension_suffix: pick(&overlay.dimension_suffix, &self.dimension_suffix),
            denormalized_view: pick(&overlay.denormalized_view, &self.denormalized_view),
            denormalized_view_schema: pick(
                &overlay.denormalized_view_schema,
                &self.denormalized_view_schema,
            ),
            simplify_dimension_references: pick(
                &overlay.simplify_dimension_references,
                &self.simplify_dimension_references,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttributeDef {
    Name(String),
    Full(AttributeObject),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeObject {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub order: Option<SortDirection>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub missing_value: Option<Value>,
    #[serde(default)]
    pub locales: Vec<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

impl AttributeDef {
    pub fn into_object(self) -> AttributeObject {
        match self {
            AttributeDef::Name(name) => AttributeObject {
                name,
                ..AttributeObject::default()
            },
            AttributeDef::Full(obj) => obj,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LevelDef {
    Name(String),
    Full(LevelObject),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LevelObject {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub order_attribute: Option<String>,
    #[serde(default)]
    pub label_attribute: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

impl LevelDef {
    pub fn into_object(self) -> LevelObject {
        match self {
            LevelDef::Name(name) => LevelObject {
                name,
                ..LevelObject::default()
            },
            LevelDef::Full(obj) => obj,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub levels: Vec<LevelDef>,
    /// Attributes of the implicit single level when `levels` is empty.
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    #[serde(default)]
    pub default_level: Option<String>,
    /// Named level orderings; one hierarchy over all levels when empty.
    #[serde(default)]
    pub hierarchies: Vec<HierarchyDef>,
    #[serde(default)]
    pub default_hierarchy_name: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

/// Ordered subset of a dimension's levels, top-down.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HierarchyDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub levels: Vec<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MeasureDef {
    Name(String),
    Full(MeasureObject),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureObject {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub order: Option<SortDirection>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub missing_value: Option<Value>,
    #[serde(default)]
    pub expression: Option<String>,
    /// Functions used to derive default aggregates named `<measure>_<function>`.
    #[serde(default)]
    pub aggregates: Vec<String>,
    #[serde(default)]
    pub nonadditive: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

impl MeasureDef {
    pub fn into_object(self) -> MeasureObject {
        match self {
            MeasureDef::Name(name) => MeasureObject {
                name,
                ..MeasureObject::default()
            },
            MeasureDef::Full(obj) => obj,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    /// Shorthand for a single dependency.
    #[serde(default)]
    pub measure: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub order: Option<SortDirection>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub missing_value: Option<Value>,
    #[serde(default)]
    pub info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CubeDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Physical fact table name; derived from the cube name when absent.
    #[serde(default)]
    pub fact: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub measures: Vec<MeasureDef>,
    #[serde(default)]
    pub aggregates: Vec<AggregateDef>,
    #[serde(default)]
    pub details: Vec<AttributeDef>,
    #[serde(default)]
    pub mappings: BTreeMap<String, ColumnSpec>,
    #[serde(default)]
    pub joins: Vec<JoinDef>,
    #[serde(default)]
    pub options: CubeOptions,
    #[serde(default)]
    pub info: Option<Value>,
}

/// Model-wide defaults inherited by every cube.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelDefaults {
    pub name: Option<String>,
    pub label: Option<String>,
    pub mappings: BTreeMap<String, ColumnSpec>,
    pub joins: Vec<JoinDef>,
    pub options: CubeOptions,
    pub info: Option<Value>,
}

impl ModelDefaults {
    /// Apply the defaults to a cube definition.
    pub fn apply(&self, cube: &CubeDef) -> CubeDef {
        CubeDef {
            mappings: merge_mappings(&self.mappings, &cube.mappings),
            joins: merge_joins(&self.joins, &cube.joins),
            options: self.options.merge(&cube.options),
            ..cube.clone()
        }
    }
}
