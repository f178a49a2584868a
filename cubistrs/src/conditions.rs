//! Cell conditions (cuts) and their SQL predicates.
//!
//! A [`Condition`] names dimensions, hierarchies and levels by string.
//! [`Condition::bind`] resolves those names against a cube and yields a
//! [`BoundCondition`], which is the only form that can produce a predicate.
//!
//! Point and range conditions come in two flavours: a single level key
//! compared with scalar values, or a *path* of key values walking a
//! hierarchy from its top level down.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::model::{Attribute, Cube, Dimension, Level};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    /// Level key equals one of `values`, or the level keys along a
    /// hierarchy equal the components of `path`.
    Point {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hierarchy: Option<String>,
        #[serde(default)]
        level: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        values: Vec<Value>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<Value>,
        #[serde(default)]
        invert: bool,
    },
    /// Level key between `from` and `to`; inclusive unless `strong`.
    /// Array bounds are hierarchy paths compared level by level.
    Range {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hierarchy: Option<String>,
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        from: Option<Value>,
        #[serde(default)]
        to: Option<Value>,
        #[serde(default)]
        strong: bool,
        #[serde(default)]
        invert: bool,
    },
    /// Any of `paths` matches.
    Set {
        dimension: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hierarchy: Option<String>,
        paths: Vec<Vec<Value>>,
        #[serde(default)]
        invert: bool,
    },
    /// Level key matches a `LIKE` pattern.
    Match {
        dimension: String,
        #[serde(default)]
        level: Option<String>,
        pattern: String,
        #[serde(default)]
        invert: bool,
    },
    /// Any of the child conditions holds.
    Optional {
        conditions: Vec<Condition>,
        #[serde(default)]
        invert: bool,
    },
}

impl Condition {
    /// Parse a condition from JSON. A missing or unknown `type` is an
    /// argument error.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| CubistError::Argument(format!("invalid condition: {e}")))
    }

    pub fn point(dimension: &str, level: Option<&str>, values: Vec<Value>) -> Self {
        Condition::Point {
            dimension: dimension.to_string(),
            hierarchy: None,
            level: level.map(str::to_string),
            values,
            path: Vec::new(),
            invert: false,
        }
    }

    /// Point at the member addressed by `path` in `hierarchy`.
    pub fn path(dimension: &str, hierarchy: Option<&str>, path: Vec<Value>) -> Self {
        Condition::Point {
            dimension: dimension.to_string(),
            hierarchy: hierarchy.map(str::to_string),
            level: None,
            values: Vec::new(),
            path,
            invert: false,
        }
    }

    pub fn range(dimension: &str, level: Option<&str>, from: Option<Value>, to: Option<Value>) -> Self {
        Condition::Range {
            dimension: dimension.to_string(),
            hierarchy: None,
            level: level.map(str::to_string),
            from,
            to,
            strong: false,
            invert: false,
        }
    }

    /// Range between two hierarchy paths.
    pub fn path_range(
        dimension: &str,
        hierarchy: Option<&str>,
        from: Option<Vec<Value>>,
        to: Option<Vec<Value>>,
    ) -> Self {
        Condition::Range {
            dimension: dimension.to_string(),
            hierarchy: hierarchy.map(str::to_string),
            level: None,
            from: from.map(Value::Array),
            to: to.map(Value::Array),
            strong: false,
            invert: false,
        }
    }

    pub fn set(dimension: &str, hierarchy: Option<&str>, paths: Vec<Vec<Value>>) -> Self {
        Condition::Set {
            dimension: dimension.to_string(),
            hierarchy: hierarchy.map(str::to_string),
            paths,
            invert: false,
        }
    }

    pub fn matching(dimension: &str, level: Option<&str>, pattern: &str) -> Self {
        Condition::Match {
            dimension: dimension.to_string(),
            level: level.map(str::to_string),
            pattern: pattern.to_string(),
            invert: false,
        }
    }

    pub fn any_of(conditions: Vec<Condition>) -> Self {
        Condition::Optional {
            conditions,
            invert: false,
        }
    }

    /// Make the range bounds exclusive.
    pub fn strong(mut self) -> Self {
        if let Condition::Range { strong, .. } = &mut self {
            *strong = true;
        }
        self
    }

    pub fn inverted(mut self) -> Self {
        match &mut self {
            Condition::Point { invert, .. }
            | Condition::Range { invert, .. }
            | Condition::Set { invert, .. }
            | Condition::Match { invert, .. }
            | Condition::Optional { invert, .. } => *invert = !*invert,
        }
        self
    }

    pub fn bind<'c>(&self, cube: &'c Cube) -> Result<BoundCondition<'c>> {
        let (kind, invert) = match self {
            Condition::Point {
                dimension,
                hierarchy,
                level,
                values,
                path,
                invert,
            } => {
                let kind = match (values.is_empty(), path.is_empty()) {
                    (false, false) => {
                        return Err(CubistError::Argument(format!(
                            "point condition on '{dimension}' has both values and a path"
                        )))
                    }
                    (true, true) => {
                        return Err(CubistError::Argument(format!(
                            "point condition on '{dimension}' has no values"
                        )))
                    }
                    (false, true) => {
                        let level = resolve_level(cube, dimension, level.as_deref())?;
                        BoundKind::Point {
                            key: level.key(),
                            values: values.clone(),
                        }
                    }
                    (true, false) => {
                        reject_level(dimension, level.as_deref())?;
                        bind_path(cube, dimension, hierarchy.as_deref(), path)?
                    }
                };
                (kind, *invert)
            }
            Condition::Range {
                dimension,
                hierarchy,
                level,
                from,
                to,
                strong,
                invert,
            } => {
                if from.is_none() && to.is_none() {
                    return Err(CubistError::Argument(format!(
                        "range condition on '{dimension}' has neither bound"
                    )));
                }
                let is_path = |v: &Option<Value>| matches!(v, Some(Value::Array(_)));
                let kind = if is_path(from) || is_path(to) {
                    reject_level(dimension, level.as_deref())?;
                    let from = range_path(dimension, from)?;
                    let to = range_path(dimension, to)?;
                    let depth = from
                        .iter()
                        .chain(to.iter())
                        .map(Vec::len)
                        .max()
                        .unwrap_or(0);
                    let dim = cube.dimension(dimension)?;
                    BoundKind::PathRange {
                        keys: path_keys(dim, hierarchy.as_deref(), depth)?,
                        from,
                        to,
                        strong: *strong,
                    }
                } else {
                    let level = resolve_level(cube, dimension, level.as_deref())?;
                    BoundKind::Range {
                        key: level.key(),
                        from: from.clone(),
                        to: to.clone(),
                        strong: *strong,
                    }
                };
                (kind, *invert)
            }
            Condition::Set {
                dimension,
                hierarchy,
                paths,
                invert,
            } => {
                if paths.is_empty() {
                    return Err(CubistError::Argument(format!(
                        "set condition on '{dimension}' has no paths"
                    )));
                }
                let members = paths
                    .iter()
                    .map(|path| {
                        Ok(BoundCondition {
                            kind: bind_path(cube, dimension, hierarchy.as_deref(), path)?,
                            invert: false,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                (BoundKind::Optional(members), *invert)
            }
            Condition::Match {
                dimension,
                level,
                pattern,
                invert,
            } => {
                let level = resolve_level(cube, dimension, level.as_deref())?;
                (
                    BoundKind::Match {
                        key: level.key(),
                        pattern: pattern.clone(),
                    },
                    *invert,
                )
            }
            Condition::Optional { conditions, invert } => {
                if conditions.is_empty() {
                    return Err(CubistError::Argument(
                        "optional condition has no children".to_string(),
                    ));
                }
                let children = conditions
                    .iter()
                    .map(|c| c.bind(cube))
                    .collect::<Result<Vec<_>>>()?;
                (BoundKind::Optional(children), *invert)
            }
        };
        Ok(BoundCondition { kind, invert })
    }
}

fn resolve_level<'c>(cube: &'c Cube, dimension: &str, level: Option<&str>) -> Result<&'c Level> {
    let dim = cube.dimension(dimension)?;
    match level {
        Some(name) => dim.level(name),
        None => Ok(dim.default_level()),
    }
}

fn reject_level(dimension: &str, level: Option<&str>) -> Result<()> {
    match level {
        Some(level) => Err(CubistError::Argument(format!(
            "condition on '{dimension}' names level '{level}' and a path; \
             the path length selects the level"
        ))),
        None => Ok(()),
    }
}

fn path_keys<'c>(dim: &'c Dimension, hierarchy: Option<&str>, depth: usize) -> Result<Vec<&'c Attribute>> {
    Ok(dim
        .levels_for_path(hierarchy, depth)?
        .into_iter()
        .map(Level::key)
        .collect())
}

fn bind_path<'c>(
    cube: &'c Cube,
    dimension: &str,
    hierarchy: Option<&str>,
    path: &[Value],
) -> Result<BoundKind<'c>> {
    let dim = cube.dimension(dimension)?;
    Ok(BoundKind::Path {
        keys: path_keys(dim, hierarchy, path.len())?,
        values: path.to_vec(),
    })
}

/// A range bound in path form. Scalars may not be mixed with paths.
fn range_path(dimension: &str, bound: &Option<Value>) -> Result<Option<Vec<Value>>> {
    match bound {
        None => Ok(None),
        Some(Value::Array(items)) if items.is_empty() => Err(CubistError::Argument(format!(
            "range condition on '{dimension}' has an empty path"
        ))),
        Some(Value::Array(items)) => Ok(Some(items.clone())),
        Some(other) => Err(CubistError::Argument(format!(
            "range condition on '{dimension}' mixes a path with the scalar bound {other}"
        ))),
    }
}

#[derive(Debug, Clone)]
enum BoundKind<'c> {
    Point {
        key: &'c Attribute,
        values: Vec<Value>,
    },
    /// Level keys equal the path components, top-down.
    Path {
        keys: Vec<&'c Attribute>,
        values: Vec<Value>,
    },
    Range {
        key: &'c Attribute,
        from: Option<Value>,
        to: Option<Value>,
        strong: bool,
    },
    /// `keys` cover the longer of the two paths.
    PathRange {
        keys: Vec<&'c Attribute>,
        from: Option<Vec<Value>>,
        to: Option<Vec<Value>>,
        strong: bool,
    },
    Match {
        key: &'c Attribute,
        pattern: String,
    },
    Optional(Vec<BoundCondition<'c>>),
}

/// Condition resolved against a cube.
#[derive(Debug, Clone)]
pub struct BoundCondition<'c> {
    kind: BoundKind<'c>,
    invert: bool,
}

impl<'c> BoundCondition<'c> {
    /// Attributes the predicate reads.
    pub fn attributes(&self) -> Vec<&'c Attribute> {
        match &self.kind {
            BoundKind::Point { key, .. }
            | BoundKind::Range { key, .. }
            | BoundKind::Match { key, .. } => vec![*key],
            BoundKind::Path { keys, .. } | BoundKind::PathRange { keys, .. } => keys.clone(),
            BoundKind::Optional(children) => {
                children.iter().flat_map(BoundCondition::attributes).collect()
            }
        }
    }

    /// Build the predicate, reading attribute columns through `column`.
    pub fn evaluate<F>(&self, column: &mut F) -> Result<SqlExpr>
    where
        F: FnMut(&'c Attribute) -> Result<SqlExpr>,
    {
        let predicate = match &self.kind {
            BoundKind::Point { key, values } => {
                let col = column(*key)?;
                let equalities = values.iter().map(|v| equals(col.clone(), v)).collect();
                SqlExpr::fold(SqlBinaryOperator::Or, equalities).ok_or_else(|| {
                    CubistError::Argument("point condition has no values".to_string())
                })?
            }
            BoundKind::Path { keys, values } => {
                let equalities = keys
                    .iter()
                    .zip(values)
                    .map(|(key, v)| Ok(equals(column(*key)?, v)))
                    .collect::<Result<Vec<_>>>()?;
                SqlExpr::fold(SqlBinaryOperator::And, equalities).ok_or_else(|| {
                    CubistError::Argument("point condition has an empty path".to_string())
                })?
            }
            BoundKind::Range {
                key,
                from,
                to,
                strong,
            } => {
                let col = column(*key)?;
                let (lower, upper) = if *strong {
                    (SqlBinaryOperator::Gt, SqlBinaryOperator::Lt)
                } else {
                    (SqlBinaryOperator::Gte, SqlBinaryOperator::Lte)
                };
                let bounds = [(lower, from), (upper, to)]
                    .into_iter()
                    .filter_map(|(op, bound)| {
                        bound
                            .as_ref()
                            .map(|v| SqlExpr::binary(op, col.clone(), SqlExpr::Literal(v.clone())))
                    })
                    .collect();
                SqlExpr::fold(SqlBinaryOperator::And, bounds).ok_or_else(|| {
                    CubistError::Argument("range condition has neither bound".to_string())
                })?
            }
            BoundKind::PathRange {
                keys,
                from,
                to,
                strong,
            } => {
                let cols = keys
                    .iter()
                    .map(|key| column(*key))
                    .collect::<Result<Vec<_>>>()?;
                let bounds = [(true, from), (false, to)]
                    .into_iter()
                    .filter_map(|(lower, path)| {
                        path.as_deref()
                            .and_then(|path| boundary(&cols, path, lower, !*strong))
                    })
                    .collect();
                SqlExpr::fold(SqlBinaryOperator::And, bounds).ok_or_else(|| {
                    CubistError::Argument("range condition has neither bound".to_string())
                })?
            }
            BoundKind::Match { key, pattern } => SqlExpr::binary(
                SqlBinaryOperator::Like,
                column(*key)?,
                SqlExpr::Literal(Value::String(pattern.clone())),
            ),
            BoundKind::Optional(children) => {
                let parts = children
                    .iter()
                    .map(|c| c.evaluate(&mut *column))
                    .collect::<Result<Vec<_>>>()?;
                SqlExpr::fold(SqlBinaryOperator::Or, parts).ok_or_else(|| {
                    CubistError::Argument("optional condition has no children".to_string())
                })?
            }
        };
        Ok(if self.invert {
            SqlExpr::Not(Box::new(predicate))
        } else {
            predicate
        })
    }
}

fn equals(column: SqlExpr, value: &Value) -> SqlExpr {
    SqlExpr::binary(SqlBinaryOperator::Eq, column, SqlExpr::Literal(value.clone()))
}

/// Lexicographic bound of a hierarchy path: equal on every parent level and
/// past the bound on the last one, or past the bound on some parent.
/// Only the deepest comparison honours `inclusive`.
fn boundary(cols: &[SqlExpr], path: &[Value], lower: bool, inclusive: bool) -> Option<SqlExpr> {
    let (last, parents) = path.split_last()?;
    let op = match (lower, inclusive) {
        (true, true) => SqlBinaryOperator::Gte,
        (true, false) => SqlBinaryOperator::Gt,
        (false, true) => SqlBinaryOperator::Lte,
        (false, false) => SqlBinaryOperator::Lt,
    };
    let mut parts: Vec<SqlExpr> = cols
        .iter()
        .zip(parents)
        .map(|(col, v)| equals(col.clone(), v))
        .collect();
    parts.push(SqlExpr::binary(
        op,
        cols.get(parents.len())?.clone(),
        SqlExpr::Literal(last.clone()),
    ));
    let here = SqlExpr::fold(SqlBinaryOperator::And, parts)?;
    Some(match boundary(cols, parents, lower, false) {
        Some(outer) => SqlExpr::binary(SqlBinaryOperator::Or, here, outer),
        None => here,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DuckDbDialect;
    use crate::metadata::{CubeDef, DimensionDef, ModelDefaults};
    use crate::model::Model;
    use crate::sql_ast::SqlRenderer;
    use serde_json::json;

    fn model() -> Model {
        let dims: Vec<DimensionDef> = serde_yaml::from_str(
            r#"
- name: date
  levels: [year, month, day, week]
  hierarchies:
    - {name: ymd, levels: [year, month, day]}
    - {name: yw, levels: [year, week]}
- name: product
  attributes: [code, name]
"#,
        )
        .unwrap();
        let cubes: Vec<CubeDef> =
            serde_yaml::from_str("- {name: sales, dimensions: [date, product], measures: [amount]}")
                .unwrap();
        Model::build(&ModelDefaults::default(), dims, cubes).unwrap()
    }

    fn sql(condition: &Condition) -> Result<String> {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let bound = condition.bind(cube)?;
        let expr = bound.evaluate(&mut |attr: &Attribute| Ok(SqlExpr::column(None, &attr.reference())))?;
        Ok(SqlRenderer::new(&DuckDbDialect).render_expr(&expr))
    }

    #[test]
    fn point_is_or_of_equalities() {
        let c = Condition::point("date", Some("year"), vec![json!(2023), json!(2024)]);
        assert_eq!(
            sql(&c).unwrap(),
            "((\"date.year\" = 2023) OR (\"date.year\" = 2024))"
        );
        // default level
        let c = Condition::point("product", None, vec![json!("A1")]);
        assert_eq!(sql(&c).unwrap(), "(\"product.code\" = 'A1')");
    }

    #[test]
    fn point_path_walks_the_hierarchy() {
        let c = Condition::path("date", None, vec![json!(2024), json!(3)]);
        assert_eq!(
            sql(&c).unwrap(),
            "((\"date.year\" = 2024) AND (\"date.month\" = 3))"
        );
        let c = Condition::path("date", Some("yw"), vec![json!(2024), json!(12)]);
        assert_eq!(
            sql(&c).unwrap(),
            "((\"date.year\" = 2024) AND (\"date.week\" = 12))"
        );
        let c = Condition::path("date", None, vec![json!(2024)]).inverted();
        assert_eq!(sql(&c).unwrap(), "(NOT (\"date.year\" = 2024))");
    }

    #[test]
    fn range_bounds() {
        let c = Condition::range("date", Some("month"), Some(json!(3)), Some(json!(6)));
        assert_eq!(
            sql(&c).unwrap(),
            "((\"date.month\" >= 3) AND (\"date.month\" <= 6))"
        );
        let c = Condition::range("date", None, None, Some(json!(2020))).strong();
        assert_eq!(sql(&c).unwrap(), "(\"date.year\" < 2020)");
    }

    #[test]
    fn range_between_paths_is_lexicographic() {
        let c = Condition::path_range(
            "date",
            None,
            Some(vec![json!(2023), json!(6)]),
            Some(vec![json!(2024)]),
        );
        assert_eq!(
            sql(&c).unwrap(),
            "((((\"date.year\" = 2023) AND (\"date.month\" >= 6)) OR (\"date.year\" > 2023)) \
             AND (\"date.year\" <= 2024))"
        );

        let c = Condition::path_range(
            "date",
            None,
            None,
            Some(vec![json!(2024), json!(2), json!(10)]),
        )
        .strong();
        assert_eq!(
            sql(&c).unwrap(),
            "((((\"date.year\" = 2024) AND (\"date.month\" = 2)) AND (\"date.day\" < 10)) \
             OR (((\"date.year\" = 2024) AND (\"date.month\" < 2)) OR (\"date.year\" < 2024)))"
        );
    }

    #[test]
    fn set_is_or_of_paths() {
        let c = Condition::set(
            "date",
            None,
            vec![vec![json!(2023)], vec![json!(2024), json!(1)]],
        )
        .inverted();
        assert_eq!(
            sql(&c).unwrap(),
            "(NOT ((\"date.year\" = 2023) OR ((\"date.year\" = 2024) AND (\"date.month\" = 1))))"
        );
    }

    #[test]
    fn match_optional_and_invert() {
        let c = Condition::any_of(vec![
            Condition::matching("product", None, "A%"),
            Condition::point("date", None, vec![json!(2024)]).inverted(),
        ])
        .inverted();
        assert_eq!(
            sql(&c).unwrap(),
            "(NOT ((\"product.code\" LIKE 'A%') OR (NOT (\"date.year\" = 2024))))"
        );
    }

    #[test]
    fn bind_failures() {
        let err = sql(&Condition::point("store", None, vec![json!(1)])).unwrap_err();
        assert!(matches!(err, CubistError::NoSuchDimension(_)));

        let err = sql(&Condition::point("date", Some("hour"), vec![json!(1)])).unwrap_err();
        assert!(matches!(err, CubistError::NoSuchAttribute(_)));

        let err = sql(&Condition::point("date", None, vec![])).unwrap_err();
        assert!(matches!(err, CubistError::Argument(_)));

        let err = sql(&Condition::range("date", None, None, None)).unwrap_err();
        assert!(matches!(err, CubistError::Argument(_)));
    }

    #[test]
    fn path_failures() {
        // deeper than the hierarchy
        let c = Condition::path("date", Some("yw"), vec![json!(2024), json!(1), json!(1)]);
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));

        let c = Condition::path("date", Some("fiscal"), vec![json!(2024)]);
        assert!(sql(&c).unwrap_err().is_lookup());

        let c = Condition::set("date", None, vec![]);
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));
        let c = Condition::set("date", None, vec![vec![]]);
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));

        let c = Condition::range("date", None, Some(json!([2023])), Some(json!(2024)));
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));
        let c = Condition::range("date", None, Some(json!([])), None);
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));

        let c = Condition::Point {
            dimension: "date".to_string(),
            hierarchy: None,
            level: Some("year".to_string()),
            values: Vec::new(),
            path: vec![json!(2024)],
            invert: false,
        };
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));

        let c = Condition::Point {
            dimension: "date".to_string(),
            hierarchy: None,
            level: None,
            values: vec![json!(2024)],
            path: vec![json!(2024)],
            invert: false,
        };
        assert!(matches!(sql(&c).unwrap_err(), CubistError::Argument(_)));
    }

    #[test]
    fn parses_tagged_json() {
        let c = Condition::from_value(json!({
            "type": "range",
            "dimension": "date",
            "from": 2020,
            "strong": true
        }))
        .unwrap();
        assert!(matches!(c, Condition::Range { strong: true, to: None, .. }));

        let c = Condition::from_value(json!({
            "type": "set",
            "dimension": "date",
            "hierarchy": "yw",
            "paths": [[2024, 1], [2024, 2]]
        }))
        .unwrap();
        assert_eq!(
            c,
            Condition::set("date", Some("yw"), vec![vec![json!(2024), json!(1)], vec![json!(2024), json!(2)]])
        );

        let c = Condition::from_value(json!({"type": "point", "dimension": "date", "path": [2024, 5]}))
            .unwrap();
        assert_eq!(c, Condition::path("date", None, vec![json!(2024), json!(5)]));

        let err = Condition::from_value(json!({"type": "set", "dimension": "date"})).unwrap_err();
        assert!(matches!(err, CubistError::Argument(_)));
        let err = Condition::from_value(json!({"type": "between", "dimension": "date"})).unwrap_err();
        assert!(matches!(err, CubistError::Argument(_)));
    }
}
