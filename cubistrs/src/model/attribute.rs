use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::expr::{parse_expr, Expr};
use crate::metadata::{AggregateDef, AttributeObject, MeasureObject, SortDirection};

/// Dimension attribute or fact detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// Owning dimension; `None` for attributes living on the fact table.
    pub dimension: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
    pub order: Option<SortDirection>,
    pub format: Option<String>,
    pub missing_value: Option<Value>,
    pub locales: Vec<String>,
    pub expression: Option<Expr>,
    pub depends_on: BTreeSet<String>,
    pub info: Option<Value>,
}

impl Attribute {
    pub(crate) fn from_def(def: AttributeObject, dimension: Option<&str>) -> Result<Self> {
        check_name(&def.name, "attribute")?;
        let expression = def.expression.as_deref().map(parse_expr).transpose()?;
        // Unqualified identifiers in a dimension attribute refer to siblings.
        let expression = match (expression, dimension) {
            (Some(expr), Some(dim)) => Some(expr.map_idents(&|name: String| {
                if name.contains('.') {
                    name
                } else {
                    format!("{dim}.{name}")
                }
            })),
            (expr, _) => expr,
        };
        let depends_on = expression
            .as_ref()
            .map(Expr::variables)
            .unwrap_or_default();
        Ok(Self {
            name: def.name,
            dimension: dimension.map(str::to_string),
            label: def.label,
            description: def.description,
            order: def.order,
            format: def.format,
            missing_value: def.missing_value,
            locales: def.locales,
            expression,
            depends_on,
            info: def.info,
        })
    }

    /// Fully qualified logical reference: `dimension.attribute` or bare `name`.
    pub fn reference(&self) -> String {
        match &self.dimension {
            Some(dim) => format!("{dim}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn is_base(&self) -> bool {
        self.expression.is_none()
    }

    pub fn is_localizable(&self) -> bool {
        !self.locales.is_empty()
    }

    /// Locale to use for `requested`: the requested one when supported,
    /// otherwise the first declared locale.
    pub fn locale_for(&self, requested: Option<&str>) -> Option<&str> {
        let first = self.locales.first()?;
        let chosen = requested
            .and_then(|loc| self.locales.iter().find(|l| l.as_str() == loc))
            .unwrap_or(first);
        Some(chosen.as_str())
    }
}

/// Whether a measure may be summed along every dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Additivity {
    #[default]
    Additive,
    /// Snapshot values: never summed over time, aggregates read the latest
    /// time member of each cell.
    NonAdditiveTime,
}

impl Additivity {
    fn parse(value: Option<&str>, measure: &str) -> Result<Self> {
        match value {
            None | Some("none") => Ok(Additivity::Additive),
            Some("time") => Ok(Additivity::NonAdditiveTime),
            Some(other @ ("all" | "any")) => Err(CubistError::Model(format!(
                "measure '{measure}' is non-additive over '{other}'; only 'time' is supported"
            ))),
            Some(other) => Err(CubistError::Model(format!(
                "measure '{measure}' has unknown non-additivity '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub order: Option<SortDirection>,
    pub format: Option<String>,
    pub missing_value: Option<Value>,
    pub expression: Option<Expr>,
    pub depends_on: BTreeSet<String>,
    /// Functions for which default aggregates are generated.
    pub aggregates: Vec<String>,
    pub additivity: Additivity,
    pub info: Option<Value>,
}

impl Measure {
    pub(crate) fn from_def(def: MeasureObject) -> Result<Self> {
        check_name(&def.name, "measure")?;
        let expression = def.expression.as_deref().map(parse_expr).transpose()?;
        let depends_on = expression
            .as_ref()
            .map(Expr::variables)
            .unwrap_or_default();
        let additivity = Additivity::parse(def.nonadditive.as_deref(), &def.name)?;
        Ok(Self {
            name: def.name,
            label: def.label,
            description: def.description,
            order: def.order,
            format: def.format,
            missing_value: def.missing_value,
            expression,
            depends_on,
            aggregates: def.aggregates,
            additivity,
            info: def.info,
        })
    }

    pub fn is_base(&self) -> bool {
        self.expression.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub name: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub function: Option<String>,
    pub expression: Option<Expr>,
    /// Function arguments in call order, or the identifiers of `expression`.
    pub depends_on: Vec<String>,
    pub order: Option<SortDirection>,
    pub format: Option<String>,
    pub missing_value: Option<Value>,
    pub info: Option<Value>,
}

impl Aggregate {
    pub(crate) fn from_def(def: AggregateDef) -> Result<Self> {
        check_name(&def.name, "aggregate")?;
        let expression = def.expression.as_deref().map(parse_expr).transpose()?;
        let has_deps = !def.depends_on.is_empty();
        let depends_on = match (&expression, def.measure) {
            (Some(_), Some(_)) => {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' has an expression and explicit dependencies",
                    def.name
                )))
            }
            (Some(_), None) if has_deps => {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' has an expression and explicit dependencies",
                    def.name
                )))
            }
            (Some(expr), None) => expr.variables().into_iter().collect(),
            (None, Some(_)) if has_deps => {
                return Err(CubistError::Model(format!(
                    "aggregate '{}' has both 'measure' and 'depends_on'",
                    def.name
                )))
            }
            (None, Some(measure)) => vec![measure],
            (None, None) => def.depends_on,
        };
        Ok(Self {
            name: def.name,
            label: def.label,
            description: def.description,
            function: def.function,
            expression,
            depends_on,
            order: def.order,
            format: def.format,
            missing_value: def.missing_value,
            info: def.info,
        })
    }

    /// Default aggregate `<measure>_<function>` for a measure.
    pub(crate) fn for_measure(measure: &Measure, function: &str) -> Self {
        let depends_on = if function == "count" {
            Vec::new()
        } else {
            vec![measure.name.clone()]
        };
        Self {
            name: format!("{}_{function}", measure.name),
            label: None,
            description: None,
            function: Some(function.to_string()),
            expression: None,
            depends_on,
            order: None,
            format: measure.format.clone(),
            missing_value: None,
            info: None,
        }
    }

    pub(crate) fn record_count() -> Self {
        Self {
            name: "record_count".to_string(),
            label: Some("Count".to_string()),
            description: None,
            function: Some("count".to_string()),
            expression: None,
            depends_on: Vec::new(),
            order: None,
            format: None,
            missing_value: None,
            info: None,
        }
    }
}

/// Borrowed view over any attribute-like entity of a cube.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeRef<'a> {
    Attribute(&'a Attribute),
    Measure(&'a Measure),
    Aggregate(&'a Aggregate),
}

impl<'a> AttributeRef<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            AttributeRef::Attribute(a) => &a.name,
            AttributeRef::Measure(m) => &m.name,
            AttributeRef::Aggregate(a) => &a.name,
        }
    }

    pub fn reference(&self) -> String {
        match *self {
            AttributeRef::Attribute(a) => a.reference(),
            other => other.name().to_string(),
        }
    }

    pub fn dimension(&self) -> Option<&'a str> {
        match *self {
            AttributeRef::Attribute(a) => a.dimension.as_deref(),
            _ => None,
        }
    }

    pub fn locales(&self) -> &'a [String] {
        match *self {
            AttributeRef::Attribute(a) => &a.locales,
            _ => &[],
        }
    }

    pub fn locale_for(&self, requested: Option<&str>) -> Option<&'a str> {
        match *self {
            AttributeRef::Attribute(a) => a.locale_for(requested),
            _ => None,
        }
    }

    /// True when the value comes straight from a physical column.
    pub fn is_base(&self) -> bool {
        match *self {
            AttributeRef::Attribute(a) => a.is_base(),
            AttributeRef::Measure(m) => m.is_base(),
            AttributeRef::Aggregate(_) => false,
        }
    }

    pub fn dependencies(&self) -> BTreeSet<String> {
        match *self {
            AttributeRef::Attribute(a) => a.depends_on.clone(),
            AttributeRef::Measure(m) => m.depends_on.clone(),
            AttributeRef::Aggregate(a) => a.depends_on.iter().cloned().collect(),
        }
    }

    pub fn expression(&self) -> Option<&'a Expr> {
        match *self {
            AttributeRef::Attribute(a) => a.expression.as_ref(),
            AttributeRef::Measure(m) => m.expression.as_ref(),
            AttributeRef::Aggregate(a) => a.expression.as_ref(),
        }
    }

    pub fn missing_value(&self) -> Option<&'a Value> {
        match *self {
            AttributeRef::Attribute(a) => a.missing_value.as_ref(),
            AttributeRef::Measure(m) => m.missing_value.as_ref(),
            AttributeRef::Aggregate(a) => a.missing_value.as_ref(),
        }
    }

    pub fn order(&self) -> SortDirection {
        let order = match *self {
            AttributeRef::Attribute(a) => a.order,
            AttributeRef::Measure(m) => m.order,
            AttributeRef::Aggregate(a) => a.order,
        };
        order.unwrap_or_default()
    }
}

pub(crate) fn check_name(name: &str, kind: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ');
    if valid {
        Ok(())
    } else {
        Err(CubistError::Model(format!("invalid {kind} name '{name}'")))
    }
}
