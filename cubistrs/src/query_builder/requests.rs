use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::metadata::SortDirection;

/// Aggregation over a cell, optionally drilled down.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AggregateRequest {
    pub cube: String,
    /// Aggregate names; empty means every aggregate of the cube.
    #[serde(default)]
    pub aggregates: Vec<String>,
    #[serde(default)]
    pub drilldown: Vec<Drilldown>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order: Vec<OrderSpec>,
    /// Zero-based page number. Ignored without drilldown.
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Fact rows of a cell.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FactsRequest {
    pub cube: String,
    /// Attribute references; empty means the cube key and all fact attributes.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order: Vec<OrderSpec>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Distinct members of a dimension.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MembersRequest {
    pub cube: String,
    pub dimension: String,
    /// Hierarchy to walk; the dimension's default hierarchy when absent.
    #[serde(default)]
    pub hierarchy: Option<String>,
    /// Deepest level to list; the last level of the hierarchy when absent.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub order: Vec<OrderSpec>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub locale: Option<String>,
}

/// Dimension to group by, down to `level`. Accepts `"date"`,
/// `"date:month"` and `"date@ymd:month"` as well as the object form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DrilldownInput")]
pub struct Drilldown {
    pub dimension: String,
    pub hierarchy: Option<String>,
    pub level: Option<String>,
}

impl Drilldown {
    pub fn new(dimension: &str, level: Option<&str>) -> Self {
        Self {
            dimension: dimension.to_string(),
            hierarchy: None,
            level: level.map(str::to_string),
        }
    }

    pub fn in_hierarchy(mut self, hierarchy: &str) -> Self {
        self.hierarchy = Some(hierarchy.to_string());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DrilldownInput {
    Short(String),
    Full {
        dimension: String,
        #[serde(default)]
        hierarchy: Option<String>,
        #[serde(default)]
        level: Option<String>,
    },
}

impl From<DrilldownInput> for Drilldown {
    fn from(input: DrilldownInput) -> Self {
        match input {
            DrilldownInput::Short(s) => {
                let (head, level) = match s.split_once(':') {
                    Some((head, level)) => (head, Some(level)),
                    None => (s.as_str(), None),
                };
                match head.split_once('@') {
                    Some((dimension, hierarchy)) => {
                        Drilldown::new(dimension, level).in_hierarchy(hierarchy)
                    }
                    None => Drilldown::new(head, level),
                }
            }
            DrilldownInput::Full {
                dimension,
                hierarchy,
                level,
            } => Drilldown {
                dimension,
                hierarchy,
                level,
            },
        }
    }
}

/// Order item naming a selected column. Accepts `"amount_sum"`,
/// `"amount_sum:desc"` or `{attribute, direction}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "OrderInput")]
pub struct OrderSpec {
    pub attribute: String,
    pub direction: SortDirection,
}

impl OrderSpec {
    pub fn new(attribute: &str, direction: SortDirection) -> Self {
        Self {
            attribute: attribute.to_string(),
            direction,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OrderInput {
    Short(String),
    Full {
        attribute: String,
        #[serde(default)]
        direction: SortDirection,
    },
}

impl TryFrom<OrderInput> for OrderSpec {
    type Error = String;

    fn try_from(input: OrderInput) -> std::result::Result<Self, Self::Error> {
        match input {
            OrderInput::Short(s) => match s.rsplit_once(':') {
                Some((attribute, "asc")) => Ok(OrderSpec::new(attribute, SortDirection::Asc)),
                Some((attribute, "desc")) => Ok(OrderSpec::new(attribute, SortDirection::Desc)),
                Some((_, other)) => Err(format!("invalid sort direction '{other}'")),
                None => Ok(OrderSpec::new(&s, SortDirection::Asc)),
            },
            OrderInput::Full {
                attribute,
                direction,
            } => Ok(OrderSpec {
                attribute,
                direction,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drilldown_shorthands() {
        let request: AggregateRequest = serde_json::from_str(
            r#"{
                "cube": "sales",
                "drilldown": [
                    "date:month",
                    "product",
                    {"dimension": "store", "level": "city"},
                    "week@yw:week",
                    "geo@by_region",
                    {"dimension": "calendar", "hierarchy": "ymd"}
                ],
                "order": ["amount_sum:desc", {"attribute": "date.month"}]
            }"#,
        )
        .unwrap();
        assert_eq!(
            request.drilldown,
            vec![
                Drilldown::new("date", Some("month")),
                Drilldown::new("product", None),
                Drilldown::new("store", Some("city")),
                Drilldown::new("week", Some("week")).in_hierarchy("yw"),
                Drilldown::new("geo", None).in_hierarchy("by_region"),
                Drilldown::new("calendar", None).in_hierarchy("ymd"),
            ]
        );
        assert_eq!(
            request.order,
            vec![
                OrderSpec::new("amount_sum", SortDirection::Desc),
                OrderSpec::new("date.month", SortDirection::Asc),
            ]
        );
    }

    #[test]
    fn bad_direction_and_unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<OrderSpec>(r#""amount:sideways""#).is_err());
        assert!(serde_json::from_str::<FactsRequest>(r#"{"cube": "sales", "limit": 3}"#).is_err());
    }
}
