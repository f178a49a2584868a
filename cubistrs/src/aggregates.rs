//! Aggregate functions and the aggregate compiler.

use std::collections::{HashMap, HashSet, VecDeque};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::model::{Aggregate, Cube};
use crate::sql_ast::{Aggregation, SelectItem, SqlExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Column(Aggregation),
    RowCount,
    Fraction,
}

/// Built-in aggregate function.
#[derive(Debug, Clone)]
pub struct AggregateFunction {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    /// Replace NULL inputs with the missing value before aggregating.
    pub coalesce_args: bool,
    /// Replace a NULL result with the missing value.
    pub coalesce_result: bool,
    kind: Kind,
}

impl AggregateFunction {
    const fn column(name: &'static str, agg: Aggregation, coalesce_args: bool, coalesce_result: bool) -> Self {
        Self {
            name,
            min_args: 1,
            max_args: 1,
            coalesce_args,
            coalesce_result,
            kind: Kind::Column(agg),
        }
    }

    /// Functions that combine other aggregates rather than fact columns.
    pub fn is_post_aggregate(&self) -> bool {
        self.kind == Kind::Fraction
    }

    pub fn check_arity(&self, aggregate: &str, args: usize) -> Result<()> {
        if args < self.min_args || args > self.max_args {
            let expected = if self.min_args == self.max_args {
                self.min_args.to_string()
            } else {
                format!("{} to {}", self.min_args, self.max_args)
            };
            return Err(CubistError::Model(format!(
                "aggregate '{aggregate}' uses '{}' with {args} arguments, expected {expected}",
                self.name
            )));
        }
        Ok(())
    }

    /// Build the aggregate expression over already compiled arguments.
    /// `missing` defaults to 0.
    pub fn compile(&self, args: Vec<SqlExpr>, missing: Option<&Value>, coalesce: bool) -> Result<SqlExpr> {
        let missing_value = missing.cloned().unwrap_or_else(|| Value::from(0));
        let args: Vec<SqlExpr> = if coalesce && self.coalesce_args {
            args.into_iter()
                .map(|a| a.coalesce(missing_value.clone()))
                .collect()
        } else {
            args
        };
        let mut args = args.into_iter();
        let mut next_arg = || {
            args.next().ok_or_else(|| {
                CubistError::Model(format!("'{}' is missing an argument", self.name))
            })
        };

        let expr = match self.kind {
            Kind::Column(agg) => SqlExpr::Aggregate {
                agg,
                expr: Some(Box::new(next_arg()?)),
            },
            Kind::RowCount => SqlExpr::Aggregate {
                agg: Aggregation::Count,
                expr: None,
            },
            Kind::Fraction => {
                let numerator = next_arg()?;
                let denominator = next_arg()?;
                let ratio = SqlExpr::safe_divide(numerator, denominator);
                return Ok(match missing {
                    Some(value) if coalesce => ratio.coalesce(value.clone()),
                    _ => ratio,
                });
            }
        };
        Ok(if coalesce && self.coalesce_result {
            expr.coalesce(missing_value)
        } else {
            expr
        })
    }
}

static FUNCTIONS: Lazy<HashMap<&'static str, AggregateFunction>> = Lazy::new(|| {
    let functions = [
        AggregateFunction::column("sum", Aggregation::Sum, false, true),
        AggregateFunction::column("min", Aggregation::Min, true, false),
        AggregateFunction::column("max", Aggregation::Max, true, false),
        AggregateFunction::column("avg", Aggregation::Avg, true, false),
        AggregateFunction::column("stddev", Aggregation::StdDev, true, false),
        AggregateFunction::column("variance", Aggregation::Variance, true, false),
        AggregateFunction::column("count_nonempty", Aggregation::Count, false, true),
        AggregateFunction::column("count_distinct", Aggregation::CountDistinct, false, false),
        AggregateFunction {
            name: "count",
            min_args: 0,
            max_args: 0,
            coalesce_args: false,
            coalesce_result: false,
            kind: Kind::RowCount,
        },
        AggregateFunction {
            name: "fraction",
            min_args: 2,
            max_args: 2,
            coalesce_args: false,
            coalesce_result: false,
            kind: Kind::Fraction,
        },
    ];
    functions.into_iter().map(|f| (f.name, f)).collect()
});

pub fn aggregate_function(name: &str) -> Option<&'static AggregateFunction> {
    FUNCTIONS.get(name)
}

pub fn available_functions() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = FUNCTIONS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Compiles requested aggregates of one cube into labeled select items.
pub struct AggregateCompiler<'c> {
    cube: &'c Cube,
    coalesce: bool,
}

impl<'c> AggregateCompiler<'c> {
    pub fn new(cube: &'c Cube, coalesce: bool) -> Self {
        Self { cube, coalesce }
    }

    /// Aggregates needed to compute `requested`, dependencies included.
    pub fn closure(&self, requested: &[&'c Aggregate]) -> Vec<&'c Aggregate> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        let mut stack: Vec<&'c Aggregate> = requested.iter().rev().copied().collect();
        while let Some(agg) = stack.pop() {
            if !seen.insert(agg.name.as_str()) {
                continue;
            }
            out.push(agg);
            for dep in &agg.depends_on {
                if let Ok(dep_agg) = self.cube.aggregate(dep) {
                    stack.push(dep_agg);
                }
            }
        }
        out
    }

    /// Compile `requested` against `columns`, the fact-level expressions of
    /// measures and details keyed by name. Returns one item per requested
    /// aggregate, labeled with its name, in request order.
    pub fn compile(
        &self,
        requested: &[&'c Aggregate],
        columns: &HashMap<String, SqlExpr>,
    ) -> Result<Vec<SelectItem>> {
        let all = self.closure(requested);
        let n = all.len();
        let max_attempts = n * n + n;
        let mut compiled: HashMap<&str, SqlExpr> = HashMap::new();
        let mut queue: VecDeque<&'c Aggregate> = all.into_iter().collect();
        let mut attempts = 0;

        while let Some(agg) = queue.pop_front() {
            attempts += 1;
            if attempts > max_attempts {
                let mut names: Vec<&str> = queue.iter().map(|a| a.name.as_str()).collect();
                names.push(&agg.name);
                names.sort_unstable();
                return Err(CubistError::Model(format!(
                    "cannot resolve dependencies of aggregates {} in cube '{}'",
                    names.join(", "),
                    self.cube.name()
                )));
            }
            let ready = agg.depends_on.iter().all(|dep| {
                compiled.contains_key(dep.as_str())
                    || (self.cube.aggregate(dep).is_err() && columns.contains_key(dep))
            });
            if !ready {
                queue.push_back(agg);
                continue;
            }
            let expr = self.compile_one(agg, columns, &compiled)?;
            tracing::debug!(aggregate = %agg.name, "compiled aggregate");
            compiled.insert(agg.name.as_str(), expr);
        }

        requested
            .iter()
            .map(|agg| {
                let expr = compiled.get(agg.name.as_str()).cloned().ok_or_else(|| {
                    CubistError::Model(format!("aggregate '{}' was not compiled", agg.name))
                })?;
                Ok(SelectItem {
                    expr,
                    alias: Some(agg.name.clone()),
                })
            })
            .collect()
    }

    fn compile_one(
        &self,
        agg: &Aggregate,
        columns: &HashMap<String, SqlExpr>,
        compiled: &HashMap<&str, SqlExpr>,
    ) -> Result<SqlExpr> {
        let lookup = |name: &str| -> Result<SqlExpr> {
            compiled
                .get(name)
                .or_else(|| columns.get(name))
                .cloned()
                .ok_or_else(|| {
                    CubistError::Model(format!(
                        "aggregate '{}' depends on '{name}', which is not available",
                        agg.name
                    ))
                })
        };

        if let Some(expression) = &agg.expression {
            let expr = expression.to_sql(&mut |name: &str| lookup(name))?;
            return Ok(match &agg.missing_value {
                Some(value) if self.coalesce => expr.coalesce(value.clone()),
                _ => expr,
            });
        }

        let name = agg.function.as_deref().ok_or_else(|| {
            CubistError::Model(format!(
                "aggregate '{}' has neither a function nor an expression",
                agg.name
            ))
        })?;
        let function = aggregate_function(name).ok_or_else(|| {
            CubistError::Model(format!(
                "aggregate '{}' uses unknown function '{name}'",
                agg.name
            ))
        })?;
        function.check_arity(&agg.name, agg.depends_on.len())?;
        let args = agg
            .depends_on
            .iter()
            .map(|dep| lookup(dep))
            .collect::<Result<Vec<_>>>()?;
        function.compile(args, agg.missing_value.as_ref(), self.coalesce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DuckDbDialect;
    use crate::metadata::{CubeDef, ModelDefaults};
    use crate::model::Model;
    use crate::sql_ast::SqlRenderer;

    fn model() -> Model {
        let cubes: Vec<CubeDef> = serde_yaml::from_str(
            r#"
- name: ads
  measures:
    - name: taps
      aggregates: [sum]
    - name: impressions
      aggregates: [sum, max]
    - name: price
  aggregates:
    - {name: tap_through_rate, function: fraction, depends_on: [taps_sum, impressions_sum]}
    - {name: ttr_or_zero, function: fraction, depends_on: [taps_sum, impressions_sum], missing_value: 0}
    - {name: rows, function: count}
    - {name: filled, function: count_nonempty, measure: price}
    - {name: ratio_pct, expression: "taps_sum * 100 / impressions_sum"}
    - {name: avg_price, function: avg, measure: price}
    - {name: price_stddev, function: stddev, measure: price}
    - {name: price_variance, function: variance, measure: price}
"#,
        )
        .unwrap();
        Model::build(&ModelDefaults::default(), Vec::new(), cubes).unwrap()
    }

    fn columns() -> HashMap<String, SqlExpr> {
        ["taps", "impressions", "price"]
            .into_iter()
            .map(|m| (m.to_string(), SqlExpr::column(Some("f"), m)))
            .collect()
    }

    fn compile(names: &[&str], coalesce: bool) -> Result<Vec<String>> {
        let model = model();
        let cube = model.cube("ads").unwrap();
        let requested: Vec<&Aggregate> = names.iter().map(|n| cube.aggregate(n).unwrap()).collect();
        let items = AggregateCompiler::new(cube, coalesce).compile(&requested, &columns())?;
        let renderer = SqlRenderer::new(&DuckDbDialect);
        Ok(items
            .iter()
            .map(|i| format!("{} AS {}", renderer.render_expr(&i.expr), i.alias.clone().unwrap()))
            .collect())
    }

    #[test]
    fn registry_contents() {
        assert_eq!(
            available_functions(),
            vec![
                "avg",
                "count",
                "count_distinct",
                "count_nonempty",
                "fraction",
                "max",
                "min",
                "stddev",
                "sum",
                "variance",
            ]
        );
        assert!(aggregate_function("median").is_none());
        assert!(aggregate_function("fraction").unwrap().is_post_aggregate());
    }

    #[test]
    fn arity_is_checked() {
        let count = aggregate_function("count").unwrap();
        assert!(count.check_arity("rows", 0).is_ok());
        let err = count.check_arity("rows", 1).unwrap_err();
        assert!(matches!(err, CubistError::Model(msg) if msg.contains("rows")));
        assert!(aggregate_function("fraction").unwrap().check_arity("r", 1).is_err());
    }

    #[test]
    fn simple_functions_and_coalescing() {
        let sql = compile(&["taps_sum", "impressions_max", "rows", "filled", "avg_price"], true).unwrap();
        assert_eq!(
            sql,
            vec![
                "coalesce(SUM(\"f\".\"taps\"), 0) AS taps_sum",
                "MAX(coalesce(\"f\".\"impressions\", 0)) AS impressions_max",
                "COUNT(*) AS rows",
                "coalesce(COUNT(\"f\".\"price\"), 0) AS filled",
                "AVG(coalesce(\"f\".\"price\", 0)) AS avg_price",
            ]
        );

        let sql = compile(&["taps_sum", "avg_price"], false).unwrap();
        assert_eq!(sql, vec!["SUM(\"f\".\"taps\") AS taps_sum", "AVG(\"f\".\"price\") AS avg_price"]);
    }

    #[test]
    fn spread_functions_coalesce_their_inputs() {
        let sql = compile(&["price_stddev", "price_variance"], true).unwrap();
        assert_eq!(
            sql,
            vec![
                "STDDEV(coalesce(\"f\".\"price\", 0)) AS price_stddev",
                "VARIANCE(coalesce(\"f\".\"price\", 0)) AS price_variance",
            ]
        );
        assert!(!aggregate_function("stddev").unwrap().coalesce_result);
    }

    #[test]
    fn fraction_pulls_in_its_dependencies() {
        let sql = compile(&["tap_through_rate"], true).unwrap();
        assert_eq!(
            sql,
            vec!["(coalesce(SUM(\"f\".\"taps\"), 0) / nullif(coalesce(SUM(\"f\".\"impressions\"), 0), 0)) AS tap_through_rate"]
        );

        let sql = compile(&["ttr_or_zero"], true).unwrap();
        assert!(sql[0].starts_with("coalesce((coalesce(SUM"));
        assert!(sql[0].ends_with(", 0) AS ttr_or_zero"));
    }

    #[test]
    fn dependency_order_does_not_depend_on_request_order() {
        let forward = compile(&["taps_sum", "impressions_sum", "tap_through_rate"], true).unwrap();
        let backward = compile(&["tap_through_rate", "impressions_sum", "taps_sum"], true).unwrap();
        assert_eq!(forward[2], backward[0]);
        assert_eq!(forward[0], backward[2]);
    }

    #[test]
    fn expression_aggregate() {
        let sql = compile(&["ratio_pct"], true).unwrap();
        assert_eq!(
            sql,
            vec!["((coalesce(SUM(\"f\".\"taps\"), 0) * 100) / nullif(coalesce(SUM(\"f\".\"impressions\"), 0), 0)) AS ratio_pct"]
        );
    }

    #[test]
    fn missing_base_column_is_a_model_error() {
        let model = model();
        let cube = model.cube("ads").unwrap();
        let requested = vec![cube.aggregate("avg_price").unwrap()];
        let err = AggregateCompiler::new(cube, true)
            .compile(&requested, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, CubistError::Model(msg) if msg.contains("avg_price")));
    }
}
