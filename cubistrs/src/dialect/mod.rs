//! SQL dialect abstractions for different database backends.
//!
//! Each dialect is implemented in its own file.

use crate::sql_ast::{Aggregation, Function};

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in the renderer; the dialect
/// only maps logical constructs to SQL fragments.
pub trait Dialect {
    fn quote_ident(&self, ident: &str) -> String;
    fn qualify_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("{}.{}", self.quote_ident(schema), self.quote_ident(table)),
            None => self.quote_ident(table),
        }
    }
    fn render_function(&self, func: &Function, args: Vec<String>) -> String;
    fn render_aggregation(&self, agg: &Aggregation, expr: Option<&str>) -> String {
        let expr = expr.unwrap_or("*");
        match agg {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
            Aggregation::Avg => format!("AVG({expr})"),
            Aggregation::StdDev => format!("STDDEV({expr})"),
            Aggregation::Variance => format!("VARIANCE({expr})"),
        }
    }
    fn render_division(&self, left: &str, right: &str) -> String {
        format!("({left} / {right})")
    }
    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }
}

/// Render the functions both bundled dialects spell the same way.
pub(crate) fn render_common_function(func: &Function, args: Vec<String>) -> String {
    match func {
        Function::Coalesce => format!("coalesce({})", args.join(", ")),
        Function::NullIf => match args.as_slice() {
            [expr1, expr2] => format!("nullif({expr1}, {expr2})"),
            _ => "NULL".to_string(),
        },
        Function::Extract { field } => match args.as_slice() {
            [expr] => format!("extract({field} FROM {expr})"),
            _ => "NULL".to_string(),
        },
        Function::Named(name) => format!("{name}({})", args.join(", ")),
    }
}

mod duckdb;
pub use duckdb::DuckDbDialect;

mod postgres;
pub use postgres::PostgresDialect;
