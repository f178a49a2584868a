//! PostgreSQL dialect implementation.

use crate::sql_ast::Function;

use super::{render_common_function, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::Extract { field } => match args.as_slice() {
                [expr] => format!("date_part('{field}', {expr})"),
                _ => "NULL".to_string(),
            },
            other => render_common_function(other, args),
        }
    }

    // Integer division truncates in PostgreSQL.
    fn render_division(&self, left: &str, right: &str) -> String {
        format!("(CAST({left} AS DOUBLE PRECISION) / {right})")
    }
}
