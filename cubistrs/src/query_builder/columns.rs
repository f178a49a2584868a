use std::collections::HashMap;

use crate::depsort::{depsort, DependencyMap};
use crate::error::{CubistError, Result};
use crate::mapper::{ColumnReference, Mapper};
use crate::model::{AttributeRef, Cube};
use crate::sql_ast::SqlExpr;
use crate::star::StarSchema;

/// Column expressions of one statement, keyed by logical reference, plus
/// the physical columns they read.
pub(crate) struct ColumnSet<'q, 'c> {
    cube: &'c Cube,
    mapper: &'q (dyn Mapper + 'c),
    star: &'q StarSchema<'c>,
    dependencies: &'q DependencyMap,
    locale: Option<&'q str>,
    exprs: HashMap<String, SqlExpr>,
    physical: Vec<ColumnReference>,
}

impl<'q, 'c> ColumnSet<'q, 'c> {
    pub(crate) fn new(
        cube: &'c Cube,
        mapper: &'q (dyn Mapper + 'c),
        star: &'q StarSchema<'c>,
        dependencies: &'q DependencyMap,
        locale: Option<&'q str>,
    ) -> Self {
        Self {
            cube,
            mapper,
            star,
            dependencies,
            locale,
            exprs: HashMap::new(),
            physical: Vec::new(),
        }
    }

    /// Expression of an attribute, measure or detail. Derived attributes are
    /// compiled after their dependencies.
    pub(crate) fn expr(&mut self, attribute: AttributeRef<'c>) -> Result<SqlExpr> {
        if let AttributeRef::Aggregate(agg) = attribute {
            return Err(CubistError::Argument(format!(
                "aggregate '{}' cannot be used as a column",
                agg.name
            )));
        }
        let reference = attribute.reference();
        if let Some(expr) = self.exprs.get(&reference) {
            return Ok(expr.clone());
        }
        if attribute.is_base() {
            return self.base(attribute);
        }

        for name in depsort(&[reference.as_str()], self.dependencies)? {
            if self.exprs.contains_key(&name) {
                continue;
            }
            let attr = self.cube.attribute(&name)?;
            if attr.is_base() {
                self.base(attr)?;
                continue;
            }
            let expression = attr.expression().ok_or_else(|| {
                CubistError::Model(format!("'{name}' has neither a column nor an expression"))
            })?;
            let exprs = &self.exprs;
            let expr = expression.to_sql(&mut |dep: &str| {
                exprs.get(dep).cloned().ok_or_else(|| {
                    CubistError::Model(format!("'{name}' refers to unresolved '{dep}'"))
                })
            })?;
            self.exprs.insert(name, expr);
        }
        self.exprs.get(&reference).cloned().ok_or_else(|| {
            CubistError::Model(format!("'{reference}' could not be compiled"))
        })
    }

    fn base(&mut self, attribute: AttributeRef<'c>) -> Result<SqlExpr> {
        let column = self.mapper.resolve(attribute, self.locale)?;
        let expr = self.physical(column)?;
        self.exprs.insert(attribute.reference(), expr.clone());
        Ok(expr)
    }

    /// Expression of a physical column that is not a model attribute.
    pub(crate) fn physical(&mut self, column: ColumnReference) -> Result<SqlExpr> {
        let expr = self.star.column(&column)?;
        tracing::trace!(column = %column, "using column");
        self.physical.push(column);
        Ok(expr)
    }

    pub(crate) fn columns(&self) -> &[ColumnReference] {
        &self.physical
    }
}
