//! Join-graph construction for star and snowflake schemas.
//!
//! [`StarSchema`] indexes the fact table and every joined detail table by
//! `(schema, alias-or-name)`. Given the columns a statement reads, it picks
//! the tables needed, closes the set over join masters, orders the tables
//! from the root outwards and folds them into one [`FromItem`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{CubistError, Result};
use crate::mapper::{ColumnReference, TableName};
use crate::schema_cache::{PhysicalSchema, TableSchema};
use crate::sql_ast::{FromItem, Function, SqlBinaryOperator, SqlExpr, SqlJoinType, TableRef};

/// How the detail side of a join participates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMethod {
    /// Inner join.
    #[default]
    Match,
    /// Keep every master row; detail is optional.
    Master,
    /// Keep every detail row; master is optional.
    Detail,
}

/// One side of a join. A missing table means the fact table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinSpec {
    pub master: JoinKey,
    pub detail: JoinKey,
    pub alias: Option<String>,
    pub method: JoinMethod,
}

impl JoinSpec {
    /// Alias or table name of the detail side, for messages.
    pub fn detail_label(&self) -> String {
        self.alias
            .clone()
            .or_else(|| self.detail.table.clone())
            .unwrap_or_else(|| "<fact>".to_string())
    }
}

/// `(schema, alias-or-name)`
pub type TableKey = (Option<String>, String);

#[derive(Debug, Clone)]
pub struct TableNode<'s> {
    pub schema: Option<String>,
    pub name: String,
    pub alias: String,
    pub physical: Option<&'s TableSchema>,
    /// Index of the join that attaches this table; `None` for the fact table.
    pub join: Option<usize>,
}

impl TableNode<'_> {
    pub fn key(&self) -> TableKey {
        (self.schema.clone(), self.alias.clone())
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef {
            schema: self.schema.clone(),
            name: self.name.clone(),
            alias: Some(self.alias.clone()),
        }
    }
}

pub struct StarSchema<'s> {
    fact_key: TableKey,
    default_schema: Option<String>,
    joins: Vec<JoinSpec>,
    tables: BTreeMap<TableKey, TableNode<'s>>,
    physical: Option<&'s dyn PhysicalSchema>,
}

impl<'s> StarSchema<'s> {
    /// Index the fact table and every join detail. Two tables under the same
    /// key are rejected: repeated joins to one physical table need aliases.
    pub fn new(
        fact: &TableName,
        joins: &[JoinSpec],
        default_schema: Option<&str>,
        physical: Option<&'s dyn PhysicalSchema>,
    ) -> Result<Self> {
        let fact_key = (fact.schema.clone(), fact.name.clone());
        let mut star = Self {
            fact_key: fact_key.clone(),
            default_schema: default_schema.map(str::to_string),
            joins: joins.to_vec(),
            tables: BTreeMap::new(),
            physical,
        };

        let fact_node = TableNode {
            schema: fact.schema.clone(),
            name: fact.name.clone(),
            alias: fact.name.clone(),
            physical: star.lookup_physical(fact.schema.as_deref(), &fact.name)?,
            join: None,
        };
        star.tables.insert(fact_key, fact_node);

        for (index, join) in joins.iter().enumerate() {
            let name = join.detail.table.clone().ok_or_else(|| {
                CubistError::Model(format!(
                    "join {index} detail does not name a table"
                ))
            })?;
            let key = match &join.alias {
                Some(alias) => (
                    join.detail.schema.clone().or_else(|| star.default_schema.clone()),
                    alias.clone(),
                ),
                None => star.table_key(join.detail.schema.as_deref(), &name),
            };
            if star.tables.contains_key(&key) {
                return Err(CubistError::Model(format!(
                    "table '{}' is joined more than once under the same name; \
                     give each join an alias",
                    key.1
                )));
            }
            let physical = star.lookup_physical(key.0.as_deref(), &name)?;
            star.tables.insert(
                key.clone(),
                TableNode {
                    schema: key.0.clone(),
                    name,
                    alias: key.1,
                    physical,
                    join: Some(index),
                },
            );
        }
        Ok(star)
    }

    fn lookup_physical(&self, schema: Option<&str>, name: &str) -> Result<Option<&'s TableSchema>> {
        match self.physical {
            None => Ok(None),
            Some(physical) => physical.table(schema, name).map(Some).ok_or_else(|| {
                let qualified = match schema {
                    Some(schema) => format!("{schema}.{name}"),
                    None => name.to_string(),
                };
                CubistError::Schema(format!("table '{qualified}' does not exist"))
            }),
        }
    }

    /// Key for a table named by a mapping or join. The fact table's own name
    /// without a schema always refers to the fact table.
    fn table_key(&self, schema: Option<&str>, table: &str) -> TableKey {
        if schema.is_none() && table == self.fact_key.1 {
            return self.fact_key.clone();
        }
        (
            schema.map(str::to_string).or_else(|| self.default_schema.clone()),
            table.to_string(),
        )
    }

    fn find(&self, schema: Option<&str>, table: Option<&str>) -> Option<&TableNode<'s>> {
        let Some(table) = table else {
            return self.tables.get(&self.fact_key);
        };
        if let Some(node) = self.tables.get(&self.table_key(schema, table)) {
            return Some(node);
        }
        // Tolerate a schema that differs from the join declaration as long as
        // the name is unambiguous.
        let mut by_name = self.tables.values().filter(|n| n.alias == table);
        match (by_name.next(), by_name.next()) {
            (Some(node), None) => Some(node),
            _ => None,
        }
    }

    fn master_key(&self, join: &JoinSpec) -> Option<TableKey> {
        self.find(join.master.schema.as_deref(), join.master.table.as_deref())
            .map(TableNode::key)
    }

    pub fn fact_key(&self) -> &TableKey {
        &self.fact_key
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableNode<'s>> {
        self.tables.values()
    }

    /// Node owning a mapped column.
    pub fn table_for(&self, column: &ColumnReference) -> Result<&TableNode<'s>> {
        self.find(column.schema.as_deref(), column.table.as_deref())
            .ok_or_else(|| {
                CubistError::Model(format!(
                    "table '{}' is not joined to fact table '{}'",
                    column.table.as_deref().unwrap_or_default(),
                    self.fact_key.1
                ))
            })
    }

    /// Qualified column expression for a mapped column, with its extract or
    /// function applied.
    pub fn column(&self, column: &ColumnReference) -> Result<SqlExpr> {
        let node = self.table_for(column)?;
        if let Some(table) = node.physical {
            if !table.has_column(&column.column) {
                return Err(CubistError::Schema(format!(
                    "column '{}' does not exist in table '{}'",
                    column.column, node.name
                )));
            }
        }
        let expr = SqlExpr::column(Some(&node.alias), &column.column);
        if let Some(field) = &column.extract {
            check_sql_word(field, "extract field")?;
            return Ok(SqlExpr::Function {
                func: Function::Extract {
                    field: field.clone(),
                },
                args: vec![expr],
            });
        }
        if let Some(function) = &column.function {
            check_sql_word(function, "function")?;
            return Ok(SqlExpr::Function {
                func: Function::Named(function.clone()),
                args: vec![expr],
            });
        }
        Ok(expr)
    }

    /// Tables needed to read `columns`, closed over join masters. With
    /// `include_fact` false the fact table is never pulled in.
    pub fn required_tables(
        &self,
        columns: &[ColumnReference],
        include_fact: bool,
    ) -> Result<BTreeSet<TableKey>> {
        let mut required = BTreeSet::new();
        let mut missing = BTreeSet::new();
        for column in columns {
            match self.find(column.schema.as_deref(), column.table.as_deref()) {
                Some(node) => {
                    required.insert(node.key());
                }
                None => {
                    missing.insert(column.table.clone().unwrap_or_default());
                }
            }
        }
        if !missing.is_empty() {
            let names: Vec<String> = missing.into_iter().collect();
            return Err(CubistError::Model(format!(
                "tables {} cannot be joined: no join attaches them to fact table '{}'",
                names.join(", "),
                self.fact_key.1
            )));
        }
        if include_fact || required.is_empty() {
            required.insert(self.fact_key.clone());
        }

        let mut queue: Vec<TableKey> = required.iter().cloned().collect();
        while let Some(key) = queue.pop() {
            let Some(index) = self.tables.get(&key).and_then(|n| n.join) else {
                continue;
            };
            let join = &self.joins[index];
            let master = self.master_key(join).ok_or_else(|| {
                CubistError::Model(format!(
                    "join to '{}' has master table '{}', which is neither the fact table \
                     nor joined itself",
                    join.detail_label(),
                    join.master.table.as_deref().unwrap_or_default()
                ))
            })?;
            if master == self.fact_key && !include_fact {
                continue;
            }
            if required.insert(master.clone()) {
                queue.push(master);
            }
        }
        Ok(required)
    }

    /// Order `required` so every table comes after its master: the fact
    /// table first when present, otherwise the single table whose master is
    /// outside the set.
    fn join_order(&self, required: &BTreeSet<TableKey>) -> Result<Vec<TableKey>> {
        let root = if required.contains(&self.fact_key) {
            self.fact_key.clone()
        } else {
            let roots: Vec<&TableKey> = required
                .iter()
                .filter(|key| {
                    let master = self.tables[*key]
                        .join
                        .and_then(|i| self.master_key(&self.joins[i]));
                    master.map_or(true, |m| !required.contains(&m))
                })
                .collect();
            match roots.as_slice() {
                [root] => (*root).clone(),
                [] => {
                    return Err(CubistError::Model(
                        "joined tables form a cycle".to_string(),
                    ))
                }
                many => {
                    let names: Vec<&str> = many.iter().map(|k| k.1.as_str()).collect();
                    return Err(CubistError::Model(format!(
                        "tables {} are disconnected without the fact table",
                        names.join(", ")
                    )));
                }
            }
        };

        let mut placed: Vec<TableKey> = vec![root];
        let mut pending: Vec<&TableKey> = required
            .iter()
            .filter(|k| **k != placed[0])
            .collect();
        // Declaration order keeps the output stable.
        pending.sort_by_key(|k| self.tables[*k].join);
        while !pending.is_empty() {
            let next = pending.iter().position(|key| {
                self.tables[*key]
                    .join
                    .and_then(|i| self.master_key(&self.joins[i]))
                    .is_some_and(|m| placed.contains(&m))
            });
            match next {
                Some(pos) => placed.push(pending.remove(pos).clone()),
                None => {
                    let names: Vec<&str> = pending.iter().map(|k| k.1.as_str()).collect();
                    return Err(CubistError::Model(format!(
                        "tables {} cannot be joined to '{}'",
                        names.join(", "),
                        placed[0].1
                    )));
                }
            }
        }
        Ok(placed)
    }

    /// Join expression containing every table needed for `columns`.
    pub fn join_expression(
        &self,
        columns: &[ColumnReference],
        include_fact: bool,
    ) -> Result<FromItem> {
        let required = self.required_tables(columns, include_fact)?;
        let order = self.join_order(&required)?;
        tracing::debug!(
            tables = ?order.iter().map(|k| k.1.as_str()).collect::<Vec<_>>(),
            "join order"
        );

        let root = &self.tables[&order[0]];
        let mut from = FromItem::Table(root.table_ref());
        for key in &order[1..] {
            let detail = &self.tables[key];
            let Some(index) = detail.join else {
                continue;
            };
            let join = &self.joins[index];
            let master = self
                .master_key(join)
                .and_then(|k| self.tables.get(&k))
                .ok_or_else(|| {
                    CubistError::Model(format!(
                        "join to '{}' has no master table",
                        join.detail_label()
                    ))
                })?;
            let on = self.join_condition(join, master, detail)?;
            let detail_item = Box::new(FromItem::Table(detail.table_ref()));
            from = match join.method {
                JoinMethod::Match => FromItem::Join {
                    join_type: SqlJoinType::Inner,
                    left: Box::new(from),
                    right: detail_item,
                    on,
                },
                JoinMethod::Master => FromItem::Join {
                    join_type: SqlJoinType::Left,
                    left: Box::new(from),
                    right: detail_item,
                    on,
                },
                // Right outer join spelled as a left join with swapped operands.
                JoinMethod::Detail => FromItem::Join {
                    join_type: SqlJoinType::Left,
                    left: detail_item,
                    right: Box::new(from),
                    on,
                },
            };
        }
        Ok(from)
    }

    fn join_condition(
        &self,
        join: &JoinSpec,
        master: &TableNode<'s>,
        detail: &TableNode<'s>,
    ) -> Result<Vec<SqlExpr>> {
        if join.master.columns.len() != join.detail.columns.len() {
            return Err(CubistError::Model(format!(
                "join to '{}' has {} master and {} detail key columns",
                join.detail_label(),
                join.master.columns.len(),
                join.detail.columns.len()
            )));
        }
        for (node, columns) in [(master, &join.master.columns), (detail, &join.detail.columns)] {
            if let Some(table) = node.physical {
                if let Some(missing) = columns.iter().find(|c| !table.has_column(c)) {
                    return Err(CubistError::Schema(format!(
                        "join column '{missing}' does not exist in table '{}'",
                        node.name
                    )));
                }
            }
        }
        Ok(join
            .master
            .columns
            .iter()
            .zip(&join.detail.columns)
            .map(|(m, d)| {
                SqlExpr::binary(
                    SqlBinaryOperator::Eq,
                    SqlExpr::column(Some(&master.alias), m),
                    SqlExpr::column(Some(&detail.alias), d),
                )
            })
            .collect())
    }
}

fn check_sql_word(word: &str, what: &str) -> Result<()> {
    let valid = !word.is_empty()
        && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !word.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(CubistError::Argument(format!("invalid {what} '{word}'")))
    }
}
