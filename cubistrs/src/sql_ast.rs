use serde_json::Value;

use crate::dialect::Dialect;
use crate::metadata::SortDirection;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    Function {
        func: Function,
        args: Vec<SqlExpr>,
    },
    BinaryOp {
        op: SqlBinaryOperator,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Negate(Box<SqlExpr>),
    Not(Box<SqlExpr>),
    /// `expr: None` renders `COUNT(*)`-style row counting.
    Aggregate {
        agg: Aggregation,
        expr: Option<Box<SqlExpr>>,
    },
    InList {
        expr: Box<SqlExpr>,
        list: Vec<SqlExpr>,
        negated: bool,
    },
}

impl SqlExpr {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        SqlExpr::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn binary(op: SqlBinaryOperator, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn coalesce(self, value: Value) -> Self {
        SqlExpr::Function {
            func: Function::Coalesce,
            args: vec![self, SqlExpr::Literal(value)],
        }
    }

    /// `left / NULLIF(right, 0)`
    pub fn safe_divide(left: SqlExpr, right: SqlExpr) -> Self {
        let guarded = SqlExpr::Function {
            func: Function::NullIf,
            args: vec![right, SqlExpr::Literal(Value::from(0))],
        };
        SqlExpr::binary(SqlBinaryOperator::Divide, left, guarded)
    }

    /// Fold expressions with `op`; `None` for an empty input.
    pub fn fold(op: SqlBinaryOperator, exprs: Vec<SqlExpr>) -> Option<SqlExpr> {
        exprs
            .into_iter()
            .reduce(|acc, next| SqlExpr::binary(op, acc, next))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Function {
    Coalesce,
    NullIf,
    Extract { field: String },
    /// Single-argument SQL function applied to a mapped column.
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Count,
    CountDistinct,
    Min,
    Max,
    Avg,
    StdDev,
    Variance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlBinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
}

/// FROM clause: a table, an aliased subquery or a (left-deep or nested)
/// join tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table(TableRef),
    Subquery {
        query: Box<SelectQuery>,
        alias: String,
    },
    Join {
        join_type: SqlJoinType,
        left: Box<FromItem>,
        right: Box<FromItem>,
        on: Vec<SqlExpr>,
    },
}

impl Default for FromItem {
    fn default() -> Self {
        FromItem::Table(TableRef::default())
    }
}

impl FromItem {
    pub fn join_count(&self) -> usize {
        match self {
            FromItem::Table(_) | FromItem::Subquery { .. } => 0,
            FromItem::Join { left, right, .. } => 1 + left.join_count() + right.join_count(),
        }
    }

    /// Tables of this FROM level; subqueries keep theirs to themselves.
    pub fn tables(&self) -> Vec<&TableRef> {
        match self {
            FromItem::Table(t) => vec![t],
            FromItem::Subquery { .. } => Vec::new(),
            FromItem::Join { left, right, .. } => {
                let mut out = left.tables();
                out.extend(right.tables());
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: SqlExpr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: FromItem,
    pub filters: Vec<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                let expr_sql = self.render_expr(&item.expr);
                match &item.alias {
                    Some(alias) => format!("{expr_sql} AS {}", self.dialect.quote_ident(alias)),
                    None => expr_sql,
                }
            })
            .collect();

        let distinct = if query.distinct { "DISTINCT " } else { "" };
        let mut sql = format!(
            "SELECT {distinct}{} FROM {}",
            select_items.join(", "),
            self.render_from(&query.from)
        );

        if !query.filters.is_empty() {
            let filters: Vec<String> = query.filters.iter().map(|f| self.render_expr(f)).collect();
            sql.push_str(&format!(" WHERE {}", filters.join(" AND ")));
        }

        if !query.group_by.is_empty() {
            let groups: Vec<String> = query.group_by.iter().map(|g| self.render_expr(g)).collect();
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| {
                    let expr = self.render_expr(&o.expr);
                    let dir = match o.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{expr} {dir}")
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        sql
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        let qualified = self
            .dialect
            .qualify_table(table.schema.as_deref(), &table.name);
        match &table.alias {
            Some(alias) if alias != &table.name || table.schema.is_some() => {
                format!("{qualified} AS {}", self.dialect.quote_ident(alias))
            }
            _ => qualified,
        }
    }

    fn render_from(&self, item: &FromItem) -> String {
        match item {
            FromItem::Table(table) => self.render_table_ref(table),
            FromItem::Subquery { query, alias } => format!(
                "({}) AS {}",
                self.render_select(query),
                self.dialect.quote_ident(alias)
            ),
            FromItem::Join {
                join_type,
                left,
                right,
                on,
            } => {
                let join_kw = match join_type {
                    SqlJoinType::Inner => "JOIN",
                    SqlJoinType::Left => "LEFT JOIN",
                };
                let right_sql = match right.as_ref() {
                    FromItem::Join { .. } => format!("({})", self.render_from(right)),
                    other => self.render_from(other),
                };
                let on_clause: Vec<String> = on.iter().map(|e| self.render_expr(e)).collect();
                format!(
                    "{} {join_kw} {right_sql} ON {}",
                    self.render_from(left),
                    on_clause.join(" AND ")
                )
            }
        }
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => match table {
                Some(t) => format!(
                    "{}.{}",
                    self.dialect.quote_ident(t),
                    self.dialect.quote_ident(name)
                ),
                None => self.dialect.quote_ident(name),
            },
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::Function { func, args } => {
                let rendered_args: Vec<String> = args.iter().map(|a| self.render_expr(a)).collect();
                self.dialect.render_function(func, rendered_args)
            }
            SqlExpr::BinaryOp {
                op: SqlBinaryOperator::Divide,
                left,
                right,
            } => self
                .dialect
                .render_division(&self.render_expr(left), &self.render_expr(right)),
            SqlExpr::BinaryOp { op, left, right } => {
                let op_sql = match op {
                    SqlBinaryOperator::Add => "+",
                    SqlBinaryOperator::Subtract => "-",
                    SqlBinaryOperator::Multiply => "*",
                    SqlBinaryOperator::Divide => "/",
                    SqlBinaryOperator::Modulo => "%",
                    SqlBinaryOperator::And => "AND",
                    SqlBinaryOperator::Or => "OR",
                    SqlBinaryOperator::Eq => "=",
                    SqlBinaryOperator::Neq => "!=",
                    SqlBinaryOperator::Gt => ">",
                    SqlBinaryOperator::Gte => ">=",
                    SqlBinaryOperator::Lt => "<",
                    SqlBinaryOperator::Lte => "<=",
                    SqlBinaryOperator::Like => "LIKE",
                };
                format!(
                    "({} {} {})",
                    self.render_expr(left),
                    op_sql,
                    self.render_expr(right)
                )
            }
            SqlExpr::Negate(inner) => format!("(-{})", self.render_expr(inner)),
            SqlExpr::Not(inner) => format!("(NOT {})", self.render_expr(inner)),
            SqlExpr::Aggregate { agg, expr } => {
                let rendered = expr.as_ref().map(|e| self.render_expr(e));
                self.dialect.render_aggregation(agg, rendered.as_deref())
            }
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => {
                let rendered_values: Vec<String> =
                    list.iter().map(|v| self.render_expr(v)).collect();
                let not_kw = if *negated { "NOT " } else { "" };
                format!(
                    "({} {}IN ({}))",
                    self.render_expr(expr),
                    not_kw,
                    rendered_values.join(", ")
                )
            }
        }
    }
}
