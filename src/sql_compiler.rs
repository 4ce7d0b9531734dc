//! SQL backend that renders the compiled AST to PostgreSQL using sea-query.

use crate::ast::{
    BinaryExpression, BinaryOperator, Expression, LambdaExpression, LiteralExpression, LogicalExpression,
    LogicalOperator, MemberExpression, MethodCallExpression, OrderbyExpression, TypeExpression,
};
use crate::backend::{Backend, BackendError};
use crate::config::SchemaConfig;
use crate::value::Value;
use crate::visitor::{walk_lambda, Visitor};
use sea_query::{Asterisk, Expr, Iden, Order, PostgresQueryBuilder, SelectStatement, SimpleExpr, Value as SqlValue};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Table identifier for sea-query
#[derive(Debug, Clone)]
pub struct TableName(pub String);

impl Iden for TableName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

/// Column identifier wrapper
#[derive(Debug, Clone)]
pub struct ColumnName(pub String);

impl Iden for ColumnName {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        let _ = write!(s, "{}", self.0);
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

/// Renders compiled queries to SQL text.
#[derive(Debug, Clone, Default)]
pub struct SqlCompiler {
    /// Maps entity names to table names for schema resolution
    table_mapping: HashMap<String, String>,
}

impl SqlCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SchemaConfig) -> Self {
        Self {
            table_mapping: config.tables().clone(),
        }
    }

    /// Set table mapping for entity names
    pub fn set_table_mapping(&mut self, mapping: HashMap<String, String>) {
        self.table_mapping = mapping;
    }

    /// Builds the statement for a rendered block.
    pub fn statement(&self, ast: &Expression) -> Result<SelectStatement, CompileError> {
        let mut builder = StatementBuilder {
            table_mapping: &self.table_mapping,
            select: SelectStatement::new(),
            stack: Vec::new(),
        };
        builder.visit(ast)?;
        Ok(builder.select)
    }

    /// Compile a rendered block into PostgreSQL text
    pub fn compile(&self, ast: &Expression) -> Result<String, CompileError> {
        let sql = self.statement(ast)?.to_string(PostgresQueryBuilder);
        debug!(%sql, "compiled sql");
        Ok(sql)
    }
}

impl Backend for SqlCompiler {
    type Item = String;

    fn execute(&mut self, ast: &Expression) -> Result<Vec<String>, BackendError> {
        Ok(vec![self.compile(ast)?])
    }
}

/// Per-statement state; conditions are assembled bottom-up on `stack`.
struct StatementBuilder<'t> {
    table_mapping: &'t HashMap<String, String>,
    select: SelectStatement,
    stack: Vec<SimpleExpr>,
}

impl StatementBuilder<'_> {
    fn pop(&mut self) -> Result<SimpleExpr, CompileError> {
        self.stack
            .pop()
            .ok_or_else(|| CompileError::new("Condition stack underflow".to_string()))
    }

    /// Get the actual table name for an entity
    fn table_name(&self, ty: &TypeExpression) -> String {
        self.table_mapping
            .get(&ty.ty.type_name)
            .cloned()
            .unwrap_or_else(|| ty.ty.name().to_lowercase())
    }
}

impl Visitor for StatementBuilder<'_> {
    type Error = CompileError;

    fn visit_type(&mut self, ty: &TypeExpression) -> Result<(), CompileError> {
        let table = self.table_name(ty);
        self.select.column(Asterisk).from(TableName(table));
        Ok(())
    }

    fn visit_lambda(&mut self, lambda: &LambdaExpression) -> Result<(), CompileError> {
        if lambda.body.is_none() {
            return Ok(());
        }
        walk_lambda(self, lambda)?;
        let condition = self.pop()?;
        self.select.and_where(condition);
        Ok(())
    }

    fn visit_logical(&mut self, logical: &LogicalExpression) -> Result<(), CompileError> {
        self.visit(&logical.left)?;
        self.visit(&logical.right)?;
        let right = self.pop()?;
        let left = self.pop()?;
        let combined = match logical.operator {
            LogicalOperator::Or => left.or(right),
            LogicalOperator::And | LogicalOperator::None => left.and(right),
        };
        self.stack.push(combined);
        Ok(())
    }

    fn visit_binary(&mut self, binary: &BinaryExpression) -> Result<(), CompileError> {
        let (Expression::Member(member), Expression::Literal(literal)) = (binary.left.as_ref(), binary.right.as_ref())
        else {
            return Err(CompileError::new(
                "Expected a member compared with a literal".to_string(),
            ));
        };
        let condition = compile_comparison(member, binary.operator, literal)?;
        self.stack.push(condition);
        Ok(())
    }

    fn visit_orderby(&mut self, orderby: &OrderbyExpression) -> Result<(), CompileError> {
        let order = if orderby.ascending { Order::Asc } else { Order::Desc };
        self.select.order_by(ColumnName(orderby.member.name().to_string()), order);
        Ok(())
    }

    fn visit_method_call(&mut self, call: &MethodCallExpression) -> Result<(), CompileError> {
        match call {
            MethodCallExpression::Paging { skip, take } => {
                if let Some(take) = take {
                    self.select.limit(*take as u64);
                }
                if *skip > 0 {
                    self.select.offset(*skip as u64);
                }
            }
            MethodCallExpression::Call(call) => {
                warn!(method = %call.method, target = %call.target, "passthrough call has no SQL translation, skipped");
            }
        }
        Ok(())
    }
}

/// Compile a single comparison leaf
fn compile_comparison(
    member: &MemberExpression,
    operator: BinaryOperator,
    literal: &LiteralExpression,
) -> Result<SimpleExpr, CompileError> {
    let column = member.name().to_string();

    if member.condition.is_membership() {
        let items = match &literal.value {
            Value::List(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        return compile_membership(&column, items);
    }

    // 复合值按字段展开成 `{属性}_{字段}` 列
    let mut columns = Vec::new();
    flatten(&column, &literal.value, &mut columns);
    conjunction(columns, operator)
}

/// `values.Contains(x.Member)`: an IN list when every element flattens to the
/// same column, otherwise one conjunction per element ORed together.
fn compile_membership(column: &str, items: &[Value]) -> Result<SimpleExpr, CompileError> {
    let rows: Vec<Vec<(String, &Value)>> = items
        .iter()
        .map(|item| {
            let mut columns = Vec::new();
            flatten(column, item, &mut columns);
            columns
        })
        .collect();

    let shared = match rows.first() {
        None => Some(column.to_string()),
        Some(first) => match first.as_slice() {
            [(name, _)] if rows.iter().all(|row| matches!(row.as_slice(), [(n, _)] if n == name)) => Some(name.clone()),
            _ => None,
        },
    };

    if let Some(name) = shared {
        let values = rows
            .iter()
            .flatten()
            .map(|(_, value)| to_sql_value(value))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Expr::col(ColumnName(name)).is_in(values));
    }

    rows.into_iter()
        .map(|row| conjunction(row, BinaryOperator::Equal))
        .reduce(|acc, expr| match acc {
            Ok(acc) => expr.map(|expr| acc.or(expr)),
            Err(e) => Err(e),
        })
        .unwrap_or_else(|| Ok(Expr::val(false).into()))
}

fn conjunction(columns: Vec<(String, &Value)>, operator: BinaryOperator) -> Result<SimpleExpr, CompileError> {
    columns
        .into_iter()
        .map(|(column, value)| scalar_comparison(column, operator, value))
        .reduce(|acc, expr| match acc {
            Ok(acc) => expr.map(|expr| acc.and(expr)),
            Err(e) => Err(e),
        })
        .unwrap_or_else(|| Ok(Expr::val(true).into()))
}

fn flatten<'v>(prefix: &str, value: &'v Value, out: &mut Vec<(String, &'v Value)>) {
    match value {
        Value::Composite(composite) => {
            for (field, inner) in &composite.fields {
                flatten(&format!("{}_{}", prefix, field), inner, out);
            }
        }
        scalar => out.push((prefix.to_string(), scalar)),
    }
}

fn scalar_comparison(column: String, operator: BinaryOperator, value: &Value) -> Result<SimpleExpr, CompileError> {
    let col = Expr::col(ColumnName(column.clone()));

    if value.is_null() {
        return match operator {
            BinaryOperator::Equal => Ok(col.is_null()),
            BinaryOperator::NotEqual => Ok(col.is_not_null()),
            other => Err(CompileError::new(format!("Cannot compare NULL with {}", other.symbol()))),
        };
    }

    let val = to_sql_value(value)?;
    let expr = match operator {
        // 集合列包含某个值
        BinaryOperator::Contains => return Ok(Expr::cust_with_values(format!("? = ANY(\"{}\")", column), [val])),
        BinaryOperator::Equal => col.eq(val),
        BinaryOperator::NotEqual => col.ne(val),
        BinaryOperator::GreaterThan => col.gt(val),
        BinaryOperator::LessThan => col.lt(val),
        BinaryOperator::GreaterThanOrEqual => col.gte(val),
        BinaryOperator::LessThanOrEqual => col.lte(val),
    };
    Ok(expr)
}

/// Convert a materialized value to a sea-query Value
fn to_sql_value(value: &Value) -> Result<SqlValue, CompileError> {
    match value {
        Value::Null => Ok(SqlValue::String(None)),
        Value::Bool(b) => Ok(SqlValue::Bool(Some(*b))),
        Value::Int(n) => Ok(SqlValue::BigInt(Some(*n))),
        Value::Float(x) => Ok(SqlValue::Double(Some(*x))),
        Value::String(s) => Ok(SqlValue::String(Some(Box::new(s.clone())))),
        other => Err(CompileError::new(format!("Cannot bind a {} as a SQL value", other.kind()))),
    }
}
