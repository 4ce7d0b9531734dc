//! Test-only front-end helpers and backends.

use crate::ast::{
    BinaryExpression, BinaryOperator, Expression, LambdaExpression, LiteralExpression, LogicalExpression, LogicalOperator,
    MemberExpression, MethodCallExpression, OrderbyExpression, TypeExpression,
};
use crate::backend::{Backend, BackendError};
use crate::expr::{Lambda, Pipeline};
use crate::value::Value;
use crate::visitor::{walk_lambda, Visitor};
use serde_json::{json, Value as Json};
use std::cmp::Ordering;
use std::convert::Infallible;

pub(crate) fn lambda(input: &str) -> Lambda {
    input.parse().unwrap()
}

pub(crate) fn pipeline(input: &str) -> Pipeline {
    input.parse().unwrap()
}

/// 把 AST 渲染成伪 SQL 文本
#[derive(Debug, Default)]
pub(crate) struct TextRenderer {
    pub output: String,
}

impl Visitor for TextRenderer {
    type Error = Infallible;

    fn visit_type(&mut self, ty: &TypeExpression) -> Result<(), Infallible> {
        self.output.push_str(&format!("select * from {}", ty.ty.name()));
        Ok(())
    }

    fn visit_lambda(&mut self, lambda: &LambdaExpression) -> Result<(), Infallible> {
        if lambda.body.is_some() {
            self.output.push_str("\nwhere\n");
        }
        walk_lambda(self, lambda)
    }

    fn visit_logical(&mut self, logical: &LogicalExpression) -> Result<(), Infallible> {
        if logical.is_child {
            self.output.push('(');
        }
        self.visit(&logical.left)?;
        self.output.push_str(&format!(" {} ", logical.operator));
        self.visit(&logical.right)?;
        if logical.is_child {
            self.output.push(')');
        }
        Ok(())
    }

    fn visit_binary(&mut self, binary: &BinaryExpression) -> Result<(), Infallible> {
        self.visit(&binary.left)?;
        self.output.push_str(&format!(" {} ", binary.operator.symbol()));
        self.visit(&binary.right)
    }

    fn visit_member(&mut self, member: &MemberExpression) -> Result<(), Infallible> {
        self.output.push_str(&member.full_name());
        Ok(())
    }

    fn visit_literal(&mut self, literal: &LiteralExpression) -> Result<(), Infallible> {
        self.output.push_str(&literal.value.to_string());
        Ok(())
    }

    fn visit_orderby(&mut self, orderby: &OrderbyExpression) -> Result<(), Infallible> {
        let direction = if orderby.ascending { "asc" } else { "desc" };
        self.output
            .push_str(&format!("\norder by {} {}\n", orderby.member.full_name(), direction));
        Ok(())
    }
}

/// Returns the rendered text as its only row.
#[derive(Debug, Default)]
pub(crate) struct TextBackend {
    pub executions: usize,
}

impl Backend for TextBackend {
    type Item = String;

    fn execute(&mut self, ast: &Expression) -> Result<Vec<String>, BackendError> {
        self.executions += 1;
        let mut renderer = TextRenderer::default();
        if let Err(never) = renderer.visit(ast) {
            match never {}
        }
        Ok(vec![renderer.output])
    }
}

/// Always fails.
pub(crate) struct FailingBackend;

impl Backend for FailingBackend {
    type Item = ();

    fn execute(&mut self, _ast: &Expression) -> Result<Vec<()>, BackendError> {
        Err("connection refused".into())
    }
}

/// Evaluates the AST against rows held in memory.
#[derive(Debug)]
pub(crate) struct MemoryBackend {
    rows: Vec<Json>,
    pub executions: usize,
}

impl MemoryBackend {
    pub fn new(rows: Vec<Json>) -> Self {
        Self { rows, executions: 0 }
    }
}

impl Backend for MemoryBackend {
    type Item = Json;

    fn execute(&mut self, ast: &Expression) -> Result<Vec<Json>, BackendError> {
        self.executions += 1;
        let block = ast.as_block().ok_or("expected a block expression")?;

        let mut rows = Vec::new();
        for row in &self.rows {
            let keep = match block.lambda().and_then(|l| l.body.as_deref()) {
                Some(body) => holds(body, row)?,
                None => true,
            };
            if keep {
                rows.push(row.clone());
            }
        }

        let keys: Vec<_> = block.order_by().collect();
        rows.sort_by(|a, b| {
            keys.iter()
                .map(|key| {
                    let field = key.member.property_name.as_str();
                    let ord = compare_json(a.get(field), b.get(field));
                    if key.ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });

        for call in block.method_calls() {
            if let MethodCallExpression::Paging { skip, take } = call {
                rows = rows
                    .into_iter()
                    .skip(*skip)
                    .take(take.unwrap_or(usize::MAX))
                    .collect();
            }
        }
        Ok(rows)
    }

    fn project(&self, item: &Json, path: &[String]) -> Result<Json, BackendError> {
        Ok(path
            .iter()
            .try_fold(item, |value, field| value.get(field))
            .cloned()
            .unwrap_or(Json::Null))
    }
}

fn holds(expr: &Expression, row: &Json) -> Result<bool, BackendError> {
    match expr {
        Expression::Logical(logical) => {
            let left = holds(&logical.left, row)?;
            match logical.operator {
                LogicalOperator::Or => Ok(left || holds(&logical.right, row)?),
                _ => Ok(left && holds(&logical.right, row)?),
            }
        }
        Expression::Binary(binary) => match (binary.left.as_ref(), binary.right.as_ref()) {
            (Expression::Member(member), Expression::Literal(literal)) => {
                let actual = row.get(&member.condition.property_name);
                Ok(match (&literal.value, member.condition.is_membership()) {
                    (Value::List(items), true) => items
                        .iter()
                        .any(|item| matches_value(actual, BinaryOperator::Equal, item)),
                    (value, _) => matches_value(actual, binary.operator, value),
                })
            }
            _ => Err("a comparison must put the member on the left".into()),
        },
        other => Err(format!("cannot evaluate {:?} as a predicate", other.code_type()).into()),
    }
}

fn matches_value(actual: Option<&Json>, operator: BinaryOperator, expected: &Value) -> bool {
    match (operator, expected) {
        (_, Value::Composite(composite)) => composite
            .fields
            .iter()
            .all(|(field, value)| matches_value(actual.and_then(|a| a.get(field)), operator, value)),
        (BinaryOperator::Contains, item) => actual
            .and_then(Json::as_array)
            .is_some_and(|elements| {
                elements
                    .iter()
                    .any(|e| matches_value(Some(e), BinaryOperator::Equal, item))
            }),
        (operator, value) => {
            let ord = compare_value(actual, value);
            match operator {
                BinaryOperator::Equal => ord == Some(Ordering::Equal),
                BinaryOperator::NotEqual => ord != Some(Ordering::Equal),
                BinaryOperator::LessThan => ord == Some(Ordering::Less),
                BinaryOperator::LessThanOrEqual => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                BinaryOperator::GreaterThan => ord == Some(Ordering::Greater),
                BinaryOperator::GreaterThanOrEqual => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                BinaryOperator::Contains => false,
            }
        }
    }
}

fn compare_value(actual: Option<&Json>, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (None | Some(Json::Null), Value::Null) => Some(Ordering::Equal),
        (Some(Json::Bool(a)), Value::Bool(b)) => Some(a.cmp(b)),
        (Some(Json::Number(n)), Value::Int(i)) => n.as_f64()?.partial_cmp(&(*i as f64)),
        (Some(Json::Number(n)), Value::Float(x)) => n.as_f64()?.partial_cmp(x),
        (Some(Json::String(a)), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn compare_json(a: Option<&Json>, b: Option<&Json>) -> Ordering {
    match (a, b) {
        (Some(Json::Number(a)), Some(Json::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Json::String(a)), Some(Json::String(b))) => a.cmp(b),
        (Some(Json::Bool(a)), Some(Json::Bool(b))) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

/// Rows matching the `library_schema` Book type.
pub(crate) fn books() -> Vec<Json> {
    vec![
        json!({
            "Id": 1, "Author": "Charlie", "Title": "Programming Rust", "IsAvailable": true,
            "Tags": ["systems", "rust"],
            "Shelf": { "City": "Oslo", "Street": "Main", "Labels": ["quiet"], "Geo": { "Lat": 59.9, "Lon": 10.7 } }
        }),
        json!({
            "Id": 2, "Author": "Scott", "Title": "CLR via C#", "IsAvailable": false,
            "Tags": ["dotnet"],
            "Shelf": { "City": "Bergen", "Street": "Harbour", "Labels": ["busy", "quiet"], "Geo": { "Lat": 60.4, "Lon": 5.3 } }
        }),
        json!({
            "Id": 3, "Author": "Tom", "Title": "Operating Systems", "IsAvailable": true,
            "Tags": ["systems"],
            "Shelf": { "City": "Oslo", "Street": "Side", "Geo": { "Lat": 58.0, "Lon": 10.7 } }
        }),
        json!({
            "Id": 4, "Author": "Scott", "Title": "Pro Git", "IsAvailable": true,
            "Tags": [],
            "Shelf": { "City": "Bergen" }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_value_composites() {
        let row = &books()[0];
        let mut geo = crate::value::CompositeValue::new("Geo");
        geo.set("Lat", Value::Float(59.0));
        let mut shelf = crate::value::CompositeValue::new("Address");
        shelf.set("Geo", Value::Composite(geo));

        let shelf = Value::Composite(shelf);
        assert!(matches_value(row.get("Shelf"), BinaryOperator::GreaterThan, &shelf));
        assert!(!matches_value(books()[2].get("Shelf"), BinaryOperator::GreaterThan, &shelf));
        assert!(!matches_value(books()[3].get("Shelf"), BinaryOperator::GreaterThan, &shelf));
    }
}
