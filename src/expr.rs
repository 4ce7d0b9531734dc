//! Host-agnostic predicate IR.
//!
//! Front ends (the text parser, the fluent constructors below, or any other
//! shim) produce [`Lambda`]s over [`Expr`]; the compiler never sees host syntax.

use crate::error::{QueryError, Result};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Operators as they appear in the host expression, before classification.
///
/// Strict (`&`, `|`) and short-circuit (`&&`, `||`) variants are kept apart
/// here and only merged when the builder maps them onto a combinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    AndAlso,
    And,
    OrElse,
    Or,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl BinaryOp {
    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::AndAlso | BinaryOp::And | BinaryOp::OrElse | BinaryOp::Or)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::AndAlso => "&&",
            BinaryOp::And => "&",
            BinaryOp::OrElse => "||",
            BinaryOp::Or => "|",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
        }
    }
}

/// A member-access chain such as `x.Shelf.City`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberPath {
    pub root: String,
    pub segments: Vec<String>,
}

impl MemberPath {
    pub fn new<S: Into<String>>(root: impl Into<String>, segments: impl IntoIterator<Item = S>) -> Self {
        Self {
            root: root.into(),
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The accessed member, i.e. the last segment.
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl fmt::Display for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A bare identifier: a captured variable.
    Variable(String),
    Member(MemberPath),
    List(Vec<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    /// Conversion wrapper, e.g. an enum compared as its underlying integer.
    Convert(Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        method: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn member<S: Into<String>>(root: impl Into<String>, segments: impl IntoIterator<Item = S>) -> Expr {
        Expr::Member(MemberPath::new(root, segments))
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Variable(name.into())
    }

    pub fn call(target: Option<Expr>, method: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            target: target.map(Box::new),
            method: method.into(),
            args,
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Equal, self, rhs.into())
    }

    pub fn not_equals(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::NotEqual, self, rhs.into())
    }

    pub fn less_than(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::LessThan, self, rhs.into())
    }

    pub fn greater_than(self, rhs: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::GreaterThan, self, rhs.into())
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::AndAlso, self, rhs)
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::OrElse, self, rhs)
    }

    /// `self.Contains(item)`
    pub fn contains(self, item: impl Into<Expr>) -> Expr {
        Expr::call(Some(self), "Contains", vec![item.into()])
    }

    /// True if any member path in this expression is rooted at `parameter`.
    pub fn references(&self, parameter: &str) -> bool {
        match self {
            Expr::Literal(_) => false,
            Expr::Variable(name) => name == parameter,
            Expr::Member(path) => path.root == parameter,
            Expr::List(items) => items.iter().any(|e| e.references(parameter)),
            Expr::Binary { left, right, .. } => left.references(parameter) || right.references(parameter),
            Expr::Not(inner) | Expr::Convert(inner) => inner.references(parameter),
            Expr::Call { target, args, .. } => {
                target.as_ref().is_some_and(|t| t.references(parameter))
                    || args.iter().any(|e| e.references(parameter))
            }
        }
    }
}

impl std::ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

macro_rules! literal_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Expr {
                fn from(value: $ty) -> Self {
                    Expr::Literal(value.into())
                }
            }
        )*
    };
}

literal_from!(Value, bool, i32, i64, f64, &str, String);

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Member(path) => write!(f, "{}", path),
            Expr::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Binary { op, left, right } => write!(f, "({} {} {})", left, op.symbol(), right),
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::Convert(inner) => write!(f, "Convert({})", inner),
            Expr::Call { target, method, args } => {
                if let Some(target) = target {
                    write!(f, "{}.", target)?;
                }
                write!(f, "{}(", method)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A single-parameter lambda: `x => body`.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub parameter: String,
    pub body: Expr,
}

impl Lambda {
    pub fn new(parameter: impl Into<String>, body: Expr) -> Self {
        Self {
            parameter: parameter.into(),
            body,
        }
    }
}

impl fmt::Display for Lambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.parameter, self.body)
    }
}

/// One argument of a pipeline step: either a lambda or a plain expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Lambda(Lambda),
    Value(Expr),
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Lambda(l) => write!(f, "{}", l),
            Argument::Value(e) => write!(f, "{}", e),
        }
    }
}

/// `.Method(args)` in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodInvocation {
    pub method: String,
    pub args: Vec<Argument>,
}

impl MethodInvocation {
    pub fn new(method: impl Into<String>, args: Vec<Argument>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// `Book.Where(x => ..).OrderBy(x => x.Id).Take(5)`
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub source: String,
    pub steps: Vec<MethodInvocation>,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        for step in &self.steps {
            write!(f, ".{}(", step.method)?;
            for (i, arg) in step.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", arg)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub type HostFunction =Arc<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync>;

/// Captured state a predicate may refer to: local variables and host
/// functions. Everything is evaluated once, at compile time.
#[derive(Clone, Default)]
pub struct Environment {
    variables: HashMap<String, Value>,
    functions: HashMap<String, HostFunction>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        f.debug_struct("Environment")
            .field("variables", &self.variables)
            .field("functions", &functions)
            .finish()
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bind(name, value);
        self
    }

    /// Registers a host function. Method-style calls (`target.Method(a)`)
    /// receive the target as their first argument.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    /// Materializes a sub-expression that does not depend on `parameter`.
    pub fn evaluate(&self, expr: &Expr, parameter: Option<&str>) -> Result<Value> {
        let fail = |reason: String| QueryError::Evaluation {
            expr: expr.to_string(),
            reason,
        };

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Variable(name) => {
                if Some(name.as_str()) == parameter {
                    return Err(QueryError::unsupported(format!(
                        "the query parameter `{}` cannot be used as a value",
                        name
                    )));
                }
                self.variables
                    .get(name)
                    .cloned()
                    .ok_or_else(|| fail(format!("unbound variable `{}`", name)))
            }
            Expr::Member(path) => {
                if Some(path.root.as_str()) == parameter {
                    return Err(QueryError::unsupported(format!(
                        "`{}` depends on the query parameter and cannot be materialized",
                        path
                    )));
                }
                let mut current = self
                    .variables
                    .get(&path.root)
                    .ok_or_else(|| fail(format!("unbound variable `{}`", path.root)))?;
                for segment in &path.segments {
                    current = match current {
                        Value::Composite(c) => c
                            .get(segment)
                            .ok_or_else(|| fail(format!("`{}` has no field `{}`", c.type_name, segment)))?,
                        other => return Err(fail(format!("cannot access `{}` on a {}", segment, other.kind()))),
                    };
                }
                Ok(current.clone())
            }
            Expr::List(items) => items
                .iter()
                .map(|item| self.evaluate(item, parameter))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expr::Not(inner) => match self.evaluate(inner, parameter)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(fail(format!("cannot negate a {}", other.kind()))),
            },
            Expr::Convert(inner) => self.evaluate(inner, parameter),
            Expr::Binary { .. } => Err(QueryError::unsupported(format!(
                "operator expressions are not materialized: `{}`",
                expr
            ))),
            Expr::Call { target, method, args } => {
                let mut values = Vec::with_capacity(args.len() + 1);
                if let Some(target) = target {
                    values.push(self.evaluate(target, parameter)?);
                }
                for arg in args {
                    values.push(self.evaluate(arg, parameter)?);
                }
                let function = self
                    .functions
                    .get(method)
                    .ok_or_else(|| fail(format!("no host function named `{}`", method)))?;
                function(&values).map_err(fail)
            }
        }
    }
}
