//! 编译结果的通用 AST, 交给后端遍历
//!
//! The tree is write-once: the compiler builds it, backends only read it.

use crate::bucket::{Condition, MethodCall};
use crate::schema::{MemberReference, PropertyType, TypeRef};
use crate::value::Value;
use std::fmt;

/// Combinator of a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LogicalOperator {
    /// Used for a frame that has not combined anything yet.
    #[default]
    None,
    And,
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOperator::None => write!(f, "NONE"),
            LogicalOperator::And => write!(f, "AND"),
            LogicalOperator::Or => write!(f, "OR"),
        }
    }
}

/// Comparison applied by a leaf condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// Collection membership.
    Contains,
}

impl BinaryOperator {
    /// The operator that holds when the operands are swapped (`1 < x` is `x > 1`).
    pub fn mirror(self) -> Self {
        match self {
            BinaryOperator::LessThan => BinaryOperator::GreaterThan,
            BinaryOperator::LessThanOrEqual => BinaryOperator::GreaterThanOrEqual,
            BinaryOperator::GreaterThan => BinaryOperator::LessThan,
            BinaryOperator::GreaterThanOrEqual => BinaryOperator::LessThanOrEqual,
            other => other,
        }
    }

    /// Logical complement, if one exists.
    pub fn negate(self) -> Option<Self> {
        match self {
            BinaryOperator::Equal => Some(BinaryOperator::NotEqual),
            BinaryOperator::NotEqual => Some(BinaryOperator::Equal),
            BinaryOperator::LessThan => Some(BinaryOperator::GreaterThanOrEqual),
            BinaryOperator::LessThanOrEqual => Some(BinaryOperator::GreaterThan),
            BinaryOperator::GreaterThan => Some(BinaryOperator::LessThanOrEqual),
            BinaryOperator::GreaterThanOrEqual => Some(BinaryOperator::LessThan),
            BinaryOperator::Contains => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "<>",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanOrEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanOrEqual => ">=",
            BinaryOperator::Contains => "IN",
        }
    }
}

/// Tag used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeType {
    BinaryExpression,
    LogicalExpression,
    TypeExpression,
    MemberExpression,
    LiteralExpression,
    LambdaExpression,
    BlockExpression,
    OrderbyExpression,
    MethodCallExpression,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Type(TypeExpression),
    Lambda(LambdaExpression),
    Logical(LogicalExpression),
    Binary(BinaryExpression),
    Member(MemberExpression),
    Literal(LiteralExpression),
    Orderby(OrderbyExpression),
    MethodCall(MethodCallExpression),
    Block(BlockExpression),
}

impl Expression {
    pub fn code_type(&self) -> CodeType {
        match self {
            Expression::Type(_) => CodeType::TypeExpression,
            Expression::Lambda(_) => CodeType::LambdaExpression,
            Expression::Logical(_) => CodeType::LogicalExpression,
            Expression::Binary(_) => CodeType::BinaryExpression,
            Expression::Member(_) => CodeType::MemberExpression,
            Expression::Literal(_) => CodeType::LiteralExpression,
            Expression::Orderby(_) => CodeType::OrderbyExpression,
            Expression::MethodCall(_) => CodeType::MethodCallExpression,
            Expression::Block(_) => CodeType::BlockExpression,
        }
    }

    pub fn as_block(&self) -> Option<&BlockExpression> {
        match self {
            Expression::Block(block) => Some(block),
            _ => None,
        }
    }
}

/// Names the root entity.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpression {
    pub ty: TypeRef,
}

/// Wraps a predicate body. `body` is `None` for an empty predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpression {
    pub ty: TypeRef,
    pub body: Option<Box<Expression>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalExpression {
    pub operator: LogicalOperator,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
    /// Set when this group sits under another logical expression; infix
    /// renderers wrap such nodes in parentheses.
    pub is_child: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpression {
    pub operator: BinaryOperator,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
}

/// The property being compared.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberExpression {
    pub condition: Condition,
}

impl MemberExpression {
    pub fn declaring_type(&self) -> &TypeRef {
        &self.condition.declaring_type
    }

    pub fn name(&self) -> &str {
        &self.condition.name
    }

    /// `Type.Property`, both with display-name overrides applied.
    pub fn full_name(&self) -> String {
        self.condition.full_name()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiteralExpression {
    pub ty: PropertyType,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderbyExpression {
    pub member: MemberReference,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodCallExpression {
    Paging { skip: usize, take: Option<usize> },
    /// A call the compiler does not interpret, passed through as data.
    Call(MethodCall),
}

/// The top-level container handed to a backend.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockExpression {
    pub expressions: Vec<Expression>,
}

impl BlockExpression {
    pub fn type_expression(&self) -> Option<&TypeExpression> {
        self.expressions.iter().find_map(|e| match e {
            Expression::Type(t) => Some(t),
            _ => None,
        })
    }

    pub fn lambda(&self) -> Option<&LambdaExpression> {
        self.expressions.iter().find_map(|e| match e {
            Expression::Lambda(l) => Some(l),
            _ => None,
        })
    }

    pub fn order_by(&self) -> impl Iterator<Item = &OrderbyExpression> {
        self.expressions.iter().filter_map(|e| match e {
            Expression::Orderby(o) => Some(o),
            _ => None,
        })
    }

    pub fn method_calls(&self) -> impl Iterator<Item = &MethodCallExpression> {
        self.expressions.iter().filter_map(|e| match e {
            Expression::MethodCall(m) => Some(m),
            _ => None,
        })
    }
}
