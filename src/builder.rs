//! Condition tree builder.
//!
//! Walks a predicate body and grows the bucket's [`ConditionTree`]. AND/OR
//! nodes push a syntax frame that owns a tree group; every comparison leaf
//! pushes a frame of its own and consumes it when it is attached. A lone
//! comparison gets an implicit AND frame so it is attached the same way.
//!
//! The builder mutates the bucket directly. A failed build can leave it half
//! updated, so callers run it against a scratch copy.
//!
//! [`ConditionTree`]: crate::tree::ConditionTree

use crate::ast::{BinaryOperator, LogicalOperator};
use crate::bucket::{Bucket, QueryCondition};
use crate::error::{QueryError, Result};
use crate::expr::{BinaryOp, Environment, Expr, Lambda, MemberPath};
use crate::resolver::{PropertyResolver, Resolved};
use crate::schema::{PropertyType, Schema};
use crate::tree::GroupId;
use crate::value::Value;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct SyntaxFrame {
    id: usize,
    parent: Option<usize>,
    operator: LogicalOperator,
    /// Tree group owned by this frame; leaf frames own none.
    node: Option<GroupId>,
}

pub struct ConditionTreeBuilder<'a> {
    schema: &'a Schema,
    environment: &'a Environment,
    resolver: PropertyResolver<'a>,
    bucket: &'a mut Bucket,
    parameter: String,
    frames: Vec<SyntaxFrame>,
    next_id: usize,
}

impl<'a> ConditionTreeBuilder<'a> {
    pub fn new(schema: &'a Schema, environment: &'a Environment, bucket: &'a mut Bucket) -> Self {
        let resolver = PropertyResolver::new(schema, bucket.element.type_name.clone());
        Self {
            schema,
            environment,
            resolver,
            bucket,
            parameter: String::new(),
            frames: Vec::new(),
            next_id: 0,
        }
    }

    /// Compiles `predicate` into the bucket. A non-empty tree already on the
    /// bucket is ANDed with the new clauses.
    pub fn build(mut self, predicate: &Lambda) -> Result<()> {
        self.parameter = predicate.parameter.clone();
        let before = self.bucket.clause_count;

        self.walk(&predicate.body)?;

        self.bucket.tree.normalize();
        self.bucket.dirty = !self.bucket.tree.is_empty();
        debug!(
            bucket = %self.bucket.name,
            clauses = self.bucket.clause_count - before,
            tree = %self.bucket.tree,
            "compiled filter"
        );
        Ok(())
    }

    fn walk(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Binary { op, left, right } if op.is_logical() => self.walk_logical(combinator(*op), left, right),
            Expr::Binary { op, left, right } => self.comparison(comparison_operator(*op)?, left, right),
            Expr::Not(inner) => self.negated(inner),
            Expr::Convert(inner) => self.walk(inner),
            Expr::Member(path) if path.root == self.parameter => self.boolean_member(path, BinaryOperator::Equal),
            Expr::Call { method, .. } if method == "Contains" => self.contains(expr),
            other => Err(QueryError::unsupported(format!("`{}` is not a supported predicate", other))),
        }
    }

    fn walk_logical(&mut self, operator: LogicalOperator, left: &Expr, right: &Expr) -> Result<()> {
        let group = self.current_node(operator);
        let frame = self.push_frame(operator, Some(group));
        trace!(frame, operator = %operator, "enter group");

        self.walk(left)?;
        self.walk(right)?;

        self.pop_frame();
        Ok(())
    }

    /// Picks the tree group a new AND/OR combination attaches to.
    fn current_node(&mut self, operator: LogicalOperator) -> GroupId {
        let tree = &mut self.bucket.tree;
        match self.frames.iter().rev().find_map(|f| f.node) {
            Some(parent) => tree.new_group(operator, Some(parent)),
            // 之前的 filter 已经有条件了, 整体 AND 在上面
            None if !tree.is_empty() => {
                let outer = tree.wrap_root(LogicalOperator::And);
                tree.new_group(operator, Some(outer))
            }
            None => tree.new_group(operator, None),
        }
    }

    fn current_parent(&self) -> Option<GroupId> {
        self.frames.iter().rev().find_map(|f| f.node)
    }

    fn push_frame(&mut self, operator: LogicalOperator, node: Option<GroupId>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        let parent = self.frames.last().map(|f| f.id);
        self.frames.push(SyntaxFrame {
            id,
            parent,
            operator,
            node,
        });
        id
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            trace!(frame = frame.id, parent = ?frame.parent, operator = %frame.operator, "pop frame");
        }
    }

    fn negated(&mut self, inner: &Expr) -> Result<()> {
        match strip_convert(inner) {
            Expr::Member(path) if path.root == self.parameter => self.boolean_member(path, BinaryOperator::NotEqual),
            Expr::Binary { op, left, right } if !op.is_logical() => {
                let operator = comparison_operator(*op)?;
                let negated = operator
                    .negate()
                    .ok_or_else(|| QueryError::unsupported(format!("`{}` cannot be negated", operator.symbol())))?;
                self.comparison(negated, left, right)
            }
            other => Err(QueryError::unsupported(format!("negation of `{}` is not supported", other))),
        }
    }

    /// `x.IsAvailable` on its own means `x.IsAvailable == true`.
    fn boolean_member(&mut self, path: &MemberPath, operator: BinaryOperator) -> Result<()> {
        let resolved = self.resolver.resolve(path)?;
        if let Some(ty) = resolved.leaf_type() {
            if *ty != PropertyType::Bool {
                return Err(QueryError::unsupported(format!("`{}` is not a boolean member", path)));
            }
        }
        self.attach(path, resolved, operator, vec![Value::Bool(true)], false)
    }

    fn comparison(&mut self, operator: BinaryOperator, left: &Expr, right: &Expr) -> Result<()> {
        let (path, value, operator) = match (self.parameter_member(left), self.parameter_member(right)) {
            (Some(_), Some(_)) => {
                return Err(QueryError::unsupported(format!(
                    "member-to-member comparison `{} {} {}`",
                    left,
                    operator.symbol(),
                    right
                )))
            }
            (Some(path), None) => (path, right, operator),
            (None, Some(path)) => (path, left, operator.mirror()),
            (None, None) => {
                return Err(QueryError::unsupported(format!(
                    "comparison `{} {} {}` does not reference `{}`",
                    left,
                    operator.symbol(),
                    right,
                    self.parameter
                )))
            }
        };

        let value = self.environment.evaluate(value, Some(&self.parameter))?;
        let resolved = self.resolver.resolve(path)?;
        self.attach(path, resolved, operator, vec![value], false)
    }

    fn contains(&mut self, expr: &Expr) -> Result<()> {
        let Expr::Call { target, args, .. } = expr else {
            return Err(QueryError::unsupported(format!("`{}` is not a call", expr)));
        };
        let (receiver, item) = match (target.as_deref(), args.as_slice()) {
            (Some(receiver), [item]) => (receiver, item),
            (None, [receiver, item]) => (receiver, item),
            _ => return Err(QueryError::unsupported(format!("`{}` must test exactly one item", expr))),
        };

        // x.Tags.Contains("a")
        if let Some(path) = self.parameter_member(receiver) {
            if item.references(&self.parameter) {
                return Err(QueryError::unsupported(format!("correlated membership test `{}`", expr)));
            }
            let resolved = self.resolver.resolve(path)?;
            if let Some(ty) = resolved.leaf_type() {
                if !matches!(ty, PropertyType::List(_)) {
                    return Err(QueryError::unsupported(format!("`{}` is not a collection member", path)));
                }
            }
            let value = self.environment.evaluate(item, Some(&self.parameter))?;
            return self.attach(path, resolved, BinaryOperator::Contains, vec![value], false);
        }

        // ids.Contains(x.Id)
        if receiver.references(&self.parameter) {
            return Err(QueryError::unsupported(format!(
                "collection `{}` depends on `{}`; correlated collections are not supported",
                receiver, self.parameter
            )));
        }
        let path = self
            .parameter_member(item)
            .ok_or_else(|| QueryError::unsupported(format!("`{}` must test a member of `{}`", expr, self.parameter)))?;
        let values = match self.environment.evaluate(receiver, Some(&self.parameter))? {
            Value::List(values) => values,
            other => {
                return Err(QueryError::Evaluation {
                    expr: receiver.to_string(),
                    reason: format!("expected a collection, found a {}", other.kind()),
                })
            }
        };
        let resolved = self.resolver.resolve(path)?;
        self.attach(path, resolved, BinaryOperator::Contains, values, true)
    }

    /// Records the values on the bucket and hangs a leaf under the current
    /// group. A `membership` leaf tests the property against every value.
    fn attach(
        &mut self,
        path: &MemberPath,
        resolved: Resolved,
        operator: BinaryOperator,
        values: Vec<Value>,
        membership: bool,
    ) -> Result<()> {
        let implicit = self.current_parent().is_none();
        let frame = self.push_frame(
            if implicit { LogicalOperator::And } else { LogicalOperator::None },
            None,
        );

        let Some(property) = resolved.property() else {
            warn!(path = %path, "skipping ignored property");
            self.pop_frame();
            return Ok(());
        };

        let conditions: Vec<QueryCondition> = values
            .into_iter()
            .map(|v| QueryCondition::new(resolved.materialize(v), operator))
            .collect();
        for condition in &conditions {
            self.bucket.record(self.schema, property, condition.clone())?;
        }
        let leaf = self
            .bucket
            .item(property)
            .map(|item| {
                let leaf = item.leaf(operator, conditions);
                if membership {
                    leaf.into_membership()
                } else {
                    leaf
                }
            })
            .ok_or_else(|| QueryError::unresolved(path.to_string(), "property is not part of the bucket"))?;
        self.bucket.clause_count += 1;

        self.pop_frame();
        let parent = self.current_parent();
        trace!(frame, path = %path, operator = operator.symbol(), parent = ?parent, "attach leaf");
        self.bucket.tree.push_leaf(parent, leaf);
        Ok(())
    }

    fn parameter_member<'e>(&self, expr: &'e Expr) -> Option<&'e MemberPath> {
        match strip_convert(expr) {
            Expr::Member(path) if path.root == self.parameter => Some(path),
            _ => None,
        }
    }
}

fn strip_convert(expr: &Expr) -> &Expr {
    match expr {
        Expr::Convert(inner) => strip_convert(inner),
        other => other,
    }
}

/// Strict and short-circuit variants map to the same combinator.
fn combinator(op: BinaryOp) -> LogicalOperator {
    match op {
        BinaryOp::AndAlso | BinaryOp::And => LogicalOperator::And,
        _ => LogicalOperator::Or,
    }
}

fn comparison_operator(op: BinaryOp) -> Result<BinaryOperator> {
    Ok(match op {
        BinaryOp::Equal => BinaryOperator::Equal,
        BinaryOp::NotEqual => BinaryOperator::NotEqual,
        BinaryOp::LessThan => BinaryOperator::LessThan,
        BinaryOp::LessThanOrEqual => BinaryOperator::LessThanOrEqual,
        BinaryOp::GreaterThan => BinaryOperator::GreaterThan,
        BinaryOp::GreaterThanOrEqual => BinaryOperator::GreaterThanOrEqual,
        other => {
            return Err(QueryError::unsupported(format!(
                "`{}` is not a comparison operator",
                other.symbol()
            )))
        }
    })
}
