//! Compilation driver.
//!
//! A [`QueryContext`] owns the schema, the captured environment, the backend
//! and one slot per element type. [`QueryContext::from`] starts a query with a
//! fresh bucket; every chained call on the returned [`Query`] compiles into
//! that bucket. The first terminal call renders the bucket into a
//! [`BlockExpression`], hands it to the backend exactly once and caches the
//! result, so later terminals on the same state reuse it.
//!
//! Every chained call works on a copy of the bucket and only commits it when
//! the call succeeds.

use crate::ast::{
    BinaryExpression, BinaryOperator, BlockExpression, Expression, LambdaExpression, LiteralExpression,
    LogicalExpression, MemberExpression, MethodCallExpression, OrderbyExpression, TypeExpression,
};
use crate::backend::Backend;
use crate::bucket::{Bucket, Condition, MethodCall, OrderByInfo, QueryState};
use crate::builder::ConditionTreeBuilder;
use crate::error::{QueryError, Result};
use crate::expr::{Argument, Environment, Expr, Lambda, MethodInvocation, Pipeline};
use crate::resolver::{PropertyResolver, Resolved};
use crate::schema::{PropertyType, Schema};
use crate::tree::{ConditionTree, Node};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

struct Slot<T> {
    bucket: Bucket,
    ast: Option<Arc<Expression>>,
    results: Option<Vec<T>>,
}

impl<T> Slot<T> {
    fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            ast: None,
            results: None,
        }
    }
}

pub struct QueryContext<B: Backend> {
    schema: Schema,
    environment: Environment,
    backend: B,
    buckets: HashMap<String, Slot<B::Item>>,
}

impl<B: Backend> QueryContext<B> {
    pub fn new(schema: Schema, backend: B) -> Self {
        Self {
            schema,
            environment: Environment::new(),
            backend,
            buckets: HashMap::new(),
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Environment {
        &mut self.environment
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// The bucket currently registered for `element`.
    pub fn bucket(&self, element: &str) -> Option<&Bucket> {
        self.buckets.get(element).map(|slot| &slot.bucket)
    }

    /// The AST last rendered for `element`, if any.
    pub fn ast(&self, element: &str) -> Option<Arc<Expression>> {
        self.buckets.get(element).and_then(|slot| slot.ast.clone())
    }

    /// Starts a new query over `element`, discarding whatever was
    /// accumulated for it before.
    pub fn from(&mut self, element: &str) -> Result<Query<'_, B>> {
        let bucket = Bucket::new(&self.schema, element)?;
        debug!(element, "new query");
        self.buckets.insert(element.to_string(), Slot::new(bucket));
        Ok(Query {
            ctx: self,
            element: element.to_string(),
            projection: None,
        })
    }

    /// Continues the chain registered for `element`, starting one if needed.
    pub fn query(&mut self, element: &str) -> Result<Query<'_, B>> {
        if !self.buckets.contains_key(element) {
            return self.from(element);
        }
        Ok(Query {
            ctx: self,
            element: element.to_string(),
            projection: None,
        })
    }
}

impl<B: Backend> QueryContext<B>
where
    B::Item: Clone,
{
    /// Applies a parsed pipeline step by step. A trailing terminal decides the
    /// outcome; without one the pipeline is materialized as a list.
    pub fn run(&mut self, pipeline: &Pipeline) -> Result<Outcome<B::Item>> {
        debug!(pipeline = %pipeline, "running pipeline");
        let mut query = self.from(&pipeline.source)?;

        let (terminal, steps) = match pipeline.steps.split_last() {
            Some((last, rest)) if Terminal::parse(&last.method).is_some() => (Some(last), rest),
            _ => (None, pipeline.steps.as_slice()),
        };
        for step in steps {
            query = query.apply(step)?;
        }
        match terminal {
            Some(step) => query.terminal(step),
            None => query.to_vec().map(Outcome::Items),
        }
    }
}

/// What a pipeline produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Items(Vec<T>),
    Item(Option<T>),
    Count(usize),
    Any(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    ToList,
    Count,
    Any,
    First,
    FirstOrDefault,
    Last,
    LastOrDefault,
    Single,
    SingleOrDefault,
}

impl Terminal {
    fn parse(method: &str) -> Option<Self> {
        Some(match method {
            "ToList" | "ToArray" => Terminal::ToList,
            "Count" => Terminal::Count,
            "Any" => Terminal::Any,
            "First" => Terminal::First,
            "FirstOrDefault" => Terminal::FirstOrDefault,
            "Last" => Terminal::Last,
            "LastOrDefault" => Terminal::LastOrDefault,
            "Single" => Terminal::Single,
            "SingleOrDefault" => Terminal::SingleOrDefault,
            _ => return None,
        })
    }
}

/// A query in progress over one element type.
pub struct Query<'c, B: Backend> {
    ctx: &'c mut QueryContext<B>,
    element: String,
    /// Member path set by a pipeline `Select`; applied to items on the way out.
    projection: Option<Vec<String>>,
}

impl<'c, B: Backend> Query<'c, B> {
    pub fn element(&self) -> &str {
        &self.element
    }

    pub fn bucket(&self) -> Option<&Bucket> {
        self.ctx.bucket(&self.element)
    }

    pub fn state(&self) -> QueryState {
        self.bucket().map(Bucket::state).unwrap_or(QueryState::Empty)
    }

    /// ANDs `predicate` into the accumulated filter.
    pub fn filter(mut self, predicate: &Lambda) -> Result<Self> {
        debug!(element = %self.element, predicate = %predicate, "filter");
        self.update(|schema, environment, bucket| {
            ConditionTreeBuilder::new(schema, environment, bucket).build(predicate)
        })?;
        Ok(self)
    }

    /// Appends an ascending sort key.
    pub fn order_by(self, key: &Lambda) -> Result<Self> {
        self.sort(key, true)
    }

    /// Appends a descending sort key.
    pub fn order_by_descending(self, key: &Lambda) -> Result<Self> {
        self.sort(key, false)
    }

    /// Secondary sort key. Keys are kept in call order, so this is the same
    /// as another `order_by`.
    pub fn then_by(self, key: &Lambda) -> Result<Self> {
        self.sort(key, true)
    }

    /// Descending secondary sort key, same as another `order_by_descending`.
    pub fn then_by_descending(self, key: &Lambda) -> Result<Self> {
        self.sort(key, false)
    }

    /// Last call wins.
    pub fn take(mut self, count: usize) -> Result<Self> {
        self.update(|_, _, bucket| {
            bucket.take = Some(count);
            Ok(())
        })?;
        Ok(self)
    }

    /// Last call wins.
    pub fn skip(mut self, count: usize) -> Result<Self> {
        self.update(|_, _, bucket| {
            bucket.skip = count;
            Ok(())
        })?;
        Ok(self)
    }

    /// Records a method the compiler does not interpret. Arguments are
    /// evaluated now; the backend only ever sees their values.
    pub fn call(mut self, method: &str, args: &[Expr]) -> Result<Self> {
        if matches!(method, "Join" | "GroupJoin") {
            return Err(QueryError::unsupported(format!("`{}` is not supported", method)));
        }
        let arguments = args
            .iter()
            .map(|arg| self.ctx.environment.evaluate(arg, None))
            .collect::<Result<Vec<Value>>>()?;
        debug!(element = %self.element, method, "passthrough call");
        self.update(|_, _, bucket| {
            bucket.methods.push(MethodCall {
                target: bucket.name.clone(),
                method: method.to_string(),
                arguments,
            });
            Ok(())
        })?;
        Ok(self)
    }

    /// Applies one non-terminal pipeline step.
    pub fn apply(self, step: &MethodInvocation) -> Result<Self> {
        let method = step.method.as_str();
        if matches!(method, "Join" | "GroupJoin") {
            return Err(QueryError::unsupported(format!("`{}` is not supported", method)));
        }
        if Terminal::parse(method).is_some() {
            return Err(QueryError::unsupported(format!("`{}` must end the pipeline", method)));
        }

        let interpreted = matches!(
            method,
            "Where" | "OrderBy" | "OrderByDescending" | "ThenBy" | "ThenByDescending" | "Take" | "Skip" | "Select"
        );
        if self.projection.is_some() && !matches!(method, "Take" | "Skip") && interpreted {
            return Err(QueryError::unsupported(format!("`{}` after `Select` is not supported", method)));
        }
        if interpreted && step.args.len() != 1 {
            return Err(QueryError::unsupported(format!(
                "`{}` takes exactly one argument, got {}",
                method,
                step.args.len()
            )));
        }

        match method {
            "Where" => self.filter(lambda_argument(step)?),
            "OrderBy" => self.order_by(lambda_argument(step)?),
            "OrderByDescending" => self.order_by_descending(lambda_argument(step)?),
            "ThenBy" => self.then_by(lambda_argument(step)?),
            "ThenByDescending" => self.then_by_descending(lambda_argument(step)?),
            "Take" => {
                let count = self.count_argument(step)?;
                self.take(count)
            }
            "Skip" => {
                let count = self.count_argument(step)?;
                self.skip(count)
            }
            "Select" => self.project_onto(lambda_argument(step)?),
            _ => {
                let args = step
                    .args
                    .iter()
                    .map(|arg| match arg {
                        Argument::Value(expr) => Ok(expr.clone()),
                        Argument::Lambda(l) => Err(QueryError::unsupported(format!(
                            "lambda argument `{}` to `{}` cannot be passed through",
                            l, method
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.call(method, &args)
            }
        }
    }

    /// Projects the materialized items with `projector`.
    pub fn select<F, R>(self, projector: F) -> Projected<'c, B, F>
    where
        F: FnMut(&B::Item) -> R,
    {
        Projected { query: self, projector }
    }

    /// Renders the current state without executing it. The AST is cached
    /// until the next chained call.
    pub fn ast(&mut self) -> Result<Arc<Expression>> {
        let slot = self.slot_mut()?;
        if let Some(ast) = &slot.ast {
            return Ok(Arc::clone(ast));
        }
        let ast = Arc::new(render(&slot.bucket));
        slot.ast = Some(Arc::clone(&ast));
        Ok(ast)
    }

    pub fn count(&mut self) -> Result<usize> {
        Ok(self.execute()?.len())
    }

    pub fn any(&mut self) -> Result<bool> {
        Ok(!self.execute()?.is_empty())
    }

    fn sort(mut self, key: &Lambda, ascending: bool) -> Result<Self> {
        let path = match strip_convert(&key.body) {
            Expr::Member(path) if path.root == key.parameter => path.clone(),
            other => {
                return Err(QueryError::unsupported(format!(
                    "ordering key `{}` must be a member of `{}`",
                    other, key.parameter
                )))
            }
        };
        self.update(|schema, _, bucket| {
            let resolver = PropertyResolver::new(schema, bucket.element.type_name.clone());
            match resolver.member_reference(&path)? {
                Some(member) => {
                    debug!(key = %member.full_name(), ascending, "order by");
                    bucket.order_by.push(OrderByInfo { member, ascending });
                }
                None => warn!(key = %path, "skipping ordering on ignored property"),
            }
            Ok(())
        })?;
        Ok(self)
    }

    /// Narrows every materialized item to the member `key` names. Only plain
    /// member paths are accepted; `x => x` leaves items as they are.
    fn project_onto(mut self, key: &Lambda) -> Result<Self> {
        let path = match strip_convert(&key.body) {
            Expr::Variable(name) if *name == key.parameter => return Ok(self),
            Expr::Member(path) if path.root == key.parameter && !path.segments.is_empty() => path,
            other => {
                return Err(QueryError::unsupported(format!(
                    "projection `{}` must be a member of `{}`",
                    other, key.parameter
                )))
            }
        };
        let element = self.slot_mut()?.bucket.element.type_name.clone();
        if let Resolved::Ignored = PropertyResolver::new(&self.ctx.schema, element).resolve(path)? {
            return Err(QueryError::unsupported(format!("cannot project onto ignored member `{}`", path)));
        }
        debug!(element = %self.element, path = %path, "projection");
        self.projection = Some(path.segments.clone());
        Ok(self)
    }

    fn count_argument(&self, step: &MethodInvocation) -> Result<usize> {
        let expr = match step.args.first() {
            Some(Argument::Value(expr)) => expr,
            _ => {
                return Err(QueryError::unsupported(format!(
                    "`{}` expects a count",
                    step.method
                )))
            }
        };
        match self.ctx.environment.evaluate(expr, None)? {
            Value::Int(n) if n >= 0 => Ok(n as usize),
            other => Err(QueryError::Evaluation {
                expr: expr.to_string(),
                reason: format!("expected a non-negative count, found {}", other),
            }),
        }
    }

    fn slot_mut(&mut self) -> Result<&mut Slot<B::Item>> {
        self.ctx
            .buckets
            .get_mut(&self.element)
            .ok_or_else(|| QueryError::UnknownType(self.element.clone()))
    }

    /// Runs `f` against a copy of the bucket and commits it on success. A
    /// bucket that was already consumed starts over empty.
    fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&Schema, &Environment, &mut Bucket) -> Result<()>,
    {
        let ctx = &mut *self.ctx;
        let slot = ctx
            .buckets
            .get_mut(&self.element)
            .ok_or_else(|| QueryError::UnknownType(self.element.clone()))?;

        let mut scratch = slot.bucket.clone();
        if scratch.processed {
            debug!(bucket = %scratch.name, "bucket already consumed, starting a new chain");
            scratch.clear();
        }
        f(&ctx.schema, &ctx.environment, &mut scratch)?;

        slot.bucket = scratch;
        slot.ast = None;
        slot.results = None;
        Ok(())
    }

    /// Renders and executes once; later calls reuse the stored items.
    fn execute(&mut self) -> Result<&[B::Item]> {
        let ctx = &mut *self.ctx;
        let slot = ctx
            .buckets
            .get_mut(&self.element)
            .ok_or_else(|| QueryError::UnknownType(self.element.clone()))?;

        if slot.results.is_none() {
            let ast = match &slot.ast {
                Some(ast) => Arc::clone(ast),
                None => {
                    let ast = Arc::new(render(&slot.bucket));
                    slot.ast = Some(Arc::clone(&ast));
                    ast
                }
            };
            debug!(bucket = %slot.bucket.name, "executing query");
            let items = ctx.backend.execute(&ast).map_err(QueryError::BackendExecution)?;
            slot.bucket.processed = true;
            slot.results = Some(items);
        } else {
            debug!(bucket = %slot.bucket.name, "reusing materialized results");
        }
        Ok(slot.results.as_deref().unwrap_or_default())
    }
}

impl<'c, B: Backend> Query<'c, B>
where
    B::Item: Clone,
{
    pub fn to_vec(&mut self) -> Result<Vec<B::Item>> {
        let items = self.execute()?.to_vec();
        items.into_iter().map(|item| self.project(item)).collect()
    }

    pub fn first(&mut self) -> Result<B::Item> {
        self.first_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn first_or_default(&mut self) -> Result<Option<B::Item>> {
        let item = self.execute()?.first().cloned();
        item.map(|item| self.project(item)).transpose()
    }

    pub fn last(&mut self) -> Result<B::Item> {
        self.last_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn last_or_default(&mut self) -> Result<Option<B::Item>> {
        let item = self.execute()?.last().cloned();
        item.map(|item| self.project(item)).transpose()
    }

    pub fn single(&mut self) -> Result<B::Item> {
        self.single_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn single_or_default(&mut self) -> Result<Option<B::Item>> {
        let item = match self.execute()? {
            [] => None,
            [one] => Some(one.clone()),
            _ => return Err(QueryError::MoreThanOneElement),
        };
        item.map(|item| self.project(item)).transpose()
    }

    fn project(&self, item: B::Item) -> Result<B::Item> {
        match &self.projection {
            Some(path) => self
                .ctx
                .backend
                .project(&item, path)
                .map_err(QueryError::BackendExecution),
            None => Ok(item),
        }
    }

    fn terminal(self, step: &MethodInvocation) -> Result<Outcome<B::Item>> {
        let terminal = Terminal::parse(&step.method)
            .ok_or_else(|| QueryError::unsupported(format!("`{}` is not a terminal operation", step.method)))?;
        let mut query = match step.args.as_slice() {
            [] => self,
            [Argument::Lambda(_)] if self.projection.is_some() => {
                return Err(QueryError::unsupported(format!(
                    "a predicate on `{}` after `Select` is not supported",
                    step.method
                )))
            }
            [Argument::Lambda(predicate)] if terminal != Terminal::ToList => self.filter(predicate)?,
            _ => {
                return Err(QueryError::unsupported(format!(
                    "`{}` takes at most one predicate",
                    step.method
                )))
            }
        };

        Ok(match terminal {
            Terminal::ToList => Outcome::Items(query.to_vec()?),
            Terminal::Count => Outcome::Count(query.count()?),
            Terminal::Any => Outcome::Any(query.any()?),
            Terminal::First => Outcome::Item(Some(query.first()?)),
            Terminal::FirstOrDefault => Outcome::Item(query.first_or_default()?),
            Terminal::Last => Outcome::Item(Some(query.last()?)),
            Terminal::LastOrDefault => Outcome::Item(query.last_or_default()?),
            Terminal::Single => Outcome::Item(Some(query.single()?)),
            Terminal::SingleOrDefault => Outcome::Item(query.single_or_default()?),
        })
    }
}

/// A query whose items are mapped through a projector on the way out.
pub struct Projected<'c, B: Backend, F> {
    query: Query<'c, B>,
    projector: F,
}

impl<'c, B, F, R> Projected<'c, B, F>
where
    B: Backend,
    B::Item: Clone,
    F: FnMut(&B::Item) -> R,
{
    pub fn to_vec(&mut self) -> Result<Vec<R>> {
        let items = self.query.to_vec()?;
        Ok(items.iter().map(&mut self.projector).collect())
    }

    pub fn first(&mut self) -> Result<R> {
        self.first_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn first_or_default(&mut self) -> Result<Option<R>> {
        let item = self.query.first_or_default()?;
        Ok(item.as_ref().map(&mut self.projector))
    }

    pub fn last(&mut self) -> Result<R> {
        self.last_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn last_or_default(&mut self) -> Result<Option<R>> {
        let item = self.query.last_or_default()?;
        Ok(item.as_ref().map(&mut self.projector))
    }

    pub fn single(&mut self) -> Result<R> {
        self.single_or_default()?.ok_or(QueryError::NoElements)
    }

    pub fn single_or_default(&mut self) -> Result<Option<R>> {
        let item = self.query.single_or_default()?;
        Ok(item.as_ref().map(&mut self.projector))
    }

    pub fn count(&mut self) -> Result<usize> {
        self.query.count()
    }

    pub fn any(&mut self) -> Result<bool> {
        self.query.any()
    }
}

fn lambda_argument(step: &MethodInvocation) -> Result<&Lambda> {
    match step.args.first() {
        Some(Argument::Lambda(lambda)) => Ok(lambda),
        Some(other) => Err(QueryError::unsupported(format!(
            "`{}` expects a lambda, found `{}`",
            step.method, other
        ))),
        None => Err(QueryError::unsupported(format!("`{}` expects a lambda", step.method))),
    }
}

fn strip_convert(expr: &Expr) -> &Expr {
    match expr {
        Expr::Convert(inner) => strip_convert(inner),
        other => other,
    }
}

/// Builds the block handed to a backend: the type, the filter (only when the
/// bucket is dirty), the sort keys, paging and then passthrough calls.
pub fn render(bucket: &Bucket) -> Expression {
    let ty = bucket.element.clone();
    let mut expressions = vec![Expression::Type(TypeExpression { ty: ty.clone() })];

    if bucket.dirty {
        let body = bucket.tree.root().and_then(|root| render_node(&bucket.tree, root));
        expressions.push(Expression::Lambda(LambdaExpression {
            ty,
            body: body.map(Box::new),
        }));
    }

    expressions.extend(bucket.order_by.iter().map(|o| {
        Expression::Orderby(OrderbyExpression {
            member: o.member.clone(),
            ascending: o.ascending,
        })
    }));

    if bucket.has_paging() {
        expressions.push(Expression::MethodCall(MethodCallExpression::Paging {
            skip: bucket.skip,
            take: bucket.take,
        }));
    }

    expressions.extend(
        bucket
            .methods
            .iter()
            .map(|m| Expression::MethodCall(MethodCallExpression::Call(m.clone()))),
    );

    debug!(bucket = %bucket.name, nodes = expressions.len(), "rendered ast");
    Expression::Block(BlockExpression { expressions })
}

fn render_node(tree: &ConditionTree, node: Node) -> Option<Expression> {
    match node {
        Node::Leaf(id) => Some(render_leaf(tree.leaf(id))),
        Node::Group(id) => {
            let group = tree.group(id);
            let mut children = group.children.iter().filter_map(|child| render_node(tree, *child));
            let first = children.next()?;
            Some(children.fold(first, |left, right| {
                Expression::Logical(LogicalExpression {
                    operator: group.operator,
                    left: Box::new(left),
                    right: Box::new(right),
                    is_child: group.is_child,
                })
            }))
        }
    }
}

fn render_leaf(condition: &Condition) -> Expression {
    let (ty, value) = if condition.is_membership() {
        (
            PropertyType::List(Box::new(condition.property_type.clone())),
            Value::List(condition.values.iter().map(|c| c.value.clone()).collect()),
        )
    } else {
        let ty = match (&condition.property_type, condition.operator) {
            (PropertyType::List(inner), BinaryOperator::Contains) => (**inner).clone(),
            (ty, _) => ty.clone(),
        };
        (ty, condition.value().cloned().unwrap_or(Value::Null))
    };

    Expression::Binary(BinaryExpression {
        operator: condition.operator,
        left: Box::new(Expression::Member(MemberExpression {
            condition: condition.clone(),
        })),
        right: Box::new(Expression::Literal(LiteralExpression { ty, value })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CodeType, LogicalOperator};
    use crate::schema::tests::library_schema;
    use crate::testing::{books, lambda, pipeline, FailingBackend, MemoryBackend, TextBackend};
    use serde_json::json;

    fn text_context() -> QueryContext<TextBackend> {
        QueryContext::new(library_schema(), TextBackend::default())
    }

    fn memory_context() -> QueryContext<MemoryBackend> {
        QueryContext::new(library_schema(), MemoryBackend::new(books()))
    }

    #[test]
    fn test_chained_filters_equal_conjunction() {
        let mut ctx = text_context();
        let chained = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Id == 1"))
            .unwrap()
            .filter(&lambda("x => x.Author == \"Scott\""))
            .unwrap()
            .ast()
            .unwrap();

        let single = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Id == 1 && x.Author == \"Scott\""))
            .unwrap()
            .ast()
            .unwrap();

        assert_eq!(chained, single);
        let block = chained.as_block().unwrap();
        let body = block.lambda().unwrap().body.as_deref().unwrap();
        let Expression::Logical(logical) = body else {
            panic!("Expected a logical root");
        };
        assert_eq!(logical.operator, LogicalOperator::And);
        assert!(!logical.is_child);
    }

    #[test]
    fn test_render_is_idempotent() {
        let mut ctx = text_context();
        let mut query = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => (x.Id == 1 && x.Author == \"Charlie\") || x.Id == 10"))
            .unwrap();

        let first = query.ast().unwrap();
        let second = query.ast().unwrap();
        assert_eq!(first, second);
        assert_eq!(render(query.bucket().unwrap()), *first);

        let a = query.to_vec().unwrap();
        let b = query.to_vec().unwrap();
        assert_eq!(a, b);
        drop(query);
        assert_eq!(ctx.backend().executions, 1);
    }

    #[test]
    fn test_pagination_last_write_wins() {
        let mut ctx = text_context();
        let query = ctx
            .from("Book")
            .unwrap()
            .take(5)
            .unwrap()
            .take(2)
            .unwrap()
            .skip(1)
            .unwrap()
            .skip(3)
            .unwrap();

        let bucket = query.bucket().unwrap();
        assert_eq!(bucket.take(), Some(2));
        assert_eq!(bucket.skip(), 3);

        let mut query = query;
        let ast = query.ast().unwrap();
        let calls: Vec<_> = ast.as_block().unwrap().method_calls().cloned().collect();
        assert_eq!(calls, vec![MethodCallExpression::Paging { skip: 3, take: Some(2) }]);
    }

    #[test]
    fn test_order_by_accumulates_in_call_order() {
        let mut ctx = text_context();
        let mut query = ctx
            .from("Book")
            .unwrap()
            .order_by(&lambda("x => x.Title"))
            .unwrap()
            .then_by_descending(&lambda("x => x.Id"))
            .unwrap()
            .then_by(&lambda("x => x.Author"))
            .unwrap();

        let keys: Vec<_> = query
            .bucket()
            .unwrap()
            .order_by()
            .iter()
            .map(|o| (o.member.name().to_string(), o.ascending))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Title".to_string(), true),
                ("Id".to_string(), false),
                ("Author".to_string(), true)
            ]
        );

        let ast = query.ast().unwrap();
        assert_eq!(ast.as_block().unwrap().order_by().count(), 3);
        assert!(ast.as_block().unwrap().lambda().is_none());
    }

    #[test]
    fn test_block_order() {
        let mut ctx = text_context();
        let mut query = ctx
            .from("Book")
            .unwrap()
            .call("Cache", &[Expr::lit(30)])
            .unwrap()
            .take(1)
            .unwrap()
            .order_by(&lambda("x => x.Author"))
            .unwrap()
            .filter(&lambda("x => x.Author == \"Scott\""))
            .unwrap();

        let ast = query.ast().unwrap();
        let tags: Vec<_> = ast.as_block().unwrap().expressions.iter().map(Expression::code_type).collect();
        assert_eq!(
            tags,
            vec![
                CodeType::TypeExpression,
                CodeType::LambdaExpression,
                CodeType::OrderbyExpression,
                CodeType::MethodCallExpression,
                CodeType::MethodCallExpression
            ]
        );
        let calls: Vec<_> = ast.as_block().unwrap().method_calls().cloned().collect();
        assert_eq!(
            calls[1],
            MethodCallExpression::Call(MethodCall {
                target: "Book".to_string(),
                method: "Cache".to_string(),
                arguments: vec![Value::Int(30)],
            })
        );
    }

    #[test]
    fn test_text_output_with_order_by() {
        let mut ctx = text_context();
        let text = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Author == \"Scott\""))
            .unwrap()
            .order_by(&lambda("x => x.Author"))
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(text, "select * from Book\nwhere\nBook.Author = \"Scott\"\norder by Book.Author asc\n");
    }

    #[test]
    fn test_display_names_reach_the_backend() {
        let mut ctx = text_context();
        let text = ctx
            .from("Library")
            .unwrap()
            .filter(&lambda("x => x.Id == 1"))
            .unwrap()
            .single()
            .unwrap();
        assert_eq!(text, "select * from ext_library\nwhere\next_library.lb_Id = 1");
    }

    #[test]
    fn test_lifecycle_states() {
        let mut ctx = text_context();
        let query = ctx.from("Book").unwrap();
        assert_eq!(query.state(), QueryState::Empty);

        let mut query = query.filter(&lambda("x => x.Id == 1")).unwrap();
        assert_eq!(query.state(), QueryState::Accumulating);

        query.count().unwrap();
        assert_eq!(query.state(), QueryState::Rendered);
        assert!(query.bucket().unwrap().is_processed());

        // a consumed bucket starts over on the next chained call
        let query = query.filter(&lambda("x => x.Author == \"Scott\"")).unwrap();
        let bucket = query.bucket().unwrap();
        assert_eq!(bucket.tree().to_string(), "Author = \"Scott\"");
        assert!(!bucket.is_processed());
        assert_eq!(bucket.clause_count(), 1);
    }

    #[test]
    fn test_new_query_replaces_bucket() {
        let mut ctx = text_context();
        ctx.from("Book").unwrap().filter(&lambda("x => x.Id == 1")).unwrap();
        assert!(ctx.bucket("Book").unwrap().is_dirty());

        ctx.query("Book").unwrap().take(3).unwrap();
        assert!(ctx.bucket("Book").unwrap().is_dirty(), "query() continues the chain");

        ctx.from("Book").unwrap();
        let bucket = ctx.bucket("Book").unwrap();
        assert!(!bucket.is_dirty());
        assert_eq!(bucket.take(), None);
        assert_eq!(bucket.state(), QueryState::Empty);
    }

    #[test]
    fn test_failed_filter_leaves_state_untouched() {
        let mut ctx = text_context();
        let query = ctx.from("Book").unwrap().filter(&lambda("x => x.Id == 1")).unwrap();
        assert!(matches!(
            query.filter(&lambda("x => x.Author == \"a\" && x.Shelf.Geo.Altitude == 2")),
            Err(QueryError::PropertyResolution { .. })
        ));

        let bucket = ctx.bucket("Book").unwrap();
        assert_eq!(bucket.tree().to_string(), "Id = 1");
        assert!(bucket.item("Author").unwrap().values.is_empty());
        assert_eq!(bucket.clause_count(), 1);
        assert!(ctx.ast("Book").is_none());
    }

    #[test]
    fn test_unknown_type() {
        let mut ctx = text_context();
        assert!(matches!(ctx.from("Nope"), Err(QueryError::UnknownType(_))));
    }

    #[test]
    fn test_backend_error_is_wrapped() {
        let mut ctx = QueryContext::new(library_schema(), FailingBackend);
        let result = ctx.from("Book").unwrap().count();
        let err = result.unwrap_err();
        assert!(matches!(err, QueryError::BackendExecution(_)));
        let source = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("connection refused"));
        assert!(!ctx.bucket("Book").unwrap().is_processed());
    }

    #[test]
    fn test_in_memory_terminals() {
        let mut ctx = memory_context();

        let mut scott = ctx.from("Book").unwrap().filter(&lambda("x => x.Author == \"Scott\"")).unwrap();
        assert_eq!(scott.count().unwrap(), 2);
        assert!(matches!(scott.single(), Err(QueryError::MoreThanOneElement)));
        assert_eq!(scott.first().unwrap()["Id"], json!(2));
        assert_eq!(scott.last().unwrap()["Id"], json!(4));

        let mut none = ctx.from("Book").unwrap().filter(&lambda("x => x.Id == 99")).unwrap();
        assert!(!none.any().unwrap());
        assert!(matches!(none.first(), Err(QueryError::NoElements)));
        assert_eq!(none.first_or_default().unwrap(), None);
        assert_eq!(none.single_or_default().unwrap(), None);
        assert_eq!(none.last_or_default().unwrap(), None);

        let one = ctx.from("Book").unwrap().filter(&lambda("x => x.Id == 1")).unwrap().single();
        assert_eq!(one.unwrap()["Title"], json!("Programming Rust"));
    }

    #[test]
    fn test_in_memory_grouping_sort_and_paging() {
        let mut ctx = memory_context();
        let ids: Vec<_> = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => (x.Author == \"Scott\" || x.Author == \"Charlie\") && x.IsAvailable"))
            .unwrap()
            .order_by_descending(&lambda("x => x.Id"))
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(ids, vec![json!(4), json!(1)]);

        let page: Vec<_> = ctx
            .from("Book")
            .unwrap()
            .order_by(&lambda("x => x.Id"))
            .unwrap()
            .skip(1)
            .unwrap()
            .take(2)
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(page, vec![json!(2), json!(3)]);
    }

    #[test]
    fn test_in_memory_contains_and_nested() {
        let env = Environment::new().with_variable("ids", vec![1, 3]);
        let mut ctx = memory_context().with_environment(env);

        let ids: Vec<_> = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => ids.Contains(x.Id)"))
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(ids, vec![json!(1), json!(3)]);

        let tagged = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Tags.Contains(\"systems\")"))
            .unwrap()
            .count()
            .unwrap();
        assert_eq!(tagged, 2);

        let oslo = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Shelf.City == \"Oslo\" && x.Shelf.Geo.Lat > 59.0"))
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(oslo, vec![json!(1)]);
    }

    #[test]
    fn test_run_pipeline() {
        let mut ctx = memory_context();

        let outcome = ctx
            .run(&pipeline("Book.Where(x => x.Author == \"Scott\").OrderByDescending(x => x.Id).First()"))
            .unwrap();
        let Outcome::Item(Some(row)) = outcome else {
            panic!("Expected a single item");
        };
        assert_eq!(row["Id"], json!(4));

        let outcome = ctx.run(&pipeline("Book.Count(x => x.IsAvailable)")).unwrap();
        assert_eq!(outcome, Outcome::Count(3));

        let outcome = ctx.run(&pipeline("Book.Where(x => x.Id > 2).Select(x => x.Title)")).unwrap();
        assert_eq!(
            outcome,
            Outcome::Items(vec![json!("Operating Systems"), json!("Pro Git")])
        );
    }

    #[test]
    fn test_run_pipeline_select() {
        let mut ctx = memory_context();

        let outcome = ctx
            .run(&pipeline("Book.OrderByDescending(x => x.Id).Select(x => x.Shelf.City).Take(3)"))
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Items(vec![json!("Bergen"), json!("Oslo"), json!("Bergen")])
        );

        let outcome = ctx
            .run(&pipeline("Book.Where(x => x.Author == \"Tom\").Select(x => x.Shelf.Geo.Lat).Single()"))
            .unwrap();
        assert_eq!(outcome, Outcome::Item(Some(json!(58.0))));

        let outcome = ctx.run(&pipeline("Book.Select(x => x.Author).Count()")).unwrap();
        assert_eq!(outcome, Outcome::Count(4));

        let outcome = ctx.run(&pipeline("Book.Where(x => x.Id == 4).Select(x => x).First()")).unwrap();
        let Outcome::Item(Some(row)) = outcome else {
            panic!("Expected a single item");
        };
        assert_eq!(row["Title"], json!("Pro Git"));
    }

    #[test]
    fn test_run_pipeline_select_rejections() {
        let mut ctx = memory_context();
        for input in [
            "Book.Select(x => x.Id == 1)",
            "Book.Select(x => ids)",
            "Book.Select(x => x.Notes)",
            "Book.Select(x => x.Title).Where(x => x.Id == 1)",
            "Book.Select(x => x.Title).OrderBy(x => x.Id)",
            "Book.Select(x => x.Title).Count(x => x.Id == 1)",
        ] {
            assert!(
                matches!(ctx.run(&pipeline(input)), Err(QueryError::UnsupportedShape(_))),
                "{}",
                input
            );
        }
        assert!(matches!(
            ctx.run(&pipeline("Book.Select(x => x.Shelf.Altitude)")),
            Err(QueryError::PropertyResolution { .. })
        ));

        let mut text = text_context();
        assert!(matches!(
            text.run(&pipeline("Book.Select(x => x.Title)")),
            Err(QueryError::BackendExecution(_))
        ));
    }

    #[test]
    fn test_projected_terminals() {
        let mut ctx = memory_context();
        let mut titles = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Author == \"Scott\""))
            .unwrap()
            .select(|row| row["Title"].as_str().map(str::to_string));

        assert_eq!(titles.first().unwrap(), Some("CLR via C#".to_string()));
        assert_eq!(titles.last().unwrap(), Some("Pro Git".to_string()));
        assert_eq!(titles.last_or_default().unwrap(), Some(Some("Pro Git".to_string())));
        assert!(titles.any().unwrap());
        assert_eq!(titles.count().unwrap(), 2);
        assert!(matches!(titles.single(), Err(QueryError::MoreThanOneElement)));
        assert!(matches!(titles.single_or_default(), Err(QueryError::MoreThanOneElement)));

        let mut none = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Id == 99"))
            .unwrap()
            .select(|row| row["Id"].clone());
        assert!(!none.any().unwrap());
        assert_eq!(none.single_or_default().unwrap(), None);
        assert_eq!(none.last_or_default().unwrap(), None);
        assert!(matches!(none.last(), Err(QueryError::NoElements)));
        assert!(matches!(none.single(), Err(QueryError::NoElements)));

        let one = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Id == 3"))
            .unwrap()
            .select(|row| row["Author"].clone())
            .single()
            .unwrap();
        assert_eq!(one, json!("Tom"));
    }

    #[test]
    fn test_in_memory_nested_membership() {
        let env = Environment::new().with_variable("cities", vec!["Bergen"]);
        let mut ctx = memory_context().with_environment(env);

        let ids: Vec<_> = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => cities.Contains(x.Shelf.City)"))
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(ids, vec![json!(2), json!(4)]);

        let ids: Vec<_> = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Shelf.Labels.Contains(\"quiet\")"))
            .unwrap()
            .select(|row| row["Id"].clone())
            .to_vec()
            .unwrap();
        assert_eq!(ids, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_left_associative_chain_renders_child_group() {
        let mut ctx = text_context();
        let ast = ctx
            .from("Book")
            .unwrap()
            .filter(&lambda("x => x.Id == 1 && x.Author == \"a\" && x.Title == \"b\""))
            .unwrap()
            .ast()
            .unwrap();

        let body = ast.as_block().unwrap().lambda().unwrap().body.as_deref().unwrap();
        let Expression::Logical(root) = body else {
            panic!("Expected a logical root");
        };
        assert!(!root.is_child);
        let Expression::Logical(inner) = root.left.as_ref() else {
            panic!("Expected the first two clauses grouped on the left");
        };
        assert!(inner.is_child);
        assert_eq!(inner.operator, LogicalOperator::And);
        assert!(matches!(root.right.as_ref(), Expression::Binary(_)));
    }

    #[test]
    fn test_run_pipeline_unsupported_shapes() {
        let mut ctx = memory_context();
        assert!(matches!(
            ctx.run(&pipeline("Book.Join(Library, x => x.Id)")),
            Err(QueryError::UnsupportedShape(_))
        ));
        assert!(matches!(
            ctx.run(&pipeline("Book.Where(x => x.Id == 1, x => x.Id == 2)")),
            Err(QueryError::UnsupportedShape(_))
        ));
        assert!(matches!(
            ctx.run(&pipeline("Book.Count().Take(1)")),
            Err(QueryError::UnsupportedShape(_))
        ));
        assert!(matches!(
            ctx.run(&pipeline("Book.Take(-1)")),
            Err(QueryError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_passthrough_arguments_are_materialized() {
        let env = Environment::new().with_variable("minutes", 15);
        let mut ctx = text_context().with_environment(env);
        ctx.run(&pipeline("Book.Where(x => x.Id == 1).Cache(minutes, \"books\")")).unwrap();

        let bucket = ctx.bucket("Book").unwrap();
        assert_eq!(
            bucket.methods(),
            &[MethodCall {
                target: "Book".to_string(),
                method: "Cache".to_string(),
                arguments: vec![Value::Int(15), Value::from("books")],
            }]
        );
        assert!(bucket.is_processed());
    }
}
