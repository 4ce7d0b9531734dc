//! Per-element-type accumulator of filter, sort, paging and method-call state.

use crate::ast::BinaryOperator;
use crate::error::{QueryError, Result};
use crate::schema::{MemberReference, PropertyDef, PropertyType, Schema, TypeDef, TypeRef};
use crate::tree::ConditionTree;
use crate::value::Value;
use std::collections::BTreeMap;

/// One `(value, operator)` pair recorded against a property.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCondition {
    pub value: Value,
    pub operator: BinaryOperator,
}

impl QueryCondition {
    pub fn new(value: Value, operator: BinaryOperator) -> Self {
        Self { value, operator }
    }
}

/// Navigational link from a child bucket back to the condition that owns it.
/// Identifies the owner by name; it does not keep anything alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub type_name: String,
    pub property_name: String,
}

/// A condition on a single property.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Display name (override applied).
    pub name: String,
    pub property_name: String,
    pub declaring_type: TypeRef,
    pub property_type: PropertyType,
    pub operator: BinaryOperator,
    pub values: Vec<QueryCondition>,
    pub unique: bool,
    /// Decomposed per-field conditions of a composite property. Only populated
    /// on a bucket's own entries, never on tree leaves.
    pub child: Option<Box<Bucket>>,
    pub container: Option<ContainerRef>,
    /// Set on leaves built from `values.Contains(x.Member)`: one value per
    /// element of a constant collection.
    pub membership: bool,
}

impl Condition {
    pub(crate) fn from_property(declaring: &TypeDef, property: &PropertyDef, container: Option<ContainerRef>) -> Self {
        Self {
            name: property.effective_name().to_string(),
            property_name: property.name.clone(),
            declaring_type: declaring.reference(),
            property_type: property.ty.clone(),
            operator: BinaryOperator::Equal,
            values: Vec::new(),
            unique: property.unique,
            child: None,
            container,
            membership: false,
        }
    }

    /// A detached copy carrying only `values`, used as a tree leaf.
    pub(crate) fn leaf(&self, operator: BinaryOperator, values: Vec<QueryCondition>) -> Condition {
        Condition {
            name: self.name.clone(),
            property_name: self.property_name.clone(),
            declaring_type: self.declaring_type.clone(),
            property_type: self.property_type.clone(),
            operator,
            values,
            unique: self.unique,
            child: None,
            container: self.container.clone(),
            membership: false,
        }
    }

    /// Marks a leaf as an IN-style test against a set of values.
    pub(crate) fn into_membership(mut self) -> Condition {
        self.membership = true;
        self
    }

    pub fn value(&self) -> Option<&Value> {
        self.values.first().map(|c| &c.value)
    }

    /// True for an IN-style test of the property against a set of values.
    pub fn is_membership(&self) -> bool {
        self.membership
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.declaring_type.name(), self.name)
    }

    pub fn member(&self) -> MemberReference {
        MemberReference {
            declaring_type: self.declaring_type.clone(),
            property_name: self.property_name.clone(),
            display_name: Some(self.name.clone()).filter(|n| *n != self.property_name),
        }
    }

    pub fn child(&self) -> Option<&Bucket> {
        self.child.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByInfo {
    pub member: MemberReference,
    pub ascending: bool,
}

/// A method call the compiler does not interpret, with its arguments
/// already evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub target: String,
    pub method: String,
    pub arguments: Vec<Value>,
}

/// Lifecycle of a compiled query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Empty,
    Accumulating,
    Rendered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub(crate) name: String,
    pub(crate) element: TypeRef,
    pub(crate) items: BTreeMap<String, Condition>,
    pub(crate) tree: ConditionTree,
    pub(crate) order_by: Vec<OrderByInfo>,
    pub(crate) take: Option<usize>,
    pub(crate) skip: usize,
    pub(crate) dirty: bool,
    pub(crate) processed: bool,
    pub(crate) methods: Vec<MethodCall>,
    pub(crate) clause_count: usize,
    pub(crate) container: Option<ContainerRef>,
}

impl Bucket {
    /// Creates an empty bucket for `type_name`, with one entry per
    /// non-ignored property (inherited ones included).
    pub fn new(schema: &Schema, type_name: &str) -> Result<Self> {
        Self::build(schema, type_name, None)
    }

    pub(crate) fn nested(schema: &Schema, type_name: &str, container: ContainerRef) -> Result<Self> {
        Self::build(schema, type_name, Some(container))
    }

    fn build(schema: &Schema, type_name: &str, container: Option<ContainerRef>) -> Result<Self> {
        let def = schema
            .get(type_name)
            .ok_or_else(|| QueryError::UnknownType(type_name.to_string()))?;

        let items = schema
            .properties_of(type_name)
            .into_iter()
            .filter(|(_, p)| !p.ignore)
            .map(|(declaring, p)| (p.name.clone(), Condition::from_property(declaring, p, container.clone())))
            .collect();

        Ok(Self {
            name: def.effective_name().to_string(),
            element: def.reference(),
            items,
            tree: ConditionTree::default(),
            order_by: Vec::new(),
            take: None,
            skip: 0,
            dirty: false,
            processed: false,
            methods: Vec::new(),
            clause_count: 0,
            container,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element(&self) -> &TypeRef {
        &self.element
    }

    pub fn items(&self) -> &BTreeMap<String, Condition> {
        &self.items
    }

    pub fn item(&self, property: &str) -> Option<&Condition> {
        self.items.get(property)
    }

    pub fn tree(&self) -> &ConditionTree {
        &self.tree
    }

    pub fn order_by(&self) -> &[OrderByInfo] {
        &self.order_by
    }

    pub fn take(&self) -> Option<usize> {
        self.take
    }

    pub fn skip(&self) -> usize {
        self.skip
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn methods(&self) -> &[MethodCall] {
        &self.methods
    }

    /// Number of comparison leaves compiled into this bucket so far.
    pub fn clause_count(&self) -> usize {
        self.clause_count
    }

    pub fn container(&self) -> Option<&ContainerRef> {
        self.container.as_ref()
    }

    pub fn has_paging(&self) -> bool {
        self.take.is_some() || self.skip > 0
    }

    pub fn state(&self) -> QueryState {
        if self.processed {
            QueryState::Rendered
        } else if self.dirty || self.has_paging() || !self.order_by.is_empty() || !self.methods.is_empty() {
            QueryState::Accumulating
        } else {
            QueryState::Empty
        }
    }

    /// Display names of the properties marked unique.
    pub fn unique_items(&self) -> Vec<&str> {
        self.items.values().filter(|c| c.unique).map(|c| c.name.as_str()).collect()
    }

    /// Declared names of the properties marked unique.
    pub fn unique_properties(&self) -> Vec<&str> {
        self.items
            .values()
            .filter(|c| c.unique)
            .map(|c| c.property_name.as_str())
            .collect()
    }

    /// Records `condition` against `property`, decomposing composite values
    /// into the property's child bucket (created on first use).
    pub(crate) fn record(&mut self, schema: &Schema, property: &str, condition: QueryCondition) -> Result<()> {
        let owner = self.element.type_name.clone();
        let item = self.items.get_mut(property).ok_or_else(|| {
            QueryError::unresolved(format!("{}.{}", owner, property), "property is not part of the bucket")
        })?;

        if let (PropertyType::Object(ty), Value::Composite(composite)) = (&item.property_type, &condition.value) {
            if item.child.is_none() {
                let container = ContainerRef {
                    type_name: owner.clone(),
                    property_name: property.to_string(),
                };
                item.child = Some(Box::new(Bucket::nested(schema, ty, container)?));
            }
            if let Some(child) = item.child.as_deref_mut() {
                for (field, value) in &composite.fields {
                    if child.items.contains_key(field) {
                        child.record(schema, field, QueryCondition::new(value.clone(), condition.operator))?;
                    }
                }
            }
        }

        item.operator = condition.operator;
        item.values.push(condition);
        Ok(())
    }

    /// Clears filters, sorting, paging and passthrough calls.
    pub(crate) fn clear(&mut self) {
        for item in self.items.values_mut() {
            item.values.clear();
            item.operator = BinaryOperator::Equal;
            item.child = None;
        }
        self.tree = ConditionTree::default();
        self.order_by.clear();
        self.take = None;
        self.skip = 0;
        self.dirty = false;
        self.processed = false;
        self.methods.clear();
        self.clause_count = 0;
    }
}
