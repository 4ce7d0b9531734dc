//! Arena-backed condition tree: AND/OR groups over leaf conditions.
//!
//! Groups and leaves live in flat vectors and refer to each other by index.
//! The builder grows the tree in place and calls [`ConditionTree::normalize`]
//! once per filter call, after which every group has exactly two children and
//! `is_child` is set on every group that has a parent.

use crate::ast::LogicalOperator;
use crate::bucket::Condition;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Group(GroupId),
    Leaf(LeafId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    pub children: Vec<Node>,
    /// 是否为嵌套分组 (渲染时需要加括号)
    pub is_child: bool,
    pub parent: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionTree {
    groups: Vec<ConditionGroup>,
    leaves: Vec<Condition>,
    root: Option<Node>,
}

impl ConditionTree {
    pub fn root(&self) -> Option<Node> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn group(&self, id: GroupId) -> &ConditionGroup {
        &self.groups[id.0]
    }

    pub fn leaf(&self, id: LeafId) -> &Condition {
        &self.leaves[id.0]
    }

    /// Leaves reachable from the root, depth-first, left to right.
    pub fn leaves(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect_leaves(root, &mut out);
        }
        out
    }

    fn collect_leaves<'a>(&'a self, node: Node, out: &mut Vec<&'a Condition>) {
        match node {
            Node::Leaf(id) => out.push(self.leaf(id)),
            Node::Group(id) => {
                for child in &self.group(id).children {
                    self.collect_leaves(*child, out);
                }
            }
        }
    }

    /// Creates a group under `parent`, or as the root when there is no parent.
    /// A root group replaces nothing: callers only do this on an empty tree.
    pub(crate) fn new_group(&mut self, operator: LogicalOperator, parent: Option<GroupId>) -> GroupId {
        let id = GroupId(self.groups.len());
        self.groups.push(ConditionGroup {
            operator,
            children: Vec::new(),
            is_child: parent.is_some(),
            parent,
        });
        match parent {
            Some(p) => self.groups[p.0].children.push(Node::Group(id)),
            None => self.root = Some(Node::Group(id)),
        }
        id
    }

    /// Moves the current root under a fresh `operator` group that becomes
    /// the new root.
    pub(crate) fn wrap_root(&mut self, operator: LogicalOperator) -> GroupId {
        let old = self.root.take();
        let id = GroupId(self.groups.len());
        self.groups.push(ConditionGroup {
            operator,
            children: old.into_iter().collect(),
            is_child: false,
            parent: None,
        });
        if let Some(Node::Group(g)) = old {
            let group = &mut self.groups[g.0];
            group.parent = Some(id);
            group.is_child = true;
        }
        self.root = Some(Node::Group(id));
        id
    }

    /// Attaches a leaf. Without a parent the leaf becomes the root of an
    /// empty tree, or is ANDed with whatever is already there.
    pub(crate) fn push_leaf(&mut self, parent: Option<GroupId>, condition: Condition) -> LeafId {
        let id = LeafId(self.leaves.len());
        self.leaves.push(condition);
        match parent {
            Some(p) => self.groups[p.0].children.push(Node::Leaf(id)),
            None if self.root.is_none() => self.root = Some(Node::Leaf(id)),
            None => {
                let wrapper = self.wrap_root(LogicalOperator::And);
                self.groups[wrapper.0].children.push(Node::Leaf(id));
            }
        }
        id
    }

    /// Drops empty groups, collapses single-child groups into their child and
    /// compacts the arena. Afterwards `is_child` is true exactly for groups
    /// that have a parent.
    pub(crate) fn normalize(&mut self) {
        let mut out = ConditionTree::default();
        let root = self.root.and_then(|root| self.copy_into(root, None, &mut out));
        out.root = root;
        *self = out;
    }

    fn copy_into(&self, node: Node, parent: Option<GroupId>, out: &mut ConditionTree) -> Option<Node> {
        match node {
            Node::Leaf(id) => {
                let new = LeafId(out.leaves.len());
                out.leaves.push(self.leaf(id).clone());
                Some(Node::Leaf(new))
            }
            Node::Group(id) => {
                let group = self.group(id);
                let live: Vec<Node> = group
                    .children
                    .iter()
                    .copied()
                    .filter(|child| !self.is_vacant(*child))
                    .collect();
                match live.as_slice() {
                    [] => None,
                    [only] => self.copy_into(*only, parent, out),
                    _ => {
                        let new = GroupId(out.groups.len());
                        out.groups.push(ConditionGroup {
                            operator: group.operator,
                            children: Vec::with_capacity(live.len()),
                            is_child: parent.is_some(),
                            parent,
                        });
                        for child in live {
                            if let Some(copied) = self.copy_into(child, Some(new), out) {
                                out.groups[new.0].children.push(copied);
                            }
                        }
                        Some(Node::Group(new))
                    }
                }
            }
        }
    }

    /// True for a group with no leaf anywhere beneath it.
    fn is_vacant(&self, node: Node) -> bool {
        match node {
            Node::Leaf(_) => false,
            Node::Group(id) => self.group(id).children.iter().all(|c| self.is_vacant(*c)),
        }
    }

    fn fmt_node(&self, node: Node, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match node {
            Node::Leaf(id) => {
                let leaf = self.leaf(id);
                write!(f, "{} {} ", leaf.name, leaf.operator.symbol())?;
                match leaf.values.as_slice() {
                    [single] if !leaf.is_membership() => write!(f, "{}", single.value),
                    values => {
                        write!(f, "[")?;
                        for (i, v) in values.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{}", v.value)?;
                        }
                        write!(f, "]")
                    }
                }
            }
            Node::Group(id) => {
                let group = self.group(id);
                if group.is_child {
                    write!(f, "(")?;
                }
                for (i, child) in group.children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", group.operator)?;
                    }
                    self.fmt_node(*child, f)?;
                }
                if group.is_child {
                    write!(f, ")")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ConditionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            Some(root) => self.fmt_node(root, f),
            None => Ok(()),
        }
    }
}
