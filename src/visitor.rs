//! Visitor over the compiled AST.
//!
//! [`Visitor::visit`] switches on the node and calls one handler per
//! variant. Default handlers recurse through the `walk_*` functions (block
//! children in order, lambda body, logical/binary left then right) and treat
//! member, literal, orderby and method-call nodes as leaves. A handler that is
//! overridden can call the matching `walk_*` to keep the default recursion.

use crate::ast::{
    BinaryExpression, BlockExpression, Expression, LambdaExpression, LiteralExpression, LogicalExpression,
    MemberExpression, MethodCallExpression, OrderbyExpression, TypeExpression,
};

pub trait Visitor {
    type Error;

    fn visit(&mut self, expr: &Expression) -> Result<(), Self::Error> {
        match expr {
            Expression::Block(e) => self.visit_block(e),
            Expression::Type(e) => self.visit_type(e),
            Expression::Lambda(e) => self.visit_lambda(e),
            Expression::Logical(e) => self.visit_logical(e),
            Expression::Binary(e) => self.visit_binary(e),
            Expression::Member(e) => self.visit_member(e),
            Expression::Literal(e) => self.visit_literal(e),
            Expression::Orderby(e) => self.visit_orderby(e),
            Expression::MethodCall(e) => self.visit_method_call(e),
        }
    }

    fn visit_block(&mut self, block: &BlockExpression) -> Result<(), Self::Error> {
        walk_block(self, block)
    }

    fn visit_type(&mut self, _ty: &TypeExpression) -> Result<(), Self::Error> {
        Ok(())
    }

    fn visit_lambda(&mut self, lambda: &LambdaExpression) -> Result<(), Self::Error> {
        walk_lambda(self, lambda)
    }

    fn visit_logical(&mut self, logical: &LogicalExpression) -> Result<(), Self::Error> {
        walk_logical(self, logical)
    }

    fn visit_binary(&mut self, binary: &BinaryExpression) -> Result<(), Self::Error> {
        walk_binary(self, binary)
    }

    fn visit_member(&mut self, _member: &MemberExpression) -> Result<(), Self::Error> {
        Ok(())
    }

    fn visit_literal(&mut self, _literal: &LiteralExpression) -> Result<(), Self::Error> {
        Ok(())
    }

    fn visit_orderby(&mut self, _orderby: &OrderbyExpression) -> Result<(), Self::Error> {
        Ok(())
    }

    fn visit_method_call(&mut self, _call: &MethodCallExpression) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub fn walk_block<V: Visitor + ?Sized>(visitor: &mut V, block: &BlockExpression) -> Result<(), V::Error> {
    for expr in &block.expressions {
        visitor.visit(expr)?;
    }
    Ok(())
}

pub fn walk_lambda<V: Visitor + ?Sized>(visitor: &mut V, lambda: &LambdaExpression) -> Result<(), V::Error> {
    match &lambda.body {
        Some(body) => visitor.visit(body),
        None => Ok(()),
    }
}

pub fn walk_logical<V: Visitor + ?Sized>(visitor: &mut V, logical: &LogicalExpression) -> Result<(), V::Error> {
    visitor.visit(&logical.left)?;
    visitor.visit(&logical.right)
}

pub fn walk_binary<V: Visitor + ?Sized>(visitor: &mut V, binary: &BinaryExpression) -> Result<(), V::Error> {
    visitor.visit(&binary.left)?;
    visitor.visit(&binary.right)
}
