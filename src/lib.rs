//! Query extender: compiles host-style filter, sort and paging expressions
//! into a normalized condition tree and a backend-agnostic AST.

pub mod ast;
pub mod backend;
pub mod bucket;
pub mod builder;
pub mod compiler;
pub mod config;
pub mod error;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod schema;
pub mod sql_compiler;
pub mod token;
pub mod tree;
pub mod value;
pub mod visitor;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{Backend, BackendError};
pub use bucket::{Bucket, Condition, QueryState};
pub use compiler::{Outcome, Query, QueryContext};
pub use config::{ConfigError, SchemaConfig};
pub use error::{QueryError, Result};
pub use expr::{Environment, Expr, Lambda, Pipeline};
pub use parser::ParseError;
pub use schema::{PropertyDef, PropertyType, Schema, TypeDef};
pub use sql_compiler::SqlCompiler;
pub use value::Value;
pub use visitor::Visitor;
