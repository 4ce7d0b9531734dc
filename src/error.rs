//! Errors surfaced by the compiler.

use crate::backend::BackendError;
use crate::parser::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// An expression construct the builder cannot classify.
    #[error("unsupported expression: {0}")]
    UnsupportedShape(String),
    /// A member path that cannot be matched to a reachable property.
    #[error("could not resolve property `{path}`: {reason}")]
    PropertyResolution { path: String, reason: String },
    #[error("unknown entity type `{0}`")]
    UnknownType(String),
    #[error("failed to evaluate `{expr}`: {reason}")]
    Evaluation { expr: String, reason: String },
    #[error("backend failed while executing the query")]
    BackendExecution(#[source] BackendError),
    #[error("sequence contains no elements")]
    NoElements,
    #[error("sequence contains more than one element")]
    MoreThanOneElement,
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl QueryError {
    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        QueryError::UnsupportedShape(message.into())
    }

    pub(crate) fn unresolved(path: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::PropertyResolution {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
