//! The seam between the compiler and whatever consumes its output.

use crate::ast::Expression;

/// Failure reported by a backend. Boxed so that any backend error type can be
/// carried through [`QueryError::BackendExecution`](crate::error::QueryError)
/// with its cause intact.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Executes (or renders) a compiled query.
///
/// `execute` receives the rendered block: one `Type`, at most one `Lambda`,
/// then any `Orderby` and `MethodCall` nodes. Implementations typically walk
/// it with a [`Visitor`](crate::visitor::Visitor).
pub trait Backend {
    type Item;

    fn execute(&mut self, ast: &Expression) -> Result<Vec<Self::Item>, BackendError>;

    /// Narrows a materialized item to the member reached by `path` (declared
    /// property names, outermost first). Used by pipeline `Select` steps.
    fn project(&self, _item: &Self::Item, path: &[String]) -> Result<Self::Item, BackendError> {
        Err(format!("this backend cannot project items onto `{}`", path.join(".")).into())
    }
}

impl<B: Backend + ?Sized> Backend for &mut B {
    type Item = B::Item;

    fn execute(&mut self, ast: &Expression) -> Result<Vec<Self::Item>, BackendError> {
        (**self).execute(ast)
    }

    fn project(&self, item: &Self::Item, path: &[String]) -> Result<Self::Item, BackendError> {
        (**self).project(item, path)
    }
}
