//! Query compiler: request → typed AST → SQL.

use crate::dialect::{Dialect, PostgresDialect};
use crate::error::Result;
use crate::models::QueryRequest;
use crate::schema_cache::SchemaMetadata;

mod compile;
mod filters;
mod grain;
mod joins;
mod measures;
mod resolve;

pub use compile::{compile, CompiledQuery};
pub use filters::{build as build_filters, WhereTree};
pub use joins::{joinable_tables, resolve as resolve_join, JoinPredicate, JoinSource};
pub use measures::{metric_alias, sanitize_alias};
pub use resolve::ColumnRef;

/// Compiler bound to a dialect.
pub struct QueryCompiler {
    dialect: Box<dyn Dialect>,
}

impl Default for QueryCompiler {
    fn default() -> Self {
        Self::new(Box::new(PostgresDialect))
    }
}

impl QueryCompiler {
    pub fn new(dialect: Box<dyn Dialect>) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn compile(
        &self,
        request: &QueryRequest,
        metadata: Option<&SchemaMetadata>,
    ) -> Result<CompiledQuery> {
        compile(request, metadata, self.dialect.as_ref())
    }
}
