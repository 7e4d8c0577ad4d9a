//! Database backend interface.
//!
//! The catalog, the query service and the ETL engine reach the database
//! only through `BackendConnection`, so tests can swap in fakes.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::dialect::Dialect;
use crate::error::Result;

mod postgres;
pub use postgres::PostgresConnection;

/// One row of `information_schema.columns`, names as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRecord {
    pub table: String,
    pub name: String,
    /// SQL-standard type name (`character varying`, `integer`, ...).
    pub data_type: String,
    /// Internal type name (`varchar`, `int4`, ...), usable in casts.
    pub udt_name: String,
    pub nullable: bool,
    pub ordinal: i32,
    pub max_length: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
}

/// One column of a primary key, ordered by `position` within its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumnRecord {
    pub table: String,
    pub column: String,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRecord {
    pub referencing_table: String,
    pub referencing_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

pub type JsonRow = Map<String, Value>;

/// Unified interface for database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    /// Schema introspection is scoped to.
    fn schema(&self) -> &str;

    /// Base table names in the schema, sorted.
    async fn list_base_tables(&self) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Columns in ordinal order; all tables when `table` is `None`.
    async fn fetch_columns(&self, table: Option<&str>) -> Result<Vec<ColumnRecord>>;

    async fn fetch_primary_keys(&self, table: Option<&str>) -> Result<Vec<KeyColumnRecord>>;

    async fn fetch_foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>>;

    /// Run a read-only statement with text parameters and decode each row
    /// into a JSON object keyed by output column name.
    async fn execute_query(&self, sql: &str, params: &[String]) -> Result<Vec<JsonRow>>;
}
