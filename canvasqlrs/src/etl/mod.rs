//! Schema-replicating ETL: introspect a source database, create matching
//! `{connection}__{table}` tables in the warehouse and copy every row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backends::ColumnRecord;
use crate::error::{CanvasqlError, Result};

mod engine;
mod lease;
mod source;
mod type_mapper;
mod warehouse;

pub use engine::{
    ColumnMetadata, ColumnMetadataReport, ColumnSummary, EtlEngine, WarehouseStats,
    WarehouseSummary, WarehouseTableStats,
};
pub use lease::{LeaseGuard, LeaseRegistry};
pub use source::{PgRowCursor, PostgresSource};
pub use type_mapper::{destination_type, map_column, map_columns, DestinationType, MappedColumn};
pub use warehouse::{index_name, PgTableLoader, PostgresWarehouse};

/// Separator between the connection name and the source table name.
pub const TABLE_SEPARATOR: &str = "__";
pub const CREATED_AT_COLUMN: &str = "_etl_created_at";
pub const UPDATED_AT_COLUMN: &str = "_etl_updated_at";

/// Longest connection name; keeps `{name}__{table}` within PostgreSQL's
/// 63-byte identifier limit for typical table names.
pub const MAX_CONNECTION_NAME_LEN: usize = 48;

/// One row in transit. Values are text, already cast to their destination
/// type on the source side.
pub type Row = Vec<Option<String>>;

/// Warehouse table name for a source table.
pub fn warehouse_table_name(connection_name: &str, source_table: &str) -> String {
    format!("{connection_name}{TABLE_SEPARATOR}{source_table}")
}

/// Prefix shared by every warehouse table of a connection.
pub fn table_prefix(connection_name: &str) -> String {
    format!("{connection_name}{TABLE_SEPARATOR}")
}

/// Connection names become a literal table-name prefix. A name may not
/// contain the separator or end with `_`, so no connection's `{name}__`
/// prefix can match another connection's tables.
pub fn validate_connection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_CONNECTION_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.contains(TABLE_SEPARATOR)
        && !name.ends_with('_');
    if valid {
        Ok(())
    } else {
        Err(CanvasqlError::InvalidConnectionName(name.to_string()))
    }
}

fn default_port() -> u16 {
    5432
}

/// Inline source connection and the prefix its tables are replicated under.
#[derive(Clone, Deserialize, Serialize)]
pub struct EtlRequest {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub connection_name: String,
}

impl std::fmt::Debug for EtlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

impl EtlRequest {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("host", &self.host),
            ("database", &self.database),
            ("username", &self.username),
        ] {
            if value.trim().is_empty() {
                return Err(CanvasqlError::Validation(format!("{field} is required")));
            }
        }
        validate_connection_name(&self.connection_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtlMode {
    Run,
    Refresh,
    FullRefresh,
}

impl std::fmt::Display for EtlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EtlMode::Run => "run",
            EtlMode::Refresh => "refresh",
            EtlMode::FullRefresh => "full_refresh",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub source_type: String,
    pub nullable: bool,
    pub max_length: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub ordinal: i32,
}

impl From<&ColumnRecord> for SourceColumn {
    fn from(record: &ColumnRecord) -> Self {
        Self {
            name: record.name.clone(),
            source_type: record.data_type.clone(),
            nullable: record.nullable,
            max_length: record.max_length,
            precision: record.precision,
            scale: record.scale,
            ordinal: record.ordinal,
        }
    }
}

/// Introspected shape of one source table. Built fresh per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTableDescriptor {
    pub name: String,
    pub columns: Vec<SourceColumn>,
    pub primary_key_columns: Vec<String>,
}

/// How a table loader prepares its destination table inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Create the table, then insert.
    Create,
    /// Truncate the existing table with user triggers disabled, then insert.
    Replace,
}

/// A database being replicated.
#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Base tables in source order.
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn describe_table(&self, table: &str) -> Result<SourceTableDescriptor>;

    /// Stream the rows of `table`, one text value per column of `columns`.
    async fn open_cursor(
        &self,
        table: &str,
        columns: &[MappedColumn],
        chunk_size: usize,
    ) -> Result<Box<dyn RowCursor>>;
}

#[async_trait]
pub trait RowCursor: Send {
    /// Next chunk of rows; empty once the table is exhausted.
    async fn next_chunk(&mut self) -> Result<Vec<Row>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// The warehouse that receives replicated tables.
#[async_trait]
pub trait WarehouseTarget: Send + Sync {
    async fn list_tables_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Open the single write transaction of one table.
    async fn begin_load(
        &self,
        table: &str,
        columns: &[MappedColumn],
        mode: LoadMode,
    ) -> Result<Box<dyn TableLoader>>;

    /// Primary key and indexes, added after the bulk load. Index failures
    /// are logged and do not fail the table.
    async fn finalize_table(
        &self,
        table: &str,
        primary_key: &[String],
        columns: &[MappedColumn],
    ) -> Result<()>;

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnRecord>>;

    async fn row_count(&self, table: &str) -> Result<u64>;
}

/// Writer for one table. Nothing is visible until `commit`.
#[async_trait]
pub trait TableLoader: Send {
    /// Insert a batch, returning the number of rows written.
    async fn insert_batch(&mut self, rows: &[Row]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Loaded,
    Refreshed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    pub source_table: String,
    pub warehouse_table: String,
    pub columns_count: usize,
    pub rows_count: u64,
    pub primary_key: Vec<String>,
    pub date_columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub elapsed_ms: u64,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtlReport {
    pub connection_name: String,
    pub mode: EtlMode,
    pub tables: Vec<TableReport>,
    pub total_tables: usize,
    pub total_rows: u64,
    pub elapsed_ms: u64,
}

impl EtlReport {
    pub fn failed_tables(&self) -> impl Iterator<Item = &TableReport> {
        self.tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> EtlRequest {
        EtlRequest {
            host: "db.internal".to_string(),
            port: 5432,
            database: "shop".to_string(),
            username: "etl".to_string(),
            password: "secret".to_string(),
            connection_name: name.to_string(),
        }
    }

    #[test]
    fn connection_name_must_be_identifier_safe() {
        assert!(request("shop_eu-1").validate().is_ok());
        for bad in [
            "",
            "shop eu",
            "shop;drop",
            "shop.eu",
            "shop_",
            "shop__eu",
            &"x".repeat(49),
        ] {
            assert!(matches!(
                request(bad).validate(),
                Err(CanvasqlError::InvalidConnectionName(_))
            ));
        }
    }

    #[test]
    fn missing_host_is_a_validation_error() {
        let mut req = request("shop");
        req.host = " ".to_string();
        assert!(matches!(req.validate(), Err(CanvasqlError::Validation(_))));
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", request("shop"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn request_parses_with_default_port() {
        let req: EtlRequest = serde_json::from_str(
            r#"{"host":"h","database":"d","username":"u","password":"p","connection_name":"c"}"#,
        )
        .unwrap();
        assert_eq!(req.port, 5432);
        assert_eq!(warehouse_table_name(&req.connection_name, "users"), "c__users");
    }
}
