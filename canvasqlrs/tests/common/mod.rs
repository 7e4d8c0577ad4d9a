//! In-memory databases shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use canvasql::backends::{
    BackendConnection, ColumnRecord, ForeignKeyRecord, JsonRow, KeyColumnRecord,
};
use canvasql::connections::{
    ConnectionProfile, DatasourceRecord, Driver, InMemoryDatasourceStore,
};
use canvasql::dialect::{Dialect, PostgresDialect};
use canvasql::error::{CanvasqlError, Result};
use canvasql::etl::{
    index_name, DestinationType, LoadMode, MappedColumn, Row, RowCursor, SourceColumn,
    SourceDatabase, SourceTableDescriptor, TableLoader, WarehouseTarget, CREATED_AT_COLUMN,
    UPDATED_AT_COLUMN,
};
use canvasql::executor::Connector;

// ============================================================================
// Query side
// ============================================================================

pub fn column(table: &str, name: &str, data_type: &str, udt: &str, ordinal: i32) -> ColumnRecord {
    ColumnRecord {
        table: table.to_string(),
        name: name.to_string(),
        data_type: data_type.to_string(),
        udt_name: udt.to_string(),
        nullable: true,
        ordinal,
        max_length: None,
        precision: None,
        scale: None,
    }
}

/// Catalog and result rows served from memory. Every executed statement is
/// recorded with its parameters.
#[derive(Default)]
pub struct MemoryBackend {
    pub tables: Vec<String>,
    pub columns: Vec<ColumnRecord>,
    pub primary_keys: Vec<KeyColumnRecord>,
    pub foreign_keys: Vec<ForeignKeyRecord>,
    pub rows: Vec<JsonRow>,
    pub fail_introspection: bool,
    pub executed: Mutex<Vec<(String, Vec<String>)>>,
    pub column_fetches: AtomicUsize,
    dialect: PostgresDialect,
}

impl MemoryBackend {
    /// `orders(id, region, amount, customer_id, created_at)` referencing
    /// `customers(id, name)`, plus a `migrations` table.
    pub fn shop() -> Self {
        let mut columns = vec![
            column("orders", "id", "integer", "int4", 1),
            column("orders", "region", "character varying", "varchar", 2),
            column("orders", "amount", "numeric", "numeric", 3),
            column("orders", "customer_id", "integer", "int4", 4),
            column("orders", "created_at", "timestamp without time zone", "timestamp", 5),
            column("customers", "id", "integer", "int4", 1),
            column("customers", "name", "text", "text", 2),
        ];
        columns.push(column("migrations", "id", "integer", "int4", 1));
        Self {
            tables: vec![
                "customers".to_string(),
                "migrations".to_string(),
                "orders".to_string(),
            ],
            columns,
            primary_keys: vec![
                KeyColumnRecord {
                    table: "orders".to_string(),
                    column: "id".to_string(),
                    position: 1,
                },
                KeyColumnRecord {
                    table: "customers".to_string(),
                    column: "id".to_string(),
                    position: 1,
                },
            ],
            foreign_keys: vec![ForeignKeyRecord {
                referencing_table: "orders".to_string(),
                referencing_column: "customer_id".to_string(),
                referenced_table: "customers".to_string(),
                referenced_column: "id".to_string(),
            }],
            ..Self::default()
        }
    }

    pub fn with_rows(mut self, rows: Vec<serde_json::Value>) -> Self {
        self.rows = rows
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self
    }

    pub fn executed(&self) -> Vec<(String, Vec<String>)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn column_fetches(&self) -> usize {
        self.column_fetches.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.fail_introspection {
            return Err(CanvasqlError::Execution("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendConnection for MemoryBackend {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn schema(&self) -> &str {
        "public"
    }

    async fn list_base_tables(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.tables.clone())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.check()?;
        Ok(self.tables.iter().any(|t| t.eq_ignore_ascii_case(table)))
    }

    async fn fetch_columns(&self, table: Option<&str>) -> Result<Vec<ColumnRecord>> {
        self.check()?;
        self.column_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .columns
            .iter()
            .filter(|c| table.map_or(true, |t| c.table.eq_ignore_ascii_case(t)))
            .cloned()
            .collect())
    }

    async fn fetch_primary_keys(&self, table: Option<&str>) -> Result<Vec<KeyColumnRecord>> {
        self.check()?;
        Ok(self
            .primary_keys
            .iter()
            .filter(|k| table.map_or(true, |t| k.table.eq_ignore_ascii_case(t)))
            .cloned()
            .collect())
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>> {
        self.check()?;
        Ok(self.foreign_keys.clone())
    }

    async fn execute_query(&self, sql: &str, params: &[String]) -> Result<Vec<JsonRow>> {
        self.executed
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));
        Ok(self.rows.clone())
    }
}

/// Hands out the same backend for every PostgreSQL profile.
pub struct StaticConnector(pub Arc<MemoryBackend>);

impl Connector for StaticConnector {
    fn open(&self, profile: &ConnectionProfile) -> Result<Arc<dyn BackendConnection>> {
        if profile.driver != Driver::Postgres {
            return Err(CanvasqlError::UnsupportedDriver(profile.driver.to_string()));
        }
        Ok(self.0.clone() as Arc<dyn BackendConnection>)
    }
}

pub fn datasource(id: &str, driver: &str) -> DatasourceRecord {
    DatasourceRecord {
        id: id.to_string(),
        name: format!("datasource {id}"),
        driver: driver.to_string(),
        host: "db.internal".to_string(),
        port: 5432,
        database: "shop".to_string(),
        username: "reader".to_string(),
        password: "s3cret".to_string(),
        schema: None,
    }
}

pub fn store_with(records: &[DatasourceRecord]) -> InMemoryDatasourceStore {
    let mut store = InMemoryDatasourceStore::new();
    for record in records {
        store.insert(record.clone());
    }
    store
}

// ============================================================================
// ETL side
// ============================================================================

pub fn source_column(name: &str, ty: &str, ordinal: i32) -> SourceColumn {
    SourceColumn {
        name: name.to_string(),
        source_type: ty.to_string(),
        nullable: true,
        max_length: None,
        precision: None,
        scale: None,
        ordinal,
    }
}

pub fn text_row(values: &[&str]) -> Row {
    values.iter().map(|v| Some(v.to_string())).collect()
}

/// `users(id integer PK, email varchar(120), created timestamp)`.
pub fn users_table(rows: usize) -> MemorySourceTable {
    let mut id = source_column("id", "integer", 1);
    id.nullable = false;
    let mut email = source_column("email", "character varying", 2);
    email.max_length = Some(120);
    MemorySourceTable {
        descriptor: SourceTableDescriptor {
            name: "users".to_string(),
            columns: vec![id, email, source_column("created", "timestamp without time zone", 3)],
            primary_key_columns: vec!["id".to_string()],
        },
        rows: (1..=rows)
            .map(|i| {
                text_row(&[
                    &i.to_string(),
                    &format!("user{i}@example.com"),
                    "2024-03-01 10:00:00",
                ])
            })
            .collect(),
    }
}

/// `orders(id, user_id, amount numeric(12,2), placed_on date)`.
pub fn orders_table(rows: usize) -> MemorySourceTable {
    let mut amount = source_column("amount", "numeric", 3);
    amount.precision = Some(12);
    amount.scale = Some(2);
    MemorySourceTable {
        descriptor: SourceTableDescriptor {
            name: "orders".to_string(),
            columns: vec![
                source_column("id", "bigint", 1),
                source_column("user_id", "integer", 2),
                amount,
                source_column("placed_on", "date", 4),
            ],
            primary_key_columns: vec!["id".to_string()],
        },
        rows: (1..=rows)
            .map(|i| text_row(&[&i.to_string(), "1", "19.90", "2024-03-02"]))
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct MemorySourceTable {
    pub descriptor: SourceTableDescriptor,
    pub rows: Vec<Row>,
}

/// Source database in memory. `fail_reads_of` makes the cursor of that
/// table fail after its first chunk.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub tables: Vec<MemorySourceTable>,
    pub fail_reads_of: Option<String>,
}

impl MemorySource {
    pub fn new(tables: Vec<MemorySourceTable>) -> Self {
        Self {
            tables,
            fail_reads_of: None,
        }
    }

    fn table(&self, name: &str) -> Result<&MemorySourceTable> {
        self.tables
            .iter()
            .find(|t| t.descriptor.name == name)
            .ok_or_else(|| CanvasqlError::UnknownTable(name.to_string()))
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self
            .tables
            .iter()
            .map(|t| t.descriptor.name.clone())
            .collect())
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTableDescriptor> {
        Ok(self.table(table)?.descriptor.clone())
    }

    async fn open_cursor(
        &self,
        table: &str,
        columns: &[MappedColumn],
        chunk_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let source = self.table(table)?;
        assert_eq!(columns.len(), source.descriptor.columns.len());
        Ok(Box::new(MemoryCursor {
            rows: source.rows.clone(),
            position: 0,
            chunk_size,
            fail_after_first: self.fail_reads_of.as_deref() == Some(table),
        }))
    }
}

struct MemoryCursor {
    rows: Vec<Row>,
    position: usize,
    chunk_size: usize,
    fail_after_first: bool,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    async fn next_chunk(&mut self) -> Result<Vec<Row>> {
        if self.fail_after_first && self.position > 0 {
            return Err(CanvasqlError::Execution("connection reset by peer".to_string()));
        }
        let end = (self.position + self.chunk_size).min(self.rows.len());
        let chunk = self.rows[self.position..end].to_vec();
        self.position = end;
        Ok(chunk)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<MappedColumn>,
    pub rows: Vec<Row>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<String>,
    pub refreshed: usize,
}

#[derive(Debug, Default)]
pub struct WarehouseState {
    pub tables: BTreeMap<String, MemoryTable>,
    /// Row count of every INSERT batch, per table.
    pub batches: BTreeMap<String, Vec<usize>>,
    pub writes: usize,
    pub fail_inserts_into: Option<String>,
}

/// Warehouse in memory with transactional loads: nothing a loader writes is
/// visible before `commit`.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    pub state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.state.lock().unwrap().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().unwrap().tables.keys().cloned().collect()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn batches(&self, table: &str) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .batches
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_inserts_into(&self, table: &str) {
        self.state.lock().unwrap().fail_inserts_into = Some(table.to_string());
    }
}

/// information_schema spelling of a warehouse column type.
fn catalog_type(dest: &DestinationType) -> (String, Option<i32>, Option<i32>, Option<i32>) {
    match dest {
        DestinationType::Varchar(n) => ("character varying".to_string(), Some(*n as i32), None, None),
        DestinationType::Char(n) => ("character".to_string(), Some(*n as i32), None, None),
        DestinationType::Numeric { precision, scale } => (
            "numeric".to_string(),
            None,
            Some(*precision as i32),
            Some(*scale as i32),
        ),
        DestinationType::Timestamp => ("timestamp without time zone".to_string(), None, None, None),
        DestinationType::TimestampTz => ("timestamp with time zone".to_string(), None, None, None),
        other => (other.to_string(), None, None, None),
    }
}

#[async_trait]
impl WarehouseTarget for MemoryWarehouse {
    async fn list_tables_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .table_names()
            .into_iter()
            .filter(|t| t.starts_with(prefix))
            .collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().tables.contains_key(table))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.tables.remove(table);
        Ok(())
    }

    async fn begin_load(
        &self,
        table: &str,
        columns: &[MappedColumn],
        mode: LoadMode,
    ) -> Result<Box<dyn TableLoader>> {
        let exists = self.state.lock().unwrap().tables.contains_key(table);
        match (mode, exists) {
            (LoadMode::Create, true) => {
                return Err(CanvasqlError::Execution(format!(
                    "relation \"{table}\" already exists"
                )))
            }
            (LoadMode::Replace, false) => {
                return Err(CanvasqlError::Execution(format!(
                    "relation \"{table}\" does not exist"
                )))
            }
            _ => {}
        }
        Ok(Box::new(MemoryLoader {
            state: Arc::clone(&self.state),
            table: table.to_string(),
            columns: columns.to_vec(),
            mode,
            staged: Vec::new(),
        }))
    }

    async fn finalize_table(
        &self,
        table: &str,
        primary_key: &[String],
        columns: &[MappedColumn],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| CanvasqlError::UnknownTable(table.to_string()))?;
        entry.primary_key = primary_key.to_vec();
        entry.indexes = columns
            .iter()
            .filter_map(|c| {
                if c.dest.is_temporal() {
                    Some(index_name(table, &c.name, "date"))
                } else if c.dest.is_numeric() {
                    Some(index_name(table, &c.name, "num"))
                } else {
                    None
                }
            })
            .collect();
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnRecord>> {
        let Some(stored) = self.table(table) else {
            return Ok(Vec::new());
        };
        let mut records: Vec<ColumnRecord> = stored
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let (data_type, max_length, precision, scale) = catalog_type(&c.dest);
                ColumnRecord {
                    table: table.to_string(),
                    name: c.name.clone(),
                    udt_name: data_type.clone(),
                    data_type,
                    nullable: c.nullable,
                    ordinal: i as i32 + 1,
                    max_length,
                    precision,
                    scale,
                }
            })
            .collect();
        for audit in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
            let ordinal = records.len() as i32 + 1;
            records.push(ColumnRecord {
                table: table.to_string(),
                name: audit.to_string(),
                data_type: "timestamp without time zone".to_string(),
                udt_name: "timestamp".to_string(),
                nullable: true,
                ordinal,
                max_length: None,
                precision: None,
                scale: None,
            });
        }
        Ok(records)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        Ok(self.table(table).map(|t| t.rows.len() as u64).unwrap_or(0))
    }
}

struct MemoryLoader {
    state: Arc<Mutex<WarehouseState>>,
    table: String,
    columns: Vec<MappedColumn>,
    mode: LoadMode,
    staged: Vec<Row>,
}

#[async_trait]
impl TableLoader for MemoryLoader {
    async fn insert_batch(&mut self, rows: &[Row]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_inserts_into.as_deref() == Some(self.table.as_str()) {
            return Err(CanvasqlError::Execution("could not extend file: no space left".to_string()));
        }
        assert!(rows.iter().all(|r| r.len() == self.columns.len()));
        state
            .batches
            .entry(self.table.clone())
            .or_default()
            .push(rows.len());
        drop(state);
        self.staged.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let mut state = this.state.lock().unwrap();
        state.writes += 1;
        match this.mode {
            LoadMode::Create => {
                state.tables.insert(
                    this.table.clone(),
                    MemoryTable {
                        columns: this.columns,
                        rows: this.staged,
                        ..MemoryTable::default()
                    },
                );
            }
            LoadMode::Replace => {
                if let Some(existing) = state.tables.get_mut(&this.table) {
                    existing.rows = this.staged;
                    existing.refreshed += 1;
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
