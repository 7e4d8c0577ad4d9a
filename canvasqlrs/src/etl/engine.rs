use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::backends::ColumnRecord;
use crate::config::{CanvasqlConfig, EtlConfig};
use crate::connections::{ConnectionFactory, ConnectionProfile};
use crate::error::{CanvasqlError, Result};

use super::lease::LeaseRegistry;
use super::source::PostgresSource;
use super::type_mapper::{destination_type, map_columns, DestinationType, MappedColumn};
use super::warehouse::PostgresWarehouse;
use super::{
    table_prefix, validate_connection_name, warehouse_table_name, EtlMode, EtlReport, EtlRequest,
    LoadMode, Row, SourceDatabase, SourceTableDescriptor, TableLoader, TableReport, TableStatus,
    WarehouseTarget, TABLE_SEPARATOR,
};

/// PostgreSQL's bind parameter limit for one statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Rows per INSERT so that `rows × columns` stays within the bind limit.
pub(crate) fn effective_batch_size(configured: usize, columns: usize) -> usize {
    let ceiling = (MAX_BIND_PARAMS / columns.max(1)).max(1);
    configured.max(1).min(ceiling)
}

fn bulk_failure(table: &str, err: CanvasqlError) -> CanvasqlError {
    match err {
        e @ CanvasqlError::BulkCopyFailure { .. } => e,
        other => CanvasqlError::BulkCopyFailure {
            table: table.to_string(),
            message: other.to_string(),
        },
    }
}

fn schema_unavailable(err: CanvasqlError) -> CanvasqlError {
    match err {
        e @ CanvasqlError::SchemaUnavailable(_) => e,
        other => CanvasqlError::SchemaUnavailable(other.to_string()),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn column_class(record: &ColumnRecord) -> Option<DestinationType> {
    destination_type(
        &record.data_type,
        record.max_length,
        record.precision,
        record.scale,
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseTableStats {
    pub table_name: String,
    pub connection_name: String,
    pub source_table: String,
    pub row_count: u64,
    pub total_columns: usize,
    pub date_columns: usize,
    pub numeric_columns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseSummary {
    pub total_tables: usize,
    pub total_rows: u64,
    pub connections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarehouseStats {
    pub tables: Vec<WarehouseTableStats>,
    pub summary: WarehouseSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadata {
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub max_length: Option<i32>,
    pub precision: Option<i32>,
    pub scale: Option<i32>,
    pub ordinal_position: i32,
    pub is_date_type: bool,
    pub is_numeric_type: bool,
    pub is_text_type: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub total_columns: usize,
    pub date_columns: usize,
    pub numeric_columns: usize,
    pub text_columns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadataReport {
    pub table_name: String,
    pub columns: Vec<ColumnMetadata>,
    pub summary: ColumnSummary,
}

/// Drives `run`, `refresh` and `full_refresh` against one warehouse.
pub struct EtlEngine {
    warehouse: Arc<dyn WarehouseTarget>,
    leases: Arc<LeaseRegistry>,
    config: EtlConfig,
}

impl EtlEngine {
    pub fn new(warehouse: Arc<dyn WarehouseTarget>, config: EtlConfig) -> Self {
        Self {
            warehouse,
            leases: LeaseRegistry::global(),
            config,
        }
    }

    /// Engine writing to the configured PostgreSQL warehouse.
    pub fn from_config(config: &CanvasqlConfig) -> Result<Self> {
        let factory = ConnectionFactory::for_etl(config);
        let warehouse = PostgresWarehouse::new(factory.connect(&config.warehouse.profile())?);
        Ok(Self::new(Arc::new(warehouse), config.etl.clone()))
    }

    pub fn with_lease_registry(mut self, leases: Arc<LeaseRegistry>) -> Self {
        self.leases = leases;
        self
    }

    /// Validate an inline request, connect to its PostgreSQL source and run
    /// the requested lifecycle.
    pub async fn execute_request(
        &self,
        mode: EtlMode,
        request: &EtlRequest,
        factory: &ConnectionFactory,
    ) -> Result<EtlReport> {
        request.validate()?;
        let profile = ConnectionProfile::from_etl_request(request);
        let source = PostgresSource::new(factory.connect(&profile)?);
        self.execute(mode, &source, &request.connection_name).await
    }

    pub async fn execute(
        &self,
        mode: EtlMode,
        source: &dyn SourceDatabase,
        connection_name: &str,
    ) -> Result<EtlReport> {
        match mode {
            EtlMode::Run => self.run(source, connection_name).await,
            EtlMode::Refresh => self.refresh(source, connection_name).await,
            EtlMode::FullRefresh => self.full_refresh(source, connection_name).await,
        }
    }

    /// First load of a connection. Fails with `ConnectionNameConflict`
    /// before any write when the prefix already has tables.
    pub async fn run(&self, source: &dyn SourceDatabase, connection_name: &str) -> Result<EtlReport> {
        validate_connection_name(connection_name)?;
        let _lease = self.leases.acquire(connection_name)?;

        let prefix = table_prefix(connection_name);
        let existing = self.warehouse.list_tables_with_prefix(&prefix).await?;
        if !existing.is_empty() {
            tracing::warn!(
                connection = %connection_name,
                tables = existing.len(),
                "connection name already has warehouse tables"
            );
            return Err(CanvasqlError::ConnectionNameConflict(
                connection_name.to_string(),
            ));
        }

        self.load_all(source, connection_name, EtlMode::Run).await
    }

    /// Drop every `{connection}__*` table, then load from scratch.
    pub async fn full_refresh(
        &self,
        source: &dyn SourceDatabase,
        connection_name: &str,
    ) -> Result<EtlReport> {
        validate_connection_name(connection_name)?;
        let _lease = self.leases.acquire(connection_name)?;

        let prefix = table_prefix(connection_name);
        for table in self.warehouse.list_tables_with_prefix(&prefix).await? {
            tracing::info!(table = %table, "dropping warehouse table");
            self.warehouse.drop_table(&table).await?;
        }

        self.load_all(source, connection_name, EtlMode::FullRefresh)
            .await
    }

    /// Reload the rows of tables that already exist in the warehouse.
    /// Source tables without a warehouse counterpart are skipped; a failing
    /// table is reported and the others continue.
    pub async fn refresh(
        &self,
        source: &dyn SourceDatabase,
        connection_name: &str,
    ) -> Result<EtlReport> {
        validate_connection_name(connection_name)?;
        let _lease = self.leases.acquire(connection_name)?;
        let start = Instant::now();

        let tables = source.list_tables().await.map_err(schema_unavailable)?;
        tracing::info!(
            connection = %connection_name,
            tables = tables.len(),
            "starting ETL refresh"
        );

        let reports: Vec<TableReport> = stream::iter(tables.iter())
            .map(|table| self.refresh_table(source, connection_name, table))
            .buffered(self.config.table_parallelism.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        Ok(self.report(connection_name, EtlMode::Refresh, reports, start))
    }

    async fn load_all(
        &self,
        source: &dyn SourceDatabase,
        connection_name: &str,
        mode: EtlMode,
    ) -> Result<EtlReport> {
        let start = Instant::now();
        let tables = source.list_tables().await.map_err(schema_unavailable)?;
        tracing::info!(
            connection = %connection_name,
            mode = %mode,
            tables = tables.len(),
            "starting ETL load"
        );

        let reports: Vec<TableReport> = stream::iter(tables.iter())
            .map(|table| self.load_table(source, connection_name, table))
            .buffered(self.config.table_parallelism.max(1))
            .try_collect::<Vec<_>>()
            .await?
            .into_iter()
            .flatten()
            .collect();

        Ok(self.report(connection_name, mode, reports, start))
    }

    async fn load_table(
        &self,
        source: &dyn SourceDatabase,
        connection_name: &str,
        table: &str,
    ) -> Result<Option<TableReport>> {
        let start = Instant::now();
        let descriptor = source
            .describe_table(table)
            .await
            .map_err(schema_unavailable)?;
        if descriptor.columns.is_empty() {
            tracing::warn!(table = %table, "source table has no columns, skipping");
            return Ok(None);
        }

        let columns = map_columns(&descriptor.columns);
        let warehouse_table = warehouse_table_name(connection_name, &descriptor.name);
        let rows = self
            .copy_table(source, &descriptor.name, &warehouse_table, &columns, LoadMode::Create)
            .await?;
        self.warehouse
            .finalize_table(&warehouse_table, &descriptor.primary_key_columns, &columns)
            .await
            .map_err(|e| bulk_failure(&warehouse_table, e))?;

        tracing::info!(
            table = %warehouse_table,
            rows,
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "table loaded"
        );
        Ok(Some(table_report(
            &descriptor,
            warehouse_table,
            &columns,
            rows,
            start,
            TableStatus::Loaded,
        )))
    }

    async fn refresh_table(
        &self,
        source: &dyn SourceDatabase,
        connection_name: &str,
        table: &str,
    ) -> Option<TableReport> {
        let start = Instant::now();
        let warehouse_table = warehouse_table_name(connection_name, table);
        match self
            .try_refresh_table(source, table, &warehouse_table, start)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(table = %warehouse_table, error = %e, "table refresh failed");
                Some(TableReport {
                    source_table: table.to_string(),
                    warehouse_table,
                    columns_count: 0,
                    rows_count: 0,
                    primary_key: Vec::new(),
                    date_columns: Vec::new(),
                    numeric_columns: Vec::new(),
                    elapsed_ms: elapsed_ms(start),
                    status: TableStatus::Failed,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn try_refresh_table(
        &self,
        source: &dyn SourceDatabase,
        table: &str,
        warehouse_table: &str,
        start: Instant,
    ) -> Result<Option<TableReport>> {
        if !self.warehouse.table_exists(warehouse_table).await? {
            tracing::debug!(table = %warehouse_table, "no warehouse table, skipping refresh");
            return Ok(None);
        }
        let descriptor = source
            .describe_table(table)
            .await
            .map_err(schema_unavailable)?;
        if descriptor.columns.is_empty() {
            return Ok(None);
        }

        let columns = map_columns(&descriptor.columns);
        let rows = self
            .copy_table(source, &descriptor.name, warehouse_table, &columns, LoadMode::Replace)
            .await?;

        tracing::info!(
            table = %warehouse_table,
            rows,
            ms = start.elapsed().as_millis(),
            "table refreshed"
        );
        Ok(Some(table_report(
            &descriptor,
            warehouse_table.to_string(),
            &columns,
            rows,
            start,
            TableStatus::Refreshed,
        )))
    }

    /// One transaction per table: the loader commits only after every row
    /// arrived, otherwise it rolls back.
    async fn copy_table(
        &self,
        source: &dyn SourceDatabase,
        source_table: &str,
        warehouse_table: &str,
        columns: &[MappedColumn],
        mode: LoadMode,
    ) -> Result<u64> {
        let mut loader = self
            .warehouse
            .begin_load(warehouse_table, columns, mode)
            .await
            .map_err(|e| bulk_failure(warehouse_table, e))?;

        match self.pump(source, source_table, columns, &mut loader).await {
            Ok(rows) => {
                loader
                    .commit()
                    .await
                    .map_err(|e| bulk_failure(warehouse_table, e))?;
                Ok(rows)
            }
            Err(e) => {
                tracing::error!(
                    table = %warehouse_table,
                    error = %e,
                    "bulk copy failed, rolling back"
                );
                if let Err(rollback) = loader.rollback().await {
                    tracing::warn!(table = %warehouse_table, error = %rollback, "rollback failed");
                }
                Err(bulk_failure(warehouse_table, e))
            }
        }
    }

    async fn pump(
        &self,
        source: &dyn SourceDatabase,
        source_table: &str,
        columns: &[MappedColumn],
        loader: &mut Box<dyn TableLoader>,
    ) -> Result<u64> {
        let batch_size = effective_batch_size(self.config.insert_batch_size, columns.len());
        let mut cursor = source
            .open_cursor(source_table, columns, self.config.read_chunk_size.max(1))
            .await?;

        let mut pending: Vec<Row> = Vec::with_capacity(batch_size);
        let mut written = 0u64;
        loop {
            let chunk = cursor.next_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            for row in chunk {
                pending.push(row);
                if pending.len() == batch_size {
                    written += loader.insert_batch(&pending).await?;
                    pending.clear();
                }
            }
            tracing::trace!(table = %source_table, written, "chunk copied");
        }
        if !pending.is_empty() {
            written += loader.insert_batch(&pending).await?;
        }
        cursor.close().await?;
        Ok(written)
    }

    fn report(
        &self,
        connection_name: &str,
        mode: EtlMode,
        tables: Vec<TableReport>,
        start: Instant,
    ) -> EtlReport {
        let total_rows = tables.iter().map(|t| t.rows_count).sum();
        let report = EtlReport {
            connection_name: connection_name.to_string(),
            mode,
            total_tables: tables.len(),
            total_rows,
            tables,
            elapsed_ms: elapsed_ms(start),
        };
        tracing::info!(
            connection = %connection_name,
            mode = %mode,
            tables = report.total_tables,
            rows = report.total_rows,
            ms = report.elapsed_ms,
            "ETL finished"
        );
        report
    }

    /// Row and column counts of every replicated table in the warehouse.
    pub async fn warehouse_stats(&self) -> Result<WarehouseStats> {
        let mut tables = Vec::new();
        for table in self.warehouse.list_tables_with_prefix("").await? {
            let Some((connection_name, source_table)) = table.split_once(TABLE_SEPARATOR) else {
                continue;
            };
            let row_count = self.warehouse.row_count(&table).await?;
            let columns = self.warehouse.describe_table(&table).await?;
            let classes: Vec<Option<DestinationType>> = columns.iter().map(column_class).collect();
            tables.push(WarehouseTableStats {
                connection_name: connection_name.to_string(),
                source_table: source_table.to_string(),
                row_count,
                total_columns: columns.len(),
                date_columns: classes.iter().flatten().filter(|c| c.is_temporal()).count(),
                numeric_columns: classes.iter().flatten().filter(|c| c.is_numeric()).count(),
                table_name: table,
            });
        }

        let connections: BTreeSet<String> =
            tables.iter().map(|t| t.connection_name.clone()).collect();
        let summary = WarehouseSummary {
            total_tables: tables.len(),
            total_rows: tables.iter().map(|t| t.row_count).sum(),
            connections: connections.into_iter().collect(),
        };
        Ok(WarehouseStats { tables, summary })
    }

    /// Columns of one warehouse table with their date/numeric/text class.
    pub async fn column_metadata(&self, table: &str) -> Result<ColumnMetadataReport> {
        let records = self.warehouse.describe_table(table).await?;
        if records.is_empty() {
            return Err(CanvasqlError::UnknownTable(table.to_string()));
        }

        let columns: Vec<ColumnMetadata> = records
            .iter()
            .map(|record| {
                let class = column_class(record);
                ColumnMetadata {
                    column_name: record.name.clone(),
                    data_type: record.data_type.clone(),
                    is_nullable: record.nullable,
                    max_length: record.max_length,
                    precision: record.precision,
                    scale: record.scale,
                    ordinal_position: record.ordinal,
                    is_date_type: class.is_some_and(|c| c.is_temporal()),
                    is_numeric_type: class.is_some_and(|c| c.is_numeric()),
                    is_text_type: class.is_some_and(|c| c.is_text()),
                }
            })
            .collect();

        let summary = ColumnSummary {
            total_columns: columns.len(),
            date_columns: columns.iter().filter(|c| c.is_date_type).count(),
            numeric_columns: columns.iter().filter(|c| c.is_numeric_type).count(),
            text_columns: columns.iter().filter(|c| c.is_text_type).count(),
        };
        Ok(ColumnMetadataReport {
            table_name: table.to_string(),
            columns,
            summary,
        })
    }
}

fn table_report(
    descriptor: &SourceTableDescriptor,
    warehouse_table: String,
    columns: &[MappedColumn],
    rows: u64,
    start: Instant,
    status: TableStatus,
) -> TableReport {
    let names = |pred: fn(&DestinationType) -> bool| -> Vec<String> {
        columns
            .iter()
            .filter(|c| pred(&c.dest))
            .map(|c| c.name.clone())
            .collect()
    };
    TableReport {
        source_table: descriptor.name.clone(),
        warehouse_table,
        columns_count: columns.len(),
        rows_count: rows,
        primary_key: descriptor.primary_key_columns.clone(),
        date_columns: names(DestinationType::is_temporal),
        numeric_columns: names(DestinationType::is_numeric),
        elapsed_ms: elapsed_ms(start),
        status,
        error: None,
    }
}
