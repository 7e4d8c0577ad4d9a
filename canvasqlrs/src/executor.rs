//! Query service: resolve the datasource, load what the compiler needs from
//! the catalog, compile, execute with bound parameters.

use std::sync::Arc;
use std::time::Instant;

use crate::backends::BackendConnection;
use crate::config::CanvasqlConfig;
use crate::connections::{ConnectionFactory, ConnectionProfile, DatasourceStore};
use crate::error::{CanvasqlError, Result};
use crate::models::{QueryRequest, QueryResponse};
use crate::query_builder::{joinable_tables, CompiledQuery, QueryCompiler};
use crate::schema_cache::{SchemaCatalog, SchemaMetadata, SchemaSnapshotCache, TableColumn};

/// Cache key used for the warehouse connection.
pub const WAREHOUSE_KEY: &str = "warehouse";

/// Opens a backend connection for a profile.
pub trait Connector: Send + Sync {
    fn open(&self, profile: &ConnectionProfile) -> Result<Arc<dyn BackendConnection>>;
}

impl Connector for ConnectionFactory {
    fn open(&self, profile: &ConnectionProfile) -> Result<Arc<dyn BackendConnection>> {
        Ok(Arc::new(self.connect(profile)?))
    }
}

pub struct QueryService {
    store: Arc<dyn DatasourceStore>,
    connector: Arc<dyn Connector>,
    compiler: QueryCompiler,
    snapshots: SchemaSnapshotCache,
    excluded_tables: Vec<String>,
    warehouse: Option<ConnectionProfile>,
}

impl QueryService {
    pub fn new(store: Arc<dyn DatasourceStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            store,
            connector,
            compiler: QueryCompiler::default(),
            snapshots: SchemaSnapshotCache::default(),
            excluded_tables: Vec::new(),
            warehouse: None,
        }
    }

    /// Service wired from configuration: PostgreSQL pools with the query
    /// timeout, the configured snapshot cache and the warehouse profile.
    pub fn from_config(config: &CanvasqlConfig, store: Arc<dyn DatasourceStore>) -> Self {
        Self::new(store, Arc::new(ConnectionFactory::for_queries(config)))
            .with_snapshot_cache(SchemaSnapshotCache::with_config(&config.schema_cache))
            .with_excluded_tables(config.query.excluded_tables.clone())
            .with_warehouse(config.warehouse.profile())
    }

    pub fn with_snapshot_cache(mut self, cache: SchemaSnapshotCache) -> Self {
        self.snapshots = cache;
        self
    }

    pub fn with_excluded_tables(mut self, tables: Vec<String>) -> Self {
        self.excluded_tables = tables;
        self
    }

    pub fn with_warehouse(mut self, profile: ConnectionProfile) -> Self {
        self.warehouse = Some(profile);
        self
    }

    /// Run a request against a stored datasource.
    pub async fn execute(&self, datasource_id: &str, request: &QueryRequest) -> Result<QueryResponse> {
        request.validate()?;
        let profile = self.store.resolve(datasource_id).await?;
        self.execute_on(datasource_id, &profile, request).await
    }

    /// Run a request against the warehouse.
    pub async fn execute_warehouse(&self, request: &QueryRequest) -> Result<QueryResponse> {
        request.validate()?;
        let profile = self.warehouse_profile()?.clone();
        self.execute_on(WAREHOUSE_KEY, &profile, request).await
    }

    async fn execute_on(
        &self,
        key: &str,
        profile: &ConnectionProfile,
        request: &QueryRequest,
    ) -> Result<QueryResponse> {
        let start = Instant::now();
        let conn = self.connector.open(profile)?;
        let compiled = self.compile_on(key, conn.as_ref(), request).await?;

        let data = conn
            .execute_query(&compiled.sql, &compiled.params)
            .await
            .map_err(|e| {
                tracing::error!(
                    datasource = %key,
                    error = %e,
                    sql = %compiled.rendered_sql,
                    "query execution failed"
                );
                e
            })?;

        tracing::info!(
            datasource = %key,
            table = %compiled.table,
            rows = data.len(),
            ms = start.elapsed().as_millis(),
            "query executed"
        );

        Ok(QueryResponse {
            success: true,
            message: "query executed".to_string(),
            data,
            query: compiled.rendered_sql,
        })
    }

    /// Compile against a live connection without executing.
    pub async fn compile_on(
        &self,
        key: &str,
        conn: &dyn BackendConnection,
        request: &QueryRequest,
    ) -> Result<CompiledQuery> {
        let metadata = self.snapshot_for(key, conn, request).await?;
        self.compiler.compile(request, Some(&metadata))
    }

    /// The catalog is loaded in full only when joins need it; otherwise the
    /// table is checked on the connection and a one-table snapshot is used.
    async fn snapshot_for(
        &self,
        key: &str,
        conn: &dyn BackendConnection,
        request: &QueryRequest,
    ) -> Result<Arc<SchemaMetadata>> {
        if let Some(snapshot) = self.snapshots.get(key) {
            tracing::debug!(datasource = %key, "schema snapshot cache hit");
            return Ok(snapshot);
        }

        let catalog = SchemaCatalog::new(conn);
        if request.joins.is_empty() {
            let table = request.table.trim();
            let exists = conn.table_exists(table).await.map_err(|e| {
                tracing::error!(datasource = %key, error = %e, "table lookup failed");
                CanvasqlError::SchemaUnavailable(e.to_string())
            })?;
            if !exists {
                return Err(CanvasqlError::UnknownTable(table.to_string()));
            }
            return Ok(Arc::new(catalog.load_table(table).await?));
        }

        let snapshot = Arc::new(catalog.load().await?);
        self.snapshots.insert(key, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub async fn list_tables(&self, datasource_id: &str) -> Result<Vec<String>> {
        let profile = self.store.resolve(datasource_id).await?;
        let conn = self.connector.open(&profile)?;
        SchemaCatalog::new(conn.as_ref())
            .with_excluded_tables(&self.excluded_tables)
            .list_tables()
            .await
    }

    pub async fn table_columns(&self, datasource_id: &str, table: &str) -> Result<Vec<TableColumn>> {
        let profile = self.store.resolve(datasource_id).await?;
        let conn = self.connector.open(&profile)?;
        SchemaCatalog::new(conn.as_ref()).table_columns(table).await
    }

    /// Warehouse tables that can be joined after `existing`.
    pub async fn joinable_tables(&self, existing: &[String]) -> Result<Vec<String>> {
        let profile = self.warehouse_profile()?.clone();
        let conn = self.connector.open(&profile)?;
        let snapshot = match self.snapshots.get(WAREHOUSE_KEY) {
            Some(s) => s,
            None => {
                let s = Arc::new(SchemaCatalog::new(conn.as_ref()).load().await?);
                self.snapshots.insert(WAREHOUSE_KEY, Arc::clone(&s));
                s
            }
        };
        Ok(joinable_tables(existing, &snapshot))
    }

    /// Forget the cached snapshot of a datasource, e.g. after a reload.
    pub fn invalidate(&self, key: &str) {
        self.snapshots.invalidate(key);
    }

    fn warehouse_profile(&self) -> Result<&ConnectionProfile> {
        self.warehouse
            .as_ref()
            .ok_or_else(|| CanvasqlError::Config("warehouse connection is not configured".to_string()))
    }
}
