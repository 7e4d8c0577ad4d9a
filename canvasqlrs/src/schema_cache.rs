//! Schema catalog: immutable metadata snapshots loaded by introspection,
//! plus an optional TTL cache for reusing them across requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backends::BackendConnection;
use crate::config::SchemaCacheConfig;
use crate::error::{CanvasqlError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub referencing_table: String,
    pub referencing_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Read-only view of a database's tables, keys and relationships.
/// Every table and column name is lowercased for lookup; the catalog's own
/// spelling is kept separately for rendering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaMetadata {
    table_columns: BTreeMap<String, Vec<String>>,
    column_types: HashMap<String, HashMap<String, String>>,
    table_spellings: HashMap<String, String>,
    column_spellings: HashMap<String, HashMap<String, String>>,
    primary_keys: HashMap<String, Vec<String>>,
    foreign_keys: Vec<ForeignKey>,
}

impl SchemaMetadata {
    pub fn builder() -> SchemaMetadataBuilder {
        SchemaMetadataBuilder::default()
    }

    /// Table names in sorted order.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.table_columns.keys().map(String::as_str)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.table_columns.contains_key(&table.to_lowercase())
    }

    /// Columns of a table in ordinal order.
    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.table_columns
            .get(&table.to_lowercase())
            .map(Vec::as_slice)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        let column = column.to_lowercase();
        self.columns(table)
            .map(|cols| cols.iter().any(|c| *c == column))
            .unwrap_or(false)
    }

    /// Catalog type name of a column, when known.
    pub fn column_type(&self, table: &str, column: &str) -> Option<&str> {
        self.column_types
            .get(&table.to_lowercase())
            .and_then(|cols| cols.get(&column.to_lowercase()))
            .map(String::as_str)
    }

    /// All primary key columns of a table, in key order.
    pub fn primary_keys(&self, table: &str) -> &[String] {
        self.primary_keys
            .get(&table.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Leading primary key column, used by the join heuristic.
    pub fn primary_key(&self, table: &str) -> Option<&str> {
        self.primary_keys(table).first().map(String::as_str)
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Table name as spelled in the catalog. Unknown tables come back
    /// lowercased.
    pub fn table_ident(&self, table: &str) -> String {
        let key = table.to_lowercase();
        self.table_spellings.get(&key).cloned().unwrap_or(key)
    }

    /// Column name as spelled in the catalog.
    pub fn column_ident(&self, table: &str, column: &str) -> String {
        let key = column.to_lowercase();
        self.column_spellings
            .get(&table.to_lowercase())
            .and_then(|cols| cols.get(&key))
            .cloned()
            .unwrap_or(key)
    }
}

#[derive(Debug, Default)]
pub struct SchemaMetadataBuilder {
    inner: SchemaMetadata,
}

impl SchemaMetadataBuilder {
    pub fn table(mut self, table: &str, columns: &[&str]) -> Self {
        let table_key = self.table_key(table);
        self.inner.table_columns.insert(table_key.clone(), Vec::new());
        for column in columns {
            self.push_column(&table_key, column, None);
        }
        self
    }

    /// Table whose columns carry catalog type names.
    pub fn typed_table(mut self, table: &str, columns: &[(&str, &str)]) -> Self {
        let table_key = self.table_key(table);
        for &(column, ty) in columns {
            self.push_column(&table_key, column, Some(ty));
        }
        self.inner.table_columns.entry(table_key).or_default();
        self
    }

    pub fn column(mut self, table: &str, column: &str, type_name: Option<&str>) -> Self {
        let table_key = self.table_key(table);
        self.push_column(&table_key, column, type_name);
        self
    }

    pub fn primary_key(mut self, table: &str, columns: &[&str]) -> Self {
        self.inner.primary_keys.insert(
            table.to_lowercase(),
            columns.iter().map(|c| c.to_lowercase()).collect(),
        );
        self
    }

    pub fn foreign_key(
        mut self,
        referencing_table: &str,
        referencing_column: &str,
        referenced_table: &str,
        referenced_column: &str,
    ) -> Self {
        self.inner.foreign_keys.push(ForeignKey {
            referencing_table: referencing_table.to_lowercase(),
            referencing_column: referencing_column.to_lowercase(),
            referenced_table: referenced_table.to_lowercase(),
            referenced_column: referenced_column.to_lowercase(),
        });
        self
    }

    pub fn build(self) -> SchemaMetadata {
        self.inner
    }

    /// Lookup key for a table, remembering the first spelling seen.
    fn table_key(&mut self, table: &str) -> String {
        let key = table.to_lowercase();
        self.inner
            .table_spellings
            .entry(key.clone())
            .or_insert_with(|| table.to_string());
        key
    }

    fn push_column(&mut self, table_key: &str, spelled: &str, type_name: Option<&str>) {
        let column = spelled.to_lowercase();
        self.inner
            .column_spellings
            .entry(table_key.to_string())
            .or_default()
            .entry(column.clone())
            .or_insert_with(|| spelled.to_string());
        let columns = self
            .inner
            .table_columns
            .entry(table_key.to_string())
            .or_default();
        if !columns.contains(&column) {
            columns.push(column.clone());
        }
        if let Some(ty) = type_name {
            self.inner
                .column_types
                .entry(table_key.to_string())
                .or_default()
                .insert(column, ty.to_string());
        }
    }
}

/// Column listing entry returned to callers building a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableColumn {
    pub id: i32,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

/// Loads snapshots from a live connection.
pub struct SchemaCatalog<'a> {
    conn: &'a dyn BackendConnection,
    excluded_tables: &'a [String],
}

impl<'a> SchemaCatalog<'a> {
    pub fn new(conn: &'a dyn BackendConnection) -> Self {
        Self {
            conn,
            excluded_tables: &[],
        }
    }

    /// Tables hidden from `list_tables`.
    pub fn with_excluded_tables(mut self, excluded: &'a [String]) -> Self {
        self.excluded_tables = excluded;
        self
    }

    /// Columns, then primary keys, then foreign keys for the whole schema.
    pub async fn load(&self) -> Result<SchemaMetadata> {
        let start = Instant::now();
        let snapshot = self.load_scoped(None).await?;
        tracing::debug!(
            schema = self.conn.schema(),
            tables = snapshot.table_columns.len(),
            foreign_keys = snapshot.foreign_keys.len(),
            ms = start.elapsed().as_millis(),
            "schema catalog loaded"
        );
        Ok(snapshot)
    }

    /// Snapshot of a single table, enough to validate identifiers when a
    /// query has no joins. Foreign keys are not loaded.
    pub async fn load_table(&self, table: &str) -> Result<SchemaMetadata> {
        let snapshot = self.load_scoped(Some(table)).await?;
        if !snapshot.has_table(table) {
            return Err(CanvasqlError::UnknownTable(table.to_string()));
        }
        Ok(snapshot)
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let tables = self.conn.list_base_tables().await.map_err(unavailable)?;
        Ok(tables
            .into_iter()
            .filter(|t| !self.excluded_tables.iter().any(|x| x.eq_ignore_ascii_case(t)))
            .collect())
    }

    pub async fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let records = self
            .conn
            .fetch_columns(Some(table))
            .await
            .map_err(unavailable)?;
        if records.is_empty() {
            return Err(CanvasqlError::UnknownTable(table.to_string()));
        }
        Ok(records
            .into_iter()
            .map(|r| TableColumn {
                id: r.ordinal,
                name: r.name,
                data_type: r.data_type,
                nullable: r.nullable,
            })
            .collect())
    }

    async fn load_scoped(&self, table: Option<&str>) -> Result<SchemaMetadata> {
        let mut builder = SchemaMetadata::builder();

        for col in self.conn.fetch_columns(table).await.map_err(unavailable)? {
            builder = builder.column(&col.table, &col.name, Some(&col.udt_name));
        }

        let mut keys = self
            .conn
            .fetch_primary_keys(table)
            .await
            .map_err(unavailable)?;
        keys.sort_by(|a, b| a.table.cmp(&b.table).then(a.position.cmp(&b.position)));
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            grouped
                .entry(key.table.to_lowercase())
                .or_default()
                .push(key.column.to_lowercase());
        }
        for (t, cols) in &grouped {
            let cols: Vec<&str> = cols.iter().map(String::as_str).collect();
            builder = builder.primary_key(t, &cols);
        }

        if table.is_none() {
            for fk in self.conn.fetch_foreign_keys().await.map_err(unavailable)? {
                builder = builder.foreign_key(
                    &fk.referencing_table,
                    &fk.referencing_column,
                    &fk.referenced_table,
                    &fk.referenced_column,
                );
            }
        }

        Ok(builder.build())
    }
}

fn unavailable(err: CanvasqlError) -> CanvasqlError {
    tracing::error!(error = %err, "schema introspection failed");
    CanvasqlError::SchemaUnavailable(err.to_string())
}

/// Cache entry with timestamp for TTL tracking.
#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: Arc<SchemaMetadata>,
    inserted_at: Instant,
}

/// Snapshots keyed by datasource id. Entries are replaced whole, never
/// mutated, so readers holding an `Arc` are unaffected by invalidation.
#[derive(Debug)]
pub struct SchemaSnapshotCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_size: usize,
    enabled: bool,
}

impl Default for SchemaSnapshotCache {
    fn default() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }
}

impl SchemaSnapshotCache {
    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size.max(1),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<Arc<SchemaMetadata>> {
        if !self.enabled {
            return None;
        }
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(Arc::clone(&entry.snapshot))
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: impl Into<String>, snapshot: Arc<SchemaMetadata>) {
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        if entries.len() >= self.max_size {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!(key = %oldest_key, "evicting oldest schema snapshot");
                entries.remove(&oldest_key);
            }
        }
        entries.insert(
            key.into(),
            CacheEntry {
                snapshot,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop the snapshot for one datasource, e.g. after an ETL run changed it.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(key).is_some() {
            tracing::debug!(key = %key, "schema snapshot invalidated");
        }
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
