//! PostgreSQL source: introspection plus a server-side cursor per table.

use async_trait::async_trait;

use crate::backends::{BackendConnection, PostgresConnection};
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{CanvasqlError, Result};

use super::{MappedColumn, Row, RowCursor, SourceColumn, SourceDatabase, SourceTableDescriptor};

const CURSOR_NAME: &str = "canvasql_etl_cursor";

/// Source SELECT: every column cast to its warehouse type, then to text.
pub(crate) fn select_sql(schema: &str, table: &str, columns: &[MappedColumn]) -> String {
    let dialect = PostgresDialect;
    let list = columns
        .iter()
        .map(|c| {
            format!(
                "CAST(CAST({} AS {}) AS text)",
                dialect.quote_ident(&c.name),
                c.dest
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {list} FROM {}.{}",
        dialect.quote_ident(schema),
        dialect.quote_ident(table)
    )
}

pub struct PostgresSource {
    conn: PostgresConnection,
}

impl PostgresSource {
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SourceDatabase for PostgresSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.conn.list_base_tables().await
    }

    async fn describe_table(&self, table: &str) -> Result<SourceTableDescriptor> {
        // Catalog lookups fold case; a source may hold `Users` and `users`.
        let mut columns = self.conn.fetch_columns(Some(table)).await?;
        columns.retain(|c| c.table == table);
        let mut keys = self.conn.fetch_primary_keys(Some(table)).await?;
        keys.retain(|k| k.table == table);
        keys.sort_by_key(|k| k.position);

        tracing::debug!(
            table = %table,
            columns = columns.len(),
            primary_key = keys.len(),
            "described source table"
        );
        Ok(SourceTableDescriptor {
            name: table.to_string(),
            columns: columns.iter().map(SourceColumn::from).collect(),
            primary_key_columns: keys.into_iter().map(|k| k.column).collect(),
        })
    }

    async fn open_cursor(
        &self,
        table: &str,
        columns: &[MappedColumn],
        chunk_size: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let client = self.conn.client().await?;
        let select = select_sql(self.conn.schema(), table, columns);
        let opened = client
            .batch_execute(&format!(
                "BEGIN READ ONLY; DECLARE {CURSOR_NAME} NO SCROLL CURSOR FOR {select}"
            ))
            .await;
        if let Err(e) = opened {
            drop(deadpool_postgres::Object::take(client));
            return Err(CanvasqlError::Execution(format!("open cursor on {table}: {e}")));
        }

        tracing::debug!(table = %table, chunk_size, "source cursor opened");
        Ok(Box::new(PgRowCursor {
            client: Some(client),
            table: table.to_string(),
            fetch_sql: format!("FETCH FORWARD {chunk_size} FROM {CURSOR_NAME}"),
            exhausted: false,
        }))
    }
}

/// Server-side cursor inside a read-only transaction. The pooled client is
/// detached instead of returned when the cursor is dropped mid-table, so the
/// open transaction dies with its connection.
pub struct PgRowCursor {
    client: Option<deadpool_postgres::Object>,
    table: String,
    fetch_sql: String,
    exhausted: bool,
}

impl PgRowCursor {
    fn client(&self) -> Result<&deadpool_postgres::Object> {
        self.client
            .as_ref()
            .ok_or_else(|| CanvasqlError::Execution(format!("cursor on {} is closed", self.table)))
    }
}

#[async_trait]
impl RowCursor for PgRowCursor {
    async fn next_chunk(&mut self) -> Result<Vec<Row>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let rows = self
            .client()?
            .query(self.fetch_sql.as_str(), &[])
            .await
            .map_err(|e| CanvasqlError::Execution(format!("fetch from {}: {e}", self.table)))?;
        if rows.is_empty() {
            self.exhausted = true;
        }

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| row.try_get::<_, Option<String>>(i))
                    .collect::<std::result::Result<Row, _>>()
                    .map_err(|e| CanvasqlError::Execution(format!("decode row: {e}")))
            })
            .collect()
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if let Some(client) = self.client.take() {
            let closed = client
                .batch_execute(&format!("CLOSE {CURSOR_NAME}; COMMIT"))
                .await;
            if let Err(e) = closed {
                drop(deadpool_postgres::Object::take(client));
                return Err(CanvasqlError::Execution(format!("close cursor: {e}")));
            }
        }
        Ok(())
    }
}

impl Drop for PgRowCursor {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tracing::debug!(table = %self.table, "discarding connection of unfinished cursor");
            drop(deadpool_postgres::Object::take(client));
        }
    }
}
