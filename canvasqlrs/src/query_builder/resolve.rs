use crate::error::{CanvasqlError, Result};
use crate::schema_cache::SchemaMetadata;
use crate::sql_ast::SqlExpr;

/// A column reference as written in a request: `column` or `table.column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let invalid = || CanvasqlError::Validation(format!("invalid column reference '{raw}'"));
        let (table, column) = match raw.split_once('.') {
            Some((t, c)) => (Some(t.trim()), c.trim()),
            None => (None, raw),
        };
        if column.is_empty() || column.contains('.') || table.map(str::is_empty).unwrap_or(false) {
            return Err(invalid());
        }
        Ok(Self {
            table: table.map(str::to_lowercase),
            column: column.to_lowercase(),
        })
    }
}

/// A column reference checked against the tables of one query.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedColumn {
    /// Expression as written: unqualified references stay unqualified.
    pub expr: SqlExpr,
    /// Table the column was found on (or was qualified with).
    pub table: String,
    pub column: String,
    /// Catalog type name, when a snapshot is available.
    pub type_name: Option<String>,
}

impl ResolvedColumn {
    /// Identity used to compare references regardless of qualification.
    pub fn key(&self) -> (&str, &str) {
        (&self.table, &self.column)
    }
}

/// The tables participating in a query, root first, in join order.
pub(crate) struct Scope<'a> {
    tables: Vec<String>,
    metadata: Option<&'a SchemaMetadata>,
}

impl<'a> Scope<'a> {
    pub fn new(root: &str, metadata: Option<&'a SchemaMetadata>) -> Self {
        Self {
            tables: vec![root.to_lowercase()],
            metadata,
        }
    }

    pub fn push_table(&mut self, table: &str) {
        let table = table.to_lowercase();
        if !self.tables.contains(&table) {
            self.tables.push(table);
        }
    }

    pub fn root(&self) -> &str {
        &self.tables[0]
    }

    pub fn metadata(&self) -> Option<&'a SchemaMetadata> {
        self.metadata
    }

    pub fn resolve(&self, raw: &str) -> Result<ResolvedColumn> {
        let parsed = ColumnRef::parse(raw)?;
        self.resolve_ref(&parsed)
    }

    /// Resolve, qualifying an unqualified reference with the root table.
    pub fn resolve_qualified(&self, raw: &str) -> Result<ResolvedColumn> {
        self.resolve_qualified_on(raw, self.root())
    }

    pub fn resolve_qualified_on(&self, raw: &str, table: &str) -> Result<ResolvedColumn> {
        let mut parsed = ColumnRef::parse(raw)?;
        if parsed.table.is_none() {
            parsed.table = Some(table.to_lowercase());
        }
        self.resolve_ref(&parsed)
    }

    fn resolve_ref(&self, parsed: &ColumnRef) -> Result<ResolvedColumn> {
        let Some(meta) = self.metadata else {
            let table = parsed
                .table
                .clone()
                .unwrap_or_else(|| self.root().to_string());
            return Ok(ResolvedColumn {
                expr: SqlExpr::column(parsed.table.as_deref(), &parsed.column),
                table,
                column: parsed.column.clone(),
                type_name: None,
            });
        };

        let table = match &parsed.table {
            Some(t) => {
                if !self.tables.contains(t) {
                    return Err(CanvasqlError::UnknownTable(t.clone()));
                }
                if !meta.has_column(t, &parsed.column) {
                    return Err(CanvasqlError::UnknownColumn {
                        table: t.clone(),
                        column: parsed.column.clone(),
                    });
                }
                t.clone()
            }
            None => self
                .tables
                .iter()
                .find(|t| meta.has_column(t, &parsed.column))
                .cloned()
                .ok_or_else(|| CanvasqlError::UnknownColumn {
                    table: self.tables.join(", "),
                    column: parsed.column.clone(),
                })?,
        };

        let qualifier = parsed.table.as_deref().map(|t| meta.table_ident(t));
        Ok(ResolvedColumn {
            expr: SqlExpr::column(
                qualifier.as_deref(),
                &meta.column_ident(&table, &parsed.column),
            ),
            type_name: meta.column_type(&table, &parsed.column).map(str::to_string),
            table,
            column: parsed.column.clone(),
        })
    }
}
