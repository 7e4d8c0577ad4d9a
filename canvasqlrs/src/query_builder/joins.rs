use std::cmp::Ordering;

use serde::Serialize;

use crate::error::{CanvasqlError, Result};
use crate::models::{JoinSpec, JoinType};
use crate::schema_cache::SchemaMetadata;
use crate::sql_ast::{Join, SqlBinaryOperator, SqlExpr, SqlJoinType, TableRef};

use super::resolve::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
    ForeignKey,
    PrimaryKeyName,
    Explicit,
}

/// `referencing_table.referencing_column = referenced_table.referenced_column`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinPredicate {
    pub referencing_table: String,
    pub referencing_column: String,
    pub referenced_table: String,
    pub referenced_column: String,
    pub source: JoinSource,
}

impl JoinPredicate {
    /// Equality predicate spelled the way the catalog spells each name.
    pub fn to_expr(&self, metadata: &SchemaMetadata) -> SqlExpr {
        let side = |table: &str, column: &str| {
            SqlExpr::column(
                Some(&metadata.table_ident(table)),
                &metadata.column_ident(table, column),
            )
        };
        SqlExpr::binary(
            SqlBinaryOperator::Eq,
            side(&self.referencing_table, &self.referencing_column),
            side(&self.referenced_table, &self.referenced_column),
        )
    }
}

/// Find the join predicate between two tables.
///
/// A declared foreign key in either direction wins. Otherwise a table whose
/// primary key name appears as a column of the other table is assumed to be
/// referenced by it, trying `a`'s key first.
pub fn resolve(a: &str, b: &str, metadata: &SchemaMetadata) -> Option<JoinPredicate> {
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    if let Some(fk) = metadata.foreign_keys().iter().find(|fk| {
        (fk.referencing_table == a && fk.referenced_table == b)
            || (fk.referencing_table == b && fk.referenced_table == a)
    }) {
        return Some(JoinPredicate {
            referencing_table: fk.referencing_table.clone(),
            referencing_column: fk.referencing_column.clone(),
            referenced_table: fk.referenced_table.clone(),
            referenced_column: fk.referenced_column.clone(),
            source: JoinSource::ForeignKey,
        });
    }

    by_key_name(&a, &b, metadata).or_else(|| by_key_name(&b, &a, metadata))
}

/// `owner`'s primary key appears by name on `other`: other.pk = owner.pk.
fn by_key_name(owner: &str, other: &str, metadata: &SchemaMetadata) -> Option<JoinPredicate> {
    let pk = metadata.primary_key(owner)?;
    if !metadata.has_column(other, pk) {
        return None;
    }
    tracing::debug!(
        referencing = %other,
        referenced = %owner,
        column = %pk,
        "join inferred from primary key name"
    );
    Some(JoinPredicate {
        referencing_table: other.to_string(),
        referencing_column: pk.to_string(),
        referenced_table: owner.to_string(),
        referenced_column: pk.to_string(),
        source: JoinSource::PrimaryKeyName,
    })
}

/// Tables offered for the next join after `existing` have been picked.
///
/// With nothing picked yet every table is offered. Otherwise the picked
/// tables plus everything joinable to the last one, sorted with tables of
/// the same `{connection}__` prefix first and the last pick at the end.
pub fn joinable_tables(existing: &[String], metadata: &SchemaMetadata) -> Vec<String> {
    let mut picked: Vec<String> = Vec::new();
    for t in existing {
        if !picked.contains(t) {
            picked.push(t.clone());
        }
    }
    let Some(last) = picked.last().cloned() else {
        return metadata.tables().map(|t| metadata.table_ident(t)).collect();
    };

    let mut list = picked;
    for candidate in metadata.tables() {
        if candidate.eq_ignore_ascii_case(&last) {
            continue;
        }
        if resolve(&last, candidate, metadata).is_some()
            && !list.iter().any(|t| t.eq_ignore_ascii_case(candidate))
        {
            list.push(metadata.table_ident(candidate));
        }
    }

    let prefix = connection_prefix(&last).to_string();
    list.sort_by(|x, y| {
        if *x == last {
            return Ordering::Greater;
        }
        if *y == last {
            return Ordering::Less;
        }
        let x_match = connection_prefix(x) == prefix;
        let y_match = connection_prefix(y) == prefix;
        match (x_match, y_match) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => x.to_lowercase().cmp(&y.to_lowercase()),
        }
    });
    list
}

fn connection_prefix(table: &str) -> &str {
    table.split("__").next().unwrap_or(table)
}

/// Turn join specs into JOIN clauses. Each join attaches to the table
/// joined before it, not always to the root.
pub(crate) fn plan_joins(specs: &[JoinSpec], scope: &mut Scope<'_>) -> Result<Vec<Join>> {
    let mut previous = scope.root().to_string();
    let mut joins = Vec::with_capacity(specs.len());

    for spec in specs {
        let table = spec.table.trim().to_lowercase();
        if let Some(meta) = scope.metadata() {
            if !meta.has_table(&table) {
                return Err(CanvasqlError::UnknownTable(table));
            }
        }

        let on = match (spec.join_type, &spec.on) {
            (JoinType::Cross, _) => Vec::new(),
            (_, Some(explicit)) => {
                scope.push_table(&table);
                let left = scope.resolve(&explicit.left)?;
                let right = scope.resolve_qualified_on(&explicit.right, &table)?;
                vec![SqlExpr::binary(SqlBinaryOperator::Eq, left.expr, right.expr)]
            }
            (_, None) => {
                let meta = scope.metadata().ok_or_else(|| {
                    CanvasqlError::Validation(format!(
                        "joining {table} needs a schema snapshot or an explicit predicate"
                    ))
                })?;
                let predicate =
                    resolve(&previous, &table, meta).ok_or_else(|| CanvasqlError::JoinNotFound {
                        left: previous.clone(),
                        right: table.clone(),
                    })?;
                vec![predicate.to_expr(meta)]
            }
        };

        scope.push_table(&table);
        let name = match scope.metadata() {
            Some(meta) => meta.table_ident(&table),
            None => table.clone(),
        };
        joins.push(Join {
            join_type: sql_join_type(spec.join_type),
            table: TableRef::named(name),
            on,
        });
        previous = table;
    }

    Ok(joins)
}

fn sql_join_type(join_type: JoinType) -> SqlJoinType {
    match join_type {
        JoinType::Inner => SqlJoinType::Inner,
        JoinType::Left => SqlJoinType::Left,
        JoinType::Right => SqlJoinType::Right,
        JoinType::Full => SqlJoinType::Full,
        JoinType::Cross => SqlJoinType::Cross,
    }
}
