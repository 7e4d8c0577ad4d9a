use serde_json::Value;

use crate::error::{CanvasqlError, Result};
use crate::models::{scalar_text, FilterDescriptor, FilterLogic, FilterMode, FilterOperator};
use crate::sql_ast::{SqlBinaryOperator, SqlExpr};

use super::resolve::{ResolvedColumn, Scope};

/// Combined WHERE predicate and the values bound to its placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereTree {
    /// `None` when no filter contributed: the predicate is always true.
    pub expr: Option<SqlExpr>,
    pub params: Vec<String>,
}

/// Build a predicate without a schema snapshot. Columns are not validated
/// and parameters are left untyped.
pub fn build(filters: &[FilterDescriptor]) -> Result<WhereTree> {
    let scope = Scope::new("", None);
    let mut params = Vec::new();
    let expr = build_in_scope(filters, &scope, &mut params)?;
    Ok(WhereTree { expr, params })
}

/// Fold filters left to right. Each clause joins the running predicate with
/// its own `logic`; the first clause's logic is irrelevant.
pub(crate) fn build_in_scope(
    filters: &[FilterDescriptor],
    scope: &Scope<'_>,
    params: &mut Vec<String>,
) -> Result<Option<SqlExpr>> {
    let mut tree: Option<SqlExpr> = None;

    for filter in filters {
        if filter.is_blank() {
            tracing::debug!(column = ?filter.column, "skipping incomplete filter");
            continue;
        }
        let Some(clause) = clause(filter, scope, params)? else {
            continue;
        };
        tree = Some(match tree {
            None => clause,
            Some(prev) => {
                let op = match filter.logic {
                    FilterLogic::And => SqlBinaryOperator::And,
                    FilterLogic::Or => SqlBinaryOperator::Or,
                };
                SqlExpr::binary(op, prev, clause)
            }
        });
    }

    Ok(tree)
}

fn clause(
    filter: &FilterDescriptor,
    scope: &Scope<'_>,
    params: &mut Vec<String>,
) -> Result<Option<SqlExpr>> {
    let raw_column = filter.column.as_deref().unwrap_or_default();
    let column = scope.resolve(raw_column)?;
    let value = filter.value.as_ref().unwrap_or(&Value::Null);
    let exclude = filter.mode == FilterMode::Exclude;

    if filter.operator == FilterOperator::Between {
        let (low, high) = match value {
            Value::Array(items) if items.len() == 2 => {
                match (scalar_text(&items[0]), scalar_text(&items[1])) {
                    (Some(low), Some(high)) => (low, high),
                    _ => return Err(between_error(raw_column)),
                }
            }
            _ => return Err(between_error(raw_column)),
        };
        let low = bind(params, low, &column);
        let high = bind(params, high, &column);
        return Ok(Some(SqlExpr::Between {
            expr: Box::new(column.expr),
            low: Box::new(low),
            high: Box::new(high),
            negated: exclude,
        }));
    }

    let Some(text) = scalar_text(value) else {
        return Err(CanvasqlError::Validation(format!(
            "filter on '{raw_column}' needs a single value"
        )));
    };

    let (op, right) = match filter.operator {
        FilterOperator::Like => {
            params.push(format!("%{text}%"));
            (
                SqlBinaryOperator::Like,
                SqlExpr::Param {
                    index: params.len() - 1,
                    cast: None,
                },
            )
        }
        other => {
            let op = match other {
                FilterOperator::Neq => SqlBinaryOperator::Neq,
                FilterOperator::Gt => SqlBinaryOperator::Gt,
                FilterOperator::Lt => SqlBinaryOperator::Lt,
                FilterOperator::Gte => SqlBinaryOperator::Gte,
                FilterOperator::Lte => SqlBinaryOperator::Lte,
                _ => SqlBinaryOperator::Eq,
            };
            (op, bind(params, text, &column))
        }
    };

    let comparison = SqlExpr::binary(op, column.expr, right);
    Ok(Some(if exclude {
        SqlExpr::Not(Box::new(comparison))
    } else {
        comparison
    }))
}

fn bind(params: &mut Vec<String>, value: String, column: &ResolvedColumn) -> SqlExpr {
    params.push(value);
    SqlExpr::Param {
        index: params.len() - 1,
        cast: column.type_name.clone(),
    }
}

fn between_error(column: &str) -> CanvasqlError {
    CanvasqlError::Validation(format!(
        "between filter on '{column}' needs exactly two values"
    ))
}
