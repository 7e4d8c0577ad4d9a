use crate::error::{CanvasqlError, Result};
use crate::models::MetricSpec;
use crate::sql_ast::{Aggregation, SelectItem, SqlExpr};

use super::resolve::Scope;

/// Alias fragment derived from a column reference: dots become
/// underscores, `*` becomes `all`, anything else non-alphanumeric is dropped.
pub fn sanitize_alias(column: &str) -> String {
    column
        .trim()
        .replace('.', "_")
        .replace('*', "all")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Deterministic output name of a metric, e.g. `sum_amount`.
pub fn metric_alias(metric: &MetricSpec) -> String {
    if metric.is_star() && metric.aggregation == Aggregation::Count {
        return "count_star".to_string();
    }
    format!(
        "{}_{}",
        metric.aggregation.alias_prefix(),
        sanitize_alias(&metric.column)
    )
}

/// Aggregate expression for a metric, validated against the scope.
pub(crate) fn metric_expr(metric: &MetricSpec, scope: &Scope<'_>) -> Result<SqlExpr> {
    if metric.fallback {
        tracing::debug!(column = %metric.column, "metric compiled with COUNT fallback");
    }
    let arg = if metric.is_star() {
        if metric.aggregation != Aggregation::Count {
            return Err(CanvasqlError::Validation(format!(
                "aggregation over * is only valid for COUNT, got {metric}"
            )));
        }
        SqlExpr::Star
    } else {
        scope.resolve(&metric.column)?.expr
    };
    Ok(SqlExpr::Aggregate {
        agg: metric.aggregation,
        expr: Box::new(arg),
    })
}

pub(crate) fn metric_select(metric: &MetricSpec, scope: &Scope<'_>) -> Result<SelectItem> {
    Ok(SelectItem {
        expr: metric_expr(metric, scope)?,
        alias: Some(metric_alias(metric)),
    })
}
