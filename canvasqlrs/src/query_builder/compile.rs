use crate::dialect::Dialect;
use crate::error::{CanvasqlError, Result};
use crate::models::QueryRequest;
use crate::schema_cache::SchemaMetadata;
use crate::sql_ast::{
    Join, OrderItem, SelectItem, SelectQuery, SortDirection, SqlExpr, SqlRenderer, TableRef,
};

use super::filters::build_in_scope;
use super::grain::{bucket, time_grain};
use super::joins::plan_joins;
use super::measures::{metric_alias, metric_expr, metric_select};
use super::resolve::{ResolvedColumn, Scope};

pub(crate) const PLACEHOLDER_ALIAS: &str = "placeholder";

/// A compiled statement. `sql` carries placeholders and is what executes;
/// `rendered_sql` has the parameters inlined and is only for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub table: String,
    pub select_list: Vec<SelectItem>,
    pub join_clauses: Vec<Join>,
    pub where_tree: Option<SqlExpr>,
    pub group_by_list: Vec<SqlExpr>,
    pub order_by_list: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub sql: String,
    pub rendered_sql: String,
    pub params: Vec<String>,
}

/// Compile a request. With a snapshot every table and column is validated
/// and filter parameters are cast to their catalog types; without one the
/// statement is built as written.
pub fn compile(
    request: &QueryRequest,
    metadata: Option<&SchemaMetadata>,
    dialect: &dyn Dialect,
) -> Result<CompiledQuery> {
    request.validate()?;
    let table = request.table.trim().to_lowercase();

    if let Some(meta) = metadata {
        if !meta.has_table(&table) {
            return Err(CanvasqlError::UnknownTable(table));
        }
    }

    let mut scope = Scope::new(&table, metadata);
    let join_clauses = plan_joins(&request.joins, &mut scope)?;

    let mut select_list: Vec<SelectItem> = Vec::new();
    let mut group_by_list: Vec<SqlExpr> = Vec::new();
    let mut order_by_list: Vec<OrderItem> = Vec::new();

    // Time bucketing supersedes the raw date dimension.
    let mut bucketed_date: Option<ResolvedColumn> = None;
    if let (Some(grain), Some(date_column)) = (time_grain(request.granularity), request.date_column())
    {
        let date = scope.resolve_qualified(date_column)?;
        let b = bucket(grain, request.display_format, date.expr.clone());
        select_list.extend(b.select);
        group_by_list.extend(b.group_by);
        order_by_list.push(b.order_by);
        bucketed_date = Some(date);
    }

    let mut dimensions: Vec<ResolvedColumn> = Vec::new();
    for raw in &request.dimensions {
        let dim = scope.resolve(raw)?;
        if let Some(date) = &bucketed_date {
            if dim.key() == date.key() {
                continue;
            }
        }
        if dimensions.iter().any(|d| d.expr == dim.expr) {
            continue;
        }
        dimensions.push(dim);
    }
    for dim in &dimensions {
        select_list.push(SelectItem {
            expr: dim.expr.clone(),
            alias: None,
        });
        group_by_list.push(dim.expr.clone());
    }

    for metric in &request.metrics {
        select_list.push(metric_select(metric, &scope)?);
    }
    let has_metrics = !request.metrics.is_empty();

    if select_list.is_empty() {
        tracing::debug!(table = %table, "no dimensions or metrics, selecting placeholder");
        select_list.push(SelectItem {
            expr: SqlExpr::Literal(serde_json::Value::from(1)),
            alias: Some(PLACEHOLDER_ALIAS.to_string()),
        });
    }

    let mut params = Vec::new();
    let where_tree = build_in_scope(&request.filters, &scope, &mut params)?;

    if order_by_list.is_empty() {
        if let Some(first) = dimensions.first() {
            order_by_list.push(OrderItem {
                expr: first.expr.clone(),
                direction: SortDirection::Asc,
            });
        }
    }

    let mut limit = None;
    if let (Some(n), true) = (request.top_n, has_metrics) {
        let ranking = request
            .top_n_metric
            .as_ref()
            .or_else(|| request.metrics.first())
            .ok_or_else(|| CanvasqlError::Validation("top-N needs a metric".to_string()))?;
        let alias = metric_alias(ranking);
        let selected = select_list
            .iter()
            .any(|item| item.alias.as_deref() == Some(alias.as_str()));
        let expr = if selected {
            SqlExpr::Alias(alias)
        } else {
            metric_expr(ranking, &scope)?
        };
        order_by_list = vec![OrderItem {
            expr,
            direction: SortDirection::Desc,
        }];
        limit = Some(n);
    }

    let query = SelectQuery {
        select: select_list,
        from: TableRef::named(match metadata {
            Some(meta) => meta.table_ident(&table),
            None => table.clone(),
        }),
        joins: join_clauses,
        filter: where_tree,
        group_by: group_by_list,
        order_by: order_by_list,
        limit,
    };
    let sql = SqlRenderer::new(dialect).render_select(&query);
    let rendered_sql = SqlRenderer::with_inline_params(dialect, &params).render_select(&query);

    tracing::debug!(table = %table, sql = %sql, "compiled query");
    tracing::trace!(params = params.len(), "bound parameters");

    Ok(CompiledQuery {
        table,
        select_list: query.select,
        join_clauses: query.joins,
        where_tree: query.filter,
        group_by_list: query.group_by,
        order_by_list: query.order_by,
        limit: query.limit,
        sql,
        rendered_sql,
        params,
    })
}
