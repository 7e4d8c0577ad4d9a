//! Integration tests for the query compiler.
//!
//! These exercise the public API: QueryRequest in, CompiledQuery out.

use canvasql::dialect::PostgresDialect;
use canvasql::error::CanvasqlError;
use canvasql::models::QueryRequest;
use canvasql::query_builder::{compile, CompiledQuery, QueryCompiler};
use canvasql::schema_cache::SchemaMetadata;
use serde_json::{json, Value};

// ============================================================================
// Test fixtures
// ============================================================================

mod fixtures {
    use super::*;

    pub fn shop_schema() -> SchemaMetadata {
        SchemaMetadata::builder()
            .typed_table(
                "orders",
                &[
                    ("id", "int4"),
                    ("region", "varchar"),
                    ("amount", "numeric"),
                    ("customer_id", "int4"),
                    ("created_at", "timestamp"),
                ],
            )
            .typed_table("customers", &[("id", "int4"), ("name", "text")])
            .typed_table(
                "addresses",
                &[("address_id", "int4"), ("customer_id", "int4"), ("city", "text")],
            )
            .typed_table("products", &[("product_id", "int4"), ("title", "text")])
            .primary_key("orders", &["id"])
            .primary_key("customers", &["id"])
            .primary_key("addresses", &["address_id"])
            .primary_key("products", &["product_id"])
            .foreign_key("orders", "customer_id", "customers", "id")
            .foreign_key("addresses", "customer_id", "customers", "id")
            .build()
    }

    pub fn request(value: Value) -> QueryRequest {
        serde_json::from_value(value).expect("valid request")
    }
}

use fixtures::{request, shop_schema};

fn compile_with_schema(value: Value) -> CompiledQuery {
    compile(&request(value), Some(&shop_schema()), &PostgresDialect).expect("compiles")
}

fn compile_err(value: Value) -> CanvasqlError {
    compile(&request(value), Some(&shop_schema()), &PostgresDialect).unwrap_err()
}

// ============================================================================
// Grouping, ordering, top-N
// ============================================================================

#[test]
fn dimension_and_sum_group_and_order_by_dimension() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "metrics": ["amount|SUM"]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT \"region\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
         GROUP BY \"region\" ORDER BY \"region\" ASC"
    );
    assert!(compiled.params.is_empty());
    assert_eq!(compiled.rendered_sql, compiled.sql);
}

#[test]
fn compiles_without_a_schema_snapshot() {
    let compiled = QueryCompiler::default()
        .compile(
            &request(json!({
                "table": "Orders",
                "dimensions": ["REGION"],
                "metrics": ["amount|sum"]
            })),
            None,
        )
        .unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT \"region\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
         GROUP BY \"region\" ORDER BY \"region\" ASC"
    );
}

#[test]
fn top_n_orders_by_metric_and_limits() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "metrics": ["amount|SUM"],
        "topN": 5
    }));
    assert_eq!(
        compiled.sql,
        "SELECT \"region\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
         GROUP BY \"region\" ORDER BY \"sum_amount\" DESC LIMIT 5"
    );
    assert_eq!(compiled.limit, Some(5));
}

#[test]
fn top_n_by_unselected_metric_orders_by_its_aggregate() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "metrics": ["amount|SUM"],
        "topN": "3",
        "topN_metric": "amount|MAX"
    }));
    assert!(compiled
        .sql
        .ends_with("ORDER BY MAX(\"amount\") DESC LIMIT 3"));
}

#[test]
fn top_n_without_metrics_is_ignored() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "topN": 10
    }));
    assert_eq!(compiled.limit, None);
    assert_eq!(
        compiled.sql,
        "SELECT \"region\" FROM \"orders\" GROUP BY \"region\" ORDER BY \"region\" ASC"
    );
}

#[test]
fn empty_selection_uses_placeholder_column() {
    let compiled = compile_with_schema(json!({"table": "orders"}));
    assert_eq!(compiled.sql, "SELECT 1 AS \"placeholder\" FROM \"orders\"");
}

#[test]
fn count_star_and_count_distinct() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "metrics": ["*|COUNT", "customer_id|COUNT_DISTINCT"]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT COUNT(*) AS \"count_star\", COUNT(DISTINCT \"customer_id\") AS \
         \"count_distinct_customer_id\" FROM \"orders\""
    );
}

#[test]
fn unknown_aggregation_falls_back_to_count() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "metrics": ["amount|MEDIAN"]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT COUNT(\"amount\") AS \"count_amount\" FROM \"orders\""
    );
}

#[test]
fn star_outside_count_is_rejected() {
    let err = compile_err(json!({"table": "orders", "metrics": ["*|SUM"]}));
    assert!(matches!(err, CanvasqlError::Validation(_)));
}

// ============================================================================
// Joins
// ============================================================================

#[test]
fn join_uses_declared_foreign_key() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["customers.name"],
        "metrics": ["amount|SUM"],
        "joins": [{"table": "customers", "join_type": "INNER"}]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT \"customers\".\"name\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
         JOIN \"customers\" ON (\"orders\".\"customer_id\" = \"customers\".\"id\") \
         GROUP BY \"customers\".\"name\" ORDER BY \"customers\".\"name\" ASC"
    );
}

#[test]
fn chained_join_attaches_to_previous_table() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["addresses.city"],
        "tabel_join": [
            {"tabel": "customers", "join_type": "left"},
            {"tabel": "addresses", "join_type": "left"}
        ]
    }));
    assert!(compiled.sql.contains(
        "LEFT JOIN \"customers\" ON (\"orders\".\"customer_id\" = \"customers\".\"id\") \
         LEFT JOIN \"addresses\" ON (\"addresses\".\"customer_id\" = \"customers\".\"id\")"
    ));
}

#[test]
fn cross_join_has_no_predicate() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["products.title"],
        "joins": [{"table": "products", "join_type": "cross"}]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT \"products\".\"title\" FROM \"orders\" CROSS JOIN \"products\" \
         GROUP BY \"products\".\"title\" ORDER BY \"products\".\"title\" ASC"
    );
}

#[test]
fn unrelated_tables_fail_with_join_not_found() {
    let err = compile_err(json!({
        "table": "orders",
        "joins": [{"table": "products"}]
    }));
    match err {
        CanvasqlError::JoinNotFound { left, right } => {
            assert_eq!(left, "orders");
            assert_eq!(right, "products");
        }
        other => panic!("expected JoinNotFound, got {other:?}"),
    }
}

#[test]
fn explicit_join_predicate_needs_no_snapshot() {
    let compiled = compile(
        &request(json!({
            "table": "orders",
            "joins": [{
                "table": "products",
                "join_type": "left",
                "on": {"left": "orders.product_id", "right": "product_id"}
            }]
        })),
        None,
        &PostgresDialect,
    )
    .unwrap();
    assert!(compiled.sql.contains(
        "LEFT JOIN \"products\" ON (\"orders\".\"product_id\" = \"products\".\"product_id\")"
    ));
}

#[test]
fn discovered_join_without_snapshot_is_rejected() {
    let err = compile(
        &request(json!({"table": "orders", "joins": [{"table": "customers"}]})),
        None,
        &PostgresDialect,
    )
    .unwrap_err();
    assert!(matches!(err, CanvasqlError::Validation(_)));
}

// ============================================================================
// Identifier validation
// ============================================================================

#[test]
fn unknown_table_is_reported() {
    let err = compile_err(json!({"table": "invoices"}));
    assert!(matches!(err, CanvasqlError::UnknownTable(ref t) if t == "invoices"));

    let err = compile_err(json!({"table": "orders", "joins": [{"table": "invoices"}]}));
    assert!(matches!(err, CanvasqlError::UnknownTable(ref t) if t == "invoices"));
}

#[test]
fn unknown_column_is_reported() {
    let err = compile_err(json!({"table": "orders", "dimensions": ["colour"]}));
    match err {
        CanvasqlError::UnknownColumn { table, column } => {
            assert_eq!(table, "orders");
            assert_eq!(column, "colour");
        }
        other => panic!("expected UnknownColumn, got {other:?}"),
    }
}

#[test]
fn qualified_column_outside_the_query_is_unknown_table() {
    let err = compile_err(json!({"table": "orders", "dimensions": ["customers.name"]}));
    assert!(matches!(err, CanvasqlError::UnknownTable(ref t) if t == "customers"));
}

#[test]
fn mixed_case_catalog_names_render_as_spelled() {
    let meta = SchemaMetadata::builder()
        .typed_table("ShopDB__Orders", &[("id", "int4"), ("CustomerId", "int4")])
        .typed_table("ShopDB__Customers", &[("CustomerId", "int4"), ("Name", "text")])
        .primary_key("ShopDB__Customers", &["CustomerId"])
        .build();
    let compiled = compile(
        &request(json!({
            "table": "shopdb__orders",
            "dimensions": ["shopdb__customers.name"],
            "metrics": ["id|COUNT"],
            "joins": [{"table": "SHOPDB__CUSTOMERS"}]
        })),
        Some(&meta),
        &PostgresDialect,
    )
    .unwrap();
    assert_eq!(
        compiled.sql,
        "SELECT \"ShopDB__Customers\".\"Name\", COUNT(\"id\") AS \"count_id\" \
         FROM \"ShopDB__Orders\" JOIN \"ShopDB__Customers\" \
         ON (\"ShopDB__Orders\".\"CustomerId\" = \"ShopDB__Customers\".\"CustomerId\") \
         GROUP BY \"ShopDB__Customers\".\"Name\" ORDER BY \"ShopDB__Customers\".\"Name\" ASC"
    );
}

#[test]
fn malformed_reference_is_a_validation_error() {
    let err = compile_err(json!({"table": "orders", "dimensions": ["public.orders.region"]}));
    assert!(matches!(err, CanvasqlError::Validation(_)));
}

// ============================================================================
// Granularity
// ============================================================================

#[test]
fn monthly_granularity_buckets_and_orders_by_period() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "metrics": ["amount|SUM"],
        "granularity": "monthly",
        "dateColumn": "created_at"
    }));
    let trunc = "DATE_TRUNC('month', \"orders\".\"created_at\")";
    let label = format!("TRIM(TO_CHAR({trunc}, 'YYYY-Month'))");
    assert_eq!(
        compiled.sql,
        format!(
            "SELECT {label} AS \"period_label\", {trunc} AS \"month_start\", \
             SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
             GROUP BY {trunc}, {label} ORDER BY \"month_start\" ASC"
        )
    );
}

#[test]
fn bucketed_date_dimension_is_not_grouped_twice() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["created_at", "region"],
        "metrics": ["amount|SUM"],
        "granularity": "daily",
        "date_filter_details": {"column": "orders.created_at"},
        "display_format": "month_name"
    }));
    let trunc = "DATE_TRUNC('day', \"orders\".\"created_at\")";
    assert_eq!(
        compiled.sql,
        format!(
            "SELECT TO_CHAR({trunc}, 'YYYY-Mon-DD') AS \"period_label\", {trunc} AS \"day_start\", \
             \"region\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
             GROUP BY {trunc}, TO_CHAR({trunc}, 'YYYY-Mon-DD'), \"region\" \
             ORDER BY \"day_start\" ASC"
        )
    );
}

#[test]
fn weekly_label_defaults_to_iso_week() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "metrics": ["amount|SUM"],
        "granularity": "weekly",
        "dateColumn": "created_at"
    }));
    assert!(compiled
        .sql
        .starts_with("SELECT TO_CHAR(DATE_TRUNC('week', \"orders\".\"created_at\"), 'IYYY-\"Week\"-IW')"));
    assert!(compiled.sql.contains("AS \"week_start\""));
}

#[test]
fn asis_granularity_ignores_date_column() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "granularity": "asis",
        "dateColumn": "created_at"
    }));
    assert!(!compiled.sql.contains("DATE_TRUNC"));
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn filters_bind_parameters_cast_to_catalog_types() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "dimensions": ["region"],
        "metrics": ["amount|SUM"],
        "filters": [
            {"column": "region", "operator": "=", "value": "EU"},
            {"column": "amount", "operator": "between", "value": [10, 20],
             "logic": "or", "mode": "exclude"}
        ]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT \"region\", SUM(\"amount\") AS \"sum_amount\" FROM \"orders\" \
         WHERE ((\"region\" = CAST($1 AS \"varchar\")) OR \
         (\"amount\" NOT BETWEEN CAST($2 AS \"numeric\") AND CAST($3 AS \"numeric\"))) \
         GROUP BY \"region\" ORDER BY \"region\" ASC"
    );
    assert_eq!(compiled.params, vec!["EU", "10", "20"]);
    assert!(compiled.rendered_sql.contains(
        "WHERE ((\"region\" = CAST('EU' AS \"varchar\")) OR \
         (\"amount\" NOT BETWEEN CAST('10' AS \"numeric\") AND CAST('20' AS \"numeric\")))"
    ));
}

#[test]
fn like_filter_is_not_cast_and_exclude_negates() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "filters": [
            {"column": "region", "operator": "like", "value": "north"},
            {"column": "customer_id", "operator": "!=", "value": 7, "mode": "exclude"}
        ]
    }));
    assert_eq!(
        compiled.sql,
        "SELECT 1 AS \"placeholder\" FROM \"orders\" WHERE ((\"region\" LIKE $1) AND \
         NOT (\"customer_id\" != CAST($2 AS \"int4\")))"
    );
    assert_eq!(compiled.params, vec!["%north%", "7"]);
}

#[test]
fn incomplete_filters_are_skipped() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "filters": [
            {"column": "region", "operator": "=", "value": null},
            {"operator": "=", "value": "EU"},
            {"column": "", "value": "x"},
            {"column": "region", "operator": "=", "value": ""},
            {"column": "region", "operator": "like", "value": "  "},
            {"column": "amount", "operator": "between", "value": ""}
        ]
    }));
    assert!(!compiled.sql.contains("WHERE"));
    assert!(compiled.params.is_empty());
}

#[test]
fn zero_is_a_real_filter_value() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "filters": [{"column": "amount", "operator": "=", "value": 0}]
    }));
    assert!(compiled.sql.ends_with("WHERE (\"amount\" = CAST($1 AS \"numeric\"))"));
    assert_eq!(compiled.params, vec!["0"]);
}

#[test]
fn filter_values_never_reach_the_sql_text() {
    let compiled = compile_with_schema(json!({
        "table": "orders",
        "filters": [{"column": "region", "value": "x'; DROP TABLE orders; --"}]
    }));
    assert!(!compiled.sql.contains("DROP TABLE"));
    assert_eq!(compiled.params, vec!["x'; DROP TABLE orders; --"]);
    assert!(compiled.rendered_sql.contains("'x''; DROP TABLE orders; --'"));
}

#[test]
fn filter_on_unknown_column_is_rejected() {
    let err = compile_err(json!({
        "table": "orders",
        "filters": [{"column": "status", "value": "paid"}]
    }));
    assert!(matches!(err, CanvasqlError::UnknownColumn { .. }));
}
