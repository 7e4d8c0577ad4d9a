//! SQL dialect abstraction.
//!
//! The query builder produces a dialect-neutral AST; a dialect maps its
//! leaves (identifiers, literals, functions, aggregates) to SQL fragments.

use crate::sql_ast::{Aggregation, Function};

mod postgres;
pub use postgres::PostgresDialect;

/// Dialects render identifiers and primitive expression pieces.
/// Expression tree walking lives in `SqlRenderer`.
pub trait Dialect: Send + Sync {
    fn quote_ident(&self, ident: &str) -> String;
    fn placeholder(&self, idx: usize) -> String;
    fn render_function(&self, func: &Function, args: Vec<String>) -> String;
    fn render_cast(&self, expr: &str, type_name: &str) -> String {
        format!("CAST({expr} AS {})", self.quote_ident(type_name))
    }
    fn render_aggregation(&self, agg: &Aggregation, expr: &str) -> String {
        match agg {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Avg => format!("AVG({expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
        }
    }
    fn render_literal(&self, value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => "NULL".to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            serde_json::Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            serde_json::Value::Object(_) => {
                format!("'{}'", value.to_string().replace('\'', "''"))
            }
        }
    }
}
