//! PostgreSQL dialect implementation.

use crate::sql_ast::Function;

use super::Dialect;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, idx: usize) -> String {
        format!("${}", idx + 1) // PostgreSQL uses $1, $2, ...
    }

    fn render_function(&self, func: &Function, args: Vec<String>) -> String {
        match func {
            Function::DateTrunc(grain) => {
                format!("DATE_TRUNC('{}', {})", grain.as_str(), args.join(", "))
            }
            Function::ToChar { format } => match args.as_slice() {
                [expr] => format!("TO_CHAR({expr}, '{}')", format.replace('\'', "''")),
                _ => "NULL".to_string(),
            },
            Function::Trim => format!("TRIM({})", args.join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_ast::{Aggregation, TimeGrain};

    #[test]
    fn quotes_identifiers_and_escapes_embedded_quotes() {
        let d = PostgresDialect;
        assert_eq!(d.quote_ident("orders"), "\"orders\"");
        assert_eq!(d.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(d.placeholder(0), "$1");
    }

    #[test]
    fn renders_time_functions() {
        let d = PostgresDialect;
        let trunc = d.render_function(
            &Function::DateTrunc(TimeGrain::Week),
            vec!["\"orders\".\"created_at\"".into()],
        );
        assert_eq!(trunc, "DATE_TRUNC('week', \"orders\".\"created_at\")");
        let label = d.render_function(
            &Function::ToChar {
                format: "IYYY-\"Week\"-IW".into(),
            },
            vec![trunc],
        );
        assert!(label.starts_with("TO_CHAR(DATE_TRUNC('week'"));
        assert!(label.ends_with(", 'IYYY-\"Week\"-IW')"));
        assert_eq!(
            d.render_aggregation(&Aggregation::CountDistinct, "\"id\""),
            "COUNT(DISTINCT \"id\")"
        );
        assert_eq!(d.render_cast("$1", "int4"), "CAST($1 AS \"int4\")");
    }
}
