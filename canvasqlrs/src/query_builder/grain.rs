use crate::models::{DisplayFormat, Granularity};
use crate::sql_ast::{Function, OrderItem, SelectItem, SortDirection, SqlExpr, TimeGrain};

pub(crate) const LABEL_ALIAS: &str = "period_label";

/// Select items, grouping and ordering contributed by time bucketing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Bucket {
    pub select: Vec<SelectItem>,
    pub group_by: Vec<SqlExpr>,
    pub order_by: OrderItem,
}

pub(crate) fn time_grain(granularity: Granularity) -> Option<TimeGrain> {
    match granularity {
        Granularity::Asis => None,
        Granularity::Daily => Some(TimeGrain::Day),
        Granularity::Weekly => Some(TimeGrain::Week),
        Granularity::Monthly => Some(TimeGrain::Month),
    }
}

pub(crate) fn period_alias(grain: TimeGrain) -> &'static str {
    match grain {
        TimeGrain::Day => "day_start",
        TimeGrain::Week => "week_start",
        TimeGrain::Month => "month_start",
    }
}

/// `TO_CHAR` pattern for the period label. Monthly labels are trimmed
/// because `Month` pads names to nine characters.
pub(crate) fn label_format(grain: TimeGrain, display: DisplayFormat) -> (&'static str, bool) {
    match (grain, display) {
        (TimeGrain::Day, DisplayFormat::WeekNumber) => ("IYYY-\"Week\"-IW", false),
        (TimeGrain::Day, DisplayFormat::MonthName) => ("YYYY-Mon-DD", false),
        (TimeGrain::Day, _) => ("YYYY-MM-DD", false),
        (
            TimeGrain::Week,
            DisplayFormat::MonthName | DisplayFormat::Year | DisplayFormat::Original,
        ) => ("YYYY-MM-DD", false),
        (TimeGrain::Week, _) => ("IYYY-\"Week\"-IW", false),
        (TimeGrain::Month, DisplayFormat::Original) => ("YYYY-MM", true),
        (TimeGrain::Month, _) => ("YYYY-Month", true),
    }
}

pub(crate) fn bucket(grain: TimeGrain, display: DisplayFormat, date_expr: SqlExpr) -> Bucket {
    let truncated = SqlExpr::Function {
        func: Function::DateTrunc(grain),
        args: vec![date_expr],
    };
    let (format, trim) = label_format(grain, display);
    let mut label = SqlExpr::Function {
        func: Function::ToChar {
            format: format.to_string(),
        },
        args: vec![truncated.clone()],
    };
    if trim {
        label = SqlExpr::Function {
            func: Function::Trim,
            args: vec![label],
        };
    }
    let alias = period_alias(grain);

    Bucket {
        select: vec![
            SelectItem {
                expr: label.clone(),
                alias: Some(LABEL_ALIAS.to_string()),
            },
            SelectItem {
                expr: truncated.clone(),
                alias: Some(alias.to_string()),
            },
        ],
        group_by: vec![truncated, label],
        order_by: OrderItem {
            expr: SqlExpr::Alias(alias.to_string()),
            direction: SortDirection::Asc,
        },
    }
}
