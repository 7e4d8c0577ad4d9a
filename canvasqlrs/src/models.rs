//! Request and response shapes at the API boundary.
//!
//! Payload fields arrive loosely typed (metrics as `"column|AGG"` strings,
//! numeric strings for top-N, filters that may not even be a list). They are
//! normalised into tagged types here so the compiler never sees raw JSON.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::backends::JsonRow;
use crate::error::{CanvasqlError, Result};
use crate::sql_ast::Aggregation;

/// A declarative analytical query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(alias = "tabel")]
    pub table: String,
    #[serde(default, alias = "dimensi", deserialize_with = "null_as_default")]
    pub dimensions: Vec<String>,
    #[serde(default, alias = "metriks", deserialize_with = "null_as_default")]
    pub metrics: Vec<MetricSpec>,
    #[serde(default, alias = "tabel_join", deserialize_with = "null_as_default")]
    pub joins: Vec<JoinSpec>,
    #[serde(default, deserialize_with = "filters_or_empty")]
    pub filters: Vec<FilterDescriptor>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub granularity: Granularity,
    #[serde(default, alias = "dateColumn", skip_serializing_if = "Option::is_none")]
    pub date_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_filter_details: Option<DateFilterDetails>,
    #[serde(
        default,
        rename = "topN",
        alias = "top_n",
        deserialize_with = "positive_count",
        skip_serializing_if = "Option::is_none"
    )]
    pub top_n: Option<u64>,
    #[serde(
        default,
        rename = "topN_metric",
        alias = "top_n_metric",
        skip_serializing_if = "Option::is_none"
    )]
    pub top_n_metric: Option<MetricSpec>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub display_format: DisplayFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DateFilterDetails {
    pub column: Option<String>,
}

impl QueryRequest {
    pub fn from_json(value: Value) -> Result<Self> {
        let request: QueryRequest = serde_json::from_value(value)?;
        request.validate()?;
        Ok(request)
    }

    /// Date column used for bucketing: `date_column`, else `date_filter_details.column`.
    pub fn date_column(&self) -> Option<&str> {
        self.date_column
            .as_deref()
            .or_else(|| {
                self.date_filter_details
                    .as_ref()
                    .and_then(|d| d.column.as_deref())
            })
            .filter(|c| !c.trim().is_empty())
    }

    /// Boundary checks that do not need the schema catalog.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(CanvasqlError::Validation(
                "table name must not be empty".to_string(),
            ));
        }
        for join in &self.joins {
            if join.table.trim().is_empty() {
                return Err(CanvasqlError::Validation(
                    "join table name must not be empty".to_string(),
                ));
            }
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }
}

/// Aggregated column, parsed from `"column|AGGREGATION"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub column: String,
    pub aggregation: Aggregation,
    /// Set when the suffix was not recognised and COUNT was substituted.
    pub fallback: bool,
}

impl MetricSpec {
    pub fn new(column: impl Into<String>, aggregation: Aggregation) -> Self {
        Self {
            column: column.into(),
            aggregation,
            fallback: false,
        }
    }

    pub fn is_star(&self) -> bool {
        self.column.trim() == "*"
    }
}

impl FromStr for MetricSpec {
    type Err = CanvasqlError;

    fn from_str(s: &str) -> Result<Self> {
        let (column, suffix) = match s.split_once('|') {
            Some((c, a)) => (c.trim(), Some(a.trim())),
            None => (s.trim(), None),
        };
        if column.is_empty() {
            return Err(CanvasqlError::Validation(format!(
                "metric '{s}' has no column"
            )));
        }
        let (aggregation, fallback) = match suffix.map(str::to_ascii_uppercase).as_deref() {
            None | Some("") | Some("COUNT") => (Aggregation::Count, false),
            Some("SUM") => (Aggregation::Sum, false),
            Some("AVERAGE") | Some("AVG") => (Aggregation::Avg, false),
            Some("MIN") => (Aggregation::Min, false),
            Some("MAX") => (Aggregation::Max, false),
            Some("COUNT_DISTINCT") => (Aggregation::CountDistinct, false),
            Some(other) => {
                tracing::warn!(
                    metric = %s,
                    aggregation = %other,
                    "unknown aggregation, falling back to COUNT"
                );
                (Aggregation::Count, true)
            }
        };
        Ok(Self {
            column: column.to_string(),
            aggregation,
            fallback,
        })
    }
}

impl fmt::Display for MetricSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let agg = match self.aggregation {
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVERAGE",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Count => "COUNT",
            Aggregation::CountDistinct => "COUNT_DISTINCT",
        };
        write!(f, "{}|{agg}", self.column)
    }
}

impl Serialize for MetricSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MetricSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => s.parse().map_err(de::Error::custom),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    column: String,
                    #[serde(default)]
                    aggregation: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                let raw = match full.aggregation {
                    Some(agg) => format!("{}|{agg}", full.column),
                    None => full.column,
                };
                raw.parse().map_err(de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl FromStr for JoinType {
    type Err = CanvasqlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "INNER" | "JOIN" => Ok(JoinType::Inner),
            "LEFT" | "LEFT OUTER" => Ok(JoinType::Left),
            "RIGHT" | "RIGHT OUTER" => Ok(JoinType::Right),
            "FULL" | "FULL OUTER" | "OUTER" => Ok(JoinType::Full),
            "CROSS" => Ok(JoinType::Cross),
            other => Err(CanvasqlError::Validation(format!(
                "unsupported join type '{other}'"
            ))),
        }
    }
}

impl Serialize for JoinType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let name = match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
            JoinType::Full => "FULL",
            JoinType::Cross => "CROSS",
        };
        serializer.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for JoinType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Explicit join predicate, bypassing key discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOn {
    /// Column on an already-joined table, `table.column`.
    pub left: String,
    /// Column on the joined table, `table.column` or bare `column`.
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    #[serde(alias = "tabel")]
    pub table: String,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<JoinOn>,
}

impl JoinSpec {
    pub fn new(table: impl Into<String>, join_type: JoinType) -> Self {
        Self {
            table: table.into(),
            join_type,
            on: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    #[default]
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(alias = "LIKE")]
    Like,
    #[serde(alias = "BETWEEN")]
    Between,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLogic {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    #[serde(alias = "INCLUDE")]
    Include,
    #[serde(alias = "EXCLUDE")]
    Exclude,
}

/// One filter row as a rule-builder UI submits it. Rows with no column or
/// no value are kept here and skipped by the filter builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub logic: FilterLogic,
    #[serde(default)]
    pub mode: FilterMode,
}

impl FilterDescriptor {
    pub fn new(column: &str, operator: FilterOperator, value: Value) -> Self {
        Self {
            column: Some(column.to_string()),
            operator,
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn or(mut self) -> Self {
        self.logic = FilterLogic::Or;
        self
    }

    pub fn exclude(mut self) -> Self {
        self.mode = FilterMode::Exclude;
        self
    }

    /// True when the row is incomplete and contributes nothing: no column,
    /// or a missing, null or empty-string value.
    pub fn is_blank(&self) -> bool {
        let no_column = self
            .column
            .as_deref()
            .map(|c| c.trim().is_empty())
            .unwrap_or(true);
        let no_value = match &self.value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        no_column || no_value
    }

    fn validate(&self) -> Result<()> {
        if self.is_blank() {
            return Ok(());
        }
        let column = self.column.as_deref().unwrap_or_default();
        match (&self.operator, &self.value) {
            (FilterOperator::Between, Some(Value::Array(items))) => {
                if items.len() != 2 || items.iter().any(|v| !is_scalar(v)) {
                    return Err(CanvasqlError::Validation(format!(
                        "between filter on '{column}' needs exactly two values"
                    )));
                }
            }
            (FilterOperator::Between, _) => {
                return Err(CanvasqlError::Validation(format!(
                    "between filter on '{column}' needs a [low, high] array"
                )));
            }
            (_, Some(v)) if !is_scalar(v) => {
                return Err(CanvasqlError::Validation(format!(
                    "filter on '{column}' needs a single value"
                )));
            }
            _ => {}
        }
        Ok(())
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Text form of a scalar filter value, as bound to a parameter.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    #[serde(alias = "ASIS", alias = "")]
    Asis,
    #[serde(alias = "DAILY")]
    Daily,
    #[serde(alias = "WEEKLY")]
    Weekly,
    #[serde(alias = "MONTHLY")]
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayFormat {
    WeekNumber,
    MonthName,
    Year,
    Original,
    #[default]
    #[serde(other)]
    Auto,
}

/// Successful query result.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub message: String,
    pub data: Vec<JsonRow>,
    /// Statement with parameters substituted, for display only.
    pub query: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn filters_or_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<FilterDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter(Value::is_object)
            .map(|item| FilterDescriptor::deserialize(item).map_err(de::Error::custom))
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn positive_count<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let n = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 1.0).map(|f| f as u64)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| *f >= 1.0)
            .map(|f| f as u64),
        _ => None,
    };
    Ok(n.filter(|n| *n > 0))
}
