//! Source column metadata → warehouse column definition.

use std::fmt;

use serde::Serialize;

use super::SourceColumn;

const DEFAULT_NUMERIC_PRECISION: u32 = 10;
const DEFAULT_NUMERIC_SCALE: u32 = 2;
const MAX_VARCHAR_LENGTH: u32 = 255;
const DEFAULT_CHAR_LENGTH: u32 = 255;

/// Warehouse column type. Renders to PostgreSQL DDL through `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    SmallInt,
    Integer,
    BigInt,
    Numeric { precision: u32, scale: u32 },
    Real,
    DoublePrecision,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Boolean,
    Json,
    Jsonb,
    Uuid,
    Inet,
    Varchar(u32),
    Char(u32),
    Text,
}

impl DestinationType {
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            DestinationType::Date
                | DestinationType::Time
                | DestinationType::TimeTz
                | DestinationType::Timestamp
                | DestinationType::TimestampTz
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DestinationType::SmallInt
                | DestinationType::Integer
                | DestinationType::BigInt
                | DestinationType::Numeric { .. }
                | DestinationType::Real
                | DestinationType::DoublePrecision
        )
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            DestinationType::Varchar(_) | DestinationType::Char(_) | DestinationType::Text
        )
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationType::SmallInt => f.write_str("smallint"),
            DestinationType::Integer => f.write_str("integer"),
            DestinationType::BigInt => f.write_str("bigint"),
            DestinationType::Numeric { precision, scale } => {
                write!(f, "numeric({precision},{scale})")
            }
            DestinationType::Real => f.write_str("real"),
            DestinationType::DoublePrecision => f.write_str("double precision"),
            DestinationType::Date => f.write_str("date"),
            DestinationType::Time => f.write_str("time"),
            DestinationType::TimeTz => f.write_str("timetz"),
            DestinationType::Timestamp => f.write_str("timestamp"),
            DestinationType::TimestampTz => f.write_str("timestamptz"),
            DestinationType::Boolean => f.write_str("boolean"),
            DestinationType::Json => f.write_str("json"),
            DestinationType::Jsonb => f.write_str("jsonb"),
            DestinationType::Uuid => f.write_str("uuid"),
            DestinationType::Inet => f.write_str("inet"),
            DestinationType::Varchar(n) => write!(f, "varchar({n})"),
            DestinationType::Char(n) => write!(f, "char({n})"),
            DestinationType::Text => f.write_str("text"),
        }
    }
}

/// A source column after type mapping. `fallback` is set when the source
/// type was not recognised and the column degraded to `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedColumn {
    pub name: String,
    pub dest: DestinationType,
    pub nullable: bool,
    pub fallback: bool,
}

fn positive(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok()).filter(|v| *v > 0)
}

/// Map a source type name to its warehouse type. Returns `None` for types
/// with no dedicated mapping.
pub fn destination_type(
    source_type: &str,
    max_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> Option<DestinationType> {
    let normalized = source_type.trim().to_ascii_lowercase();
    let ty = match normalized.as_str() {
        "smallint" | "int2" => DestinationType::SmallInt,
        "integer" | "int" | "int4" => DestinationType::Integer,
        "bigint" | "int8" => DestinationType::BigInt,
        "numeric" | "decimal" => {
            let precision = positive(precision).unwrap_or(DEFAULT_NUMERIC_PRECISION);
            let scale = scale
                .and_then(|s| u32::try_from(s).ok())
                .unwrap_or(DEFAULT_NUMERIC_SCALE)
                .min(precision);
            DestinationType::Numeric { precision, scale }
        }
        "real" | "float4" => DestinationType::Real,
        "double precision" | "float8" => DestinationType::DoublePrecision,
        "money" => DestinationType::Numeric {
            precision: 19,
            scale: 4,
        },
        "date" => DestinationType::Date,
        "time" | "time without time zone" => DestinationType::Time,
        "timetz" | "time with time zone" => DestinationType::TimeTz,
        "timestamp" | "timestamp without time zone" => DestinationType::Timestamp,
        "timestamptz" | "timestamp with time zone" => DestinationType::TimestampTz,
        "boolean" | "bool" => DestinationType::Boolean,
        "json" => DestinationType::Json,
        "jsonb" => DestinationType::Jsonb,
        "uuid" => DestinationType::Uuid,
        "inet" => DestinationType::Inet,
        "character varying" | "varchar" => match positive(max_length) {
            Some(n) if n <= MAX_VARCHAR_LENGTH => DestinationType::Varchar(n),
            _ => DestinationType::Text,
        },
        "character" | "char" | "bpchar" => {
            DestinationType::Char(positive(max_length).unwrap_or(DEFAULT_CHAR_LENGTH))
        }
        "text" => DestinationType::Text,
        _ => return None,
    };
    Some(ty)
}

/// Map one source column. Unknown types degrade to `text` with a warning.
pub fn map_column(column: &SourceColumn) -> MappedColumn {
    let (dest, fallback) = match destination_type(
        &column.source_type,
        column.max_length,
        column.precision,
        column.scale,
    ) {
        Some(dest) => (dest, false),
        None => {
            tracing::warn!(
                column = %column.name,
                source_type = %column.source_type,
                "unrecognised source type, mapping to text"
            );
            (DestinationType::Text, true)
        }
    };
    MappedColumn {
        name: column.name.clone(),
        dest,
        nullable: column.nullable,
        fallback,
    }
}

pub fn map_columns(columns: &[SourceColumn]) -> Vec<MappedColumn> {
    columns.iter().map(map_column).collect()
}
