//! PostgreSQL row decoding into [`SourceValue`]s.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{Column, Decode, Postgres, Row as _, Type, TypeInfo};
use uuid::Uuid;

use rowbus_core::{Row, SourceValue};

use crate::error::StoreError;

/// Column names of a result row, in select-list order.
pub fn column_names(row: &PgRow) -> Arc<[String]> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<Option<T>, sqlx::Error>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(index)
}

fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<SourceValue, sqlx::Error> {
    let value = match type_name {
        "BOOL" => get::<bool>(row, index)?.map(SourceValue::Bool),
        "\"CHAR\"" => get::<i8>(row, index)?.map(|v| SourceValue::Int(v.into())),
        "INT2" => get::<i16>(row, index)?.map(|v| SourceValue::Int(v.into())),
        "INT4" => get::<i32>(row, index)?.map(|v| SourceValue::Int(v.into())),
        "INT8" => get::<i64>(row, index)?.map(SourceValue::Int),
        "FLOAT4" => get::<f32>(row, index)?.map(|v| SourceValue::Float(v.into())),
        "FLOAT8" => get::<f64>(row, index)?.map(SourceValue::Float),
        "NUMERIC" => get::<BigDecimal>(row, index)?.map(|v| SourceValue::Decimal(v.to_string())),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            get::<String>(row, index)?.map(SourceValue::Text)
        }
        "JSON" | "JSONB" => get::<serde_json::Value>(row, index)?.map(SourceValue::Json),
        "DATE" => get::<NaiveDate>(row, index)?.map(SourceValue::Date),
        "TIME" => get::<NaiveTime>(row, index)?.map(SourceValue::Time),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index)?.map(SourceValue::Timestamp),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index)?.map(SourceValue::TimestampTz),
        "UUID" => get::<Uuid>(row, index)?.map(SourceValue::Uuid),
        "BYTEA" => get::<Vec<u8>>(row, index)?.map(SourceValue::Bytes),
        // Enums, domains over text and similar arrive as UTF-8 text.
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)?
            .map(SourceValue::Text),
    };
    Ok(value.unwrap_or(SourceValue::Null))
}

/// Decode every column of `row`. `columns` is shared across the result set.
pub fn decode_row(row: &PgRow, columns: Arc<[String]>) -> Result<Row, StoreError> {
    let values = row
        .columns()
        .iter()
        .map(|column| {
            let type_name = column.type_info().name();
            decode_value(row, column.ordinal(), type_name).map_err(|e| StoreError::Decode {
                column: column.name().to_string(),
                reason: format!("{type_name}: {e}"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(columns, values))
}
