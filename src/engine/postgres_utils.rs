//! PostgreSQL driver helpers

use bigdecimal::BigDecimal;
use lumen_core::{ColumnInfo, LumenError, Row as LRow, Value};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use uuid::Uuid;

pub(crate) const SQLSTATE_INVALID_PASSWORD: &str = "28P01";
pub(crate) const SQLSTATE_INVALID_AUTHORIZATION: &str = "28000";
pub(crate) const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Bind a Value to a Postgres query.
///
/// Statements cast every placeholder to its column type, so the wire type only
/// has to be castable: arrays travel as array literals.
pub(crate) fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
        Value::Json(j) => query.bind(j),
        Value::Array(items) => query.bind(array_literal(items)),
    }
}

/// `{a,"b c",NULL}` form of an array value.
pub(crate) fn array_literal(items: &[Value]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => quote_array_element(s),
            Value::Json(j) => quote_array_element(&j.to_string()),
            Value::Bytes(b) => quote_array_element(&format!("\\x{}", hex::encode(b))),
            Value::Array(inner) => array_literal(inner),
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

fn quote_array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Converts a SQLx row to the universal Row type
pub(crate) fn convert_row(pg_row: &PgRow) -> LRow {
    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .map(|col| extract_value(pg_row, col.ordinal()))
        .collect();

    LRow { values }
}

/// Extracts a value from a PgRow at the given index
pub(crate) fn extract_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(float_value).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| float_value(f64::from(f))).unwrap_or(Value::Null);
    }
    // NUMERIC keeps its exact digits; it goes back through a cast on write.
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<BigDecimal>, _>(idx) {
        return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Uuid>, _>(idx) {
        return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::Text(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<i64>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, Value::Int))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<i32>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, |i| Value::Int(i64::from(i))))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<f64>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, float_value))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<bool>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, Value::Bool))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<String>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, Value::Text))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<Option<Uuid>>>, _>(idx) {
        return v
            .map(|vals| optional_array(vals, |u| Value::Text(u.to_string())))
            .unwrap_or(Value::Null);
    }

    // Enums, ranges, network and geometric types: the binary form of most of
    // these is not text, so only accept valid UTF-8.
    if let Ok(raw) = row.try_get_raw(idx) {
        if raw.is_null() {
            return Value::Null;
        }
        if let Ok(text) = raw.as_str() {
            return Value::Text(text.to_string());
        }
    }
    Value::Null
}

fn float_value(f: f64) -> Value {
    if f.is_finite() {
        Value::Float(f)
    } else {
        Value::Text(f.to_string())
    }
}

fn optional_array<T>(values: Vec<Option<T>>, convert: impl Fn(T) -> Value) -> Value {
    Value::Array(
        values
            .into_iter()
            .map(|item| item.map(&convert).unwrap_or(Value::Null))
            .collect(),
    )
}

/// Gets column info from a PgRow
pub(crate) fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
    column_info(row.columns())
}

pub(crate) fn column_info<C: Column>(columns: &[C]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            data_type: col.type_info().name().to_string(),
        })
        .collect()
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn server_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

fn is_transport(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_)
    )
}

/// Errors raised while establishing a connection.
pub(crate) fn map_connect_error(err: sqlx::Error, username: &str, database: &str) -> LumenError {
    let cause = Some(server_message(&err));
    match sqlstate(&err).as_deref() {
        Some(SQLSTATE_INVALID_PASSWORD) => LumenError::auth_failed(username, cause),
        Some(SQLSTATE_INVALID_AUTHORIZATION) | Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) => {
            LumenError::permission_denied(
                format!("role {} may not connect to {}", username, database),
                cause,
            )
        }
        _ if server_message(&err).contains("password authentication failed") => {
            LumenError::auth_failed(username, cause)
        }
        _ => LumenError::connection_failed(format!("could not connect to {}", database), cause),
    }
}

/// Errors raised by a statement on an open connection.
pub(crate) fn map_query_error(err: sqlx::Error) -> LumenError {
    let cause = Some(server_message(&err));
    if is_transport(&err) {
        return LumenError::connection_failed("connection lost", cause);
    }
    match sqlstate(&err).as_deref() {
        Some(SQLSTATE_INSUFFICIENT_PRIVILEGE) => {
            LumenError::permission_denied("insufficient privilege", cause)
        }
        _ => LumenError::query_failed("statement failed", cause),
    }
}
