//! Row decoding and cursors for the sql backend.

use crate::db::context::Context;
use crate::db::traits::Rows;
use crate::db::types::{TypeCategory, categorize_type, decode_numeric};
use crate::error::{DatabaseError, DbResult, ErrorKind};
use crate::models::{Record, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgRow, PgValueFormat, PgValueRef};
use sqlx::{Column, Decode, Postgres, Row as _, Type, TypeInfo, ValueRef};

fn cell<'r, T, F>(row: &'r PgRow, idx: usize, f: F) -> Result<Value, sqlx::Error>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
    F: FnOnce(T) -> Value,
{
    Ok(row.try_get::<Option<T>, _>(idx)?.map_or(Value::Null, f))
}

/// NUMERIC in either wire format, rendered as its exact decimal string.
fn numeric_text(value: PgValueRef<'_>) -> Result<String, String> {
    let bytes = value.as_bytes().map_err(|e| e.to_string())?;
    match value.format() {
        PgValueFormat::Binary => decode_numeric(bytes),
        PgValueFormat::Text => std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| e.to_string()),
    }
}

fn raw_cell(value: PgValueRef<'_>) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let bytes = value.as_bytes().map_err(|e| e.to_string())?;
    Ok(match std::str::from_utf8(bytes) {
        Ok(text) => Value::Text(text.to_string()),
        Err(_) => Value::Bytes(bytes.to_vec()),
    })
}

/// Decode one column of `row`.
pub(crate) fn decode_value(row: &PgRow, idx: usize) -> DbResult<Value> {
    let column = &row.columns()[idx];
    let type_name = column.type_info().name();
    let decoded = match categorize_type(type_name) {
        _ if type_name == "OID" => cell(row, idx, |v: Oid| Value::Int(v.0.into())),
        TypeCategory::SmallInt => cell(row, idx, |v: i16| Value::Int(v.into())),
        TypeCategory::Integer => cell(row, idx, |v: i32| Value::Int(v.into())),
        TypeCategory::BigInt => cell(row, idx, Value::Int),
        TypeCategory::Real => cell(row, idx, |v: f32| Value::Float(v.into())),
        TypeCategory::Double => cell(row, idx, Value::Float),
        TypeCategory::Boolean => cell(row, idx, Value::Bool),
        TypeCategory::Text => cell(row, idx, Value::Text),
        TypeCategory::Binary => cell(row, idx, Value::Bytes),
        TypeCategory::Json => cell(row, idx, Value::Json),
        TypeCategory::Uuid => cell(row, idx, Value::Uuid),
        TypeCategory::TimestampTz => cell(row, idx, |v: DateTime<Utc>| Value::Timestamp(v)),
        TypeCategory::Timestamp => cell(row, idx, |v: NaiveDateTime| Value::Timestamp(v.and_utc())),
        TypeCategory::Date => cell(row, idx, |v: NaiveDate| Value::Text(v.to_string())),
        TypeCategory::Time => cell(row, idx, |v: NaiveTime| Value::Text(v.to_string())),
        category @ (TypeCategory::Decimal | TypeCategory::Unknown) => {
            let raw = row.try_get_raw(idx).map_err(DatabaseError::from)?;
            let decoded = if category == TypeCategory::Decimal {
                if raw.is_null() {
                    Ok(Value::Null)
                } else {
                    numeric_text(raw).map(Value::Text)
                }
            } else {
                raw_cell(raw)
            };
            return decoded.map_err(|e| {
                DatabaseError::invalid_data(format!("column '{}' ({type_name}): {e}", column.name()))
            });
        }
    };
    decoded.map_err(|e| {
        let message = format!("column '{}' ({type_name}): {e}", column.name());
        DatabaseError::with_source(ErrorKind::InvalidData, message, e)
    })
}

pub(crate) fn row_to_record(row: &PgRow) -> DbResult<Record> {
    let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values = (0..row.len())
        .map(|idx| decode_value(row, idx))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Record::new(columns, values))
}

/// Streaming cursor over a sqlx row stream. The stream borrows the
/// connection, so the connection is busy until the cursor is dropped.
pub struct SqlRows<'a> {
    ctx: Context,
    stream: Option<BoxStream<'a, Result<PgRow, sqlx::Error>>>,
    columns: Vec<String>,
    current: Option<PgRow>,
    err: Option<DatabaseError>,
}

impl<'a> SqlRows<'a> {
    pub(crate) fn new(
        ctx: Context,
        stream: BoxStream<'a, Result<PgRow, sqlx::Error>>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            ctx,
            stream: Some(stream),
            columns,
            current: None,
            err: None,
        }
    }

    fn finish(&mut self, err: Option<DatabaseError>) -> bool {
        self.err = err;
        self.current = None;
        self.stream = None;
        false
    }
}

#[async_trait]
impl Rows for SqlRows<'_> {
    async fn next(&mut self) -> bool {
        let ctx = &self.ctx;
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let fetched = ctx
            .run("fetch row", async { Ok(stream.next().await) })
            .await;
        match fetched {
            Ok(Some(Ok(row))) => {
                self.current = Some(row);
                true
            }
            Ok(Some(Err(err))) => self.finish(Some(err.into())),
            Ok(None) => self.finish(None),
            Err(err) => self.finish(Some(err)),
        }
    }

    fn scan(&self) -> DbResult<Record> {
        match &self.current {
            Some(row) => row_to_record(row),
            None => Err(DatabaseError::invalid_data("no current row")),
        }
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn raw_values(&self) -> Option<Vec<Option<&[u8]>>> {
        let row = self.current.as_ref()?;
        (0..row.len())
            .map(|idx| {
                let value = row.try_get_raw(idx).ok()?;
                if value.is_null() {
                    Some(None)
                } else {
                    value.as_bytes().ok().map(Some)
                }
            })
            .collect()
    }

    async fn close(&mut self) {
        self.current = None;
        self.stream = None;
    }

    fn err(&self) -> Option<&DatabaseError> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<DatabaseError> {
        self.err.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn row_stream(results: Vec<Result<PgRow, sqlx::Error>>) -> BoxStream<'static, Result<PgRow, sqlx::Error>> {
        stream::iter(results).boxed()
    }

    #[tokio::test]
    async fn test_empty_cursor() {
        let mut rows = SqlRows::new(Context::background(), row_stream(Vec::new()), vec!["id".into()]);
        assert_eq!(rows.columns(), ["id".to_string()]);
        assert!(!rows.next().await);
        assert!(rows.err().is_none());
        assert!(rows.raw_values().is_none());
        assert_eq!(rows.scan().unwrap_err().kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_cursor_error_ends_iteration() {
        let mut rows = SqlRows::new(
            Context::background(),
            row_stream(vec![Err(sqlx::Error::PoolClosed)]),
            Vec::new(),
        );
        assert!(!rows.next().await);
        assert_eq!(rows.err().unwrap().kind(), ErrorKind::ConnectionFailed);
        assert!(!rows.next().await);
        assert!(rows.take_err().is_some());
        assert!(rows.err().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_cursor() {
        let (ctx, token) = Context::background().with_cancel();
        token.cancel();
        let mut rows = SqlRows::new(ctx, stream::pending().boxed(), Vec::new());
        assert!(!rows.next().await);
        assert_eq!(rows.err().unwrap().kind(), ErrorKind::Cancelled);
    }
}
