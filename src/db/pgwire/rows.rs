//! Row decoding and streaming cursors for the wire backend.

use crate::db::context::Context;
use crate::db::traits::Rows;
use crate::db::types::{TypeCategory, categorize_type, decode_numeric};
use crate::error::{DatabaseError, DbResult, ErrorKind};
use crate::models::{Record, Value};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures_util::StreamExt;
use std::error::Error;
use std::pin::Pin;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Row, RowStream};

/// Column bytes exactly as received, for any type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawValue<'a>(pub(crate) &'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn cell<'a, T, F>(row: &'a Row, idx: usize, f: F) -> Result<Value, tokio_postgres::Error>
where
    T: FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    Ok(row.try_get::<_, Option<T>>(idx)?.map_or(Value::Null, f))
}

/// Decode one column of `row`.
pub(crate) fn decode_value(row: &Row, idx: usize) -> DbResult<Value> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let decoded = match categorize_type(ty.name()) {
        // "char" is a single byte, unlike bpchar
        _ if *ty == Type::CHAR => cell(row, idx, |v: i8| {
            Value::Text(char::from(v as u8).to_string())
        }),
        _ if *ty == Type::OID => cell(row, idx, |v: u32| Value::Int(v.into())),
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
        TypeCategory::TimestampTz => cell(row, idx, Value::Timestamp),
        TypeCategory::Timestamp => cell(row, idx, |v: NaiveDateTime| Value::Timestamp(v.and_utc())),
        TypeCategory::Date => cell(row, idx, |v: NaiveDate| Value::Text(v.to_string())),
        TypeCategory::Time => cell(row, idx, |v: NaiveTime| Value::Text(v.to_string())),
        TypeCategory::Decimal => {
            let raw = row
                .try_get::<_, Option<RawValue>>(idx)
                .map_err(DatabaseError::from)?;
            return match raw {
                None => Ok(Value::Null),
                Some(RawValue(bytes)) => decode_numeric(bytes).map(Value::Text).map_err(|e| {
                    DatabaseError::invalid_data(format!("column '{}': {e}", column.name()))
                }),
            };
        }
        TypeCategory::Unknown => cell(row, idx, |RawValue(bytes)| {
            match std::str::from_utf8(bytes) {
                Ok(text) => Value::Text(text.to_string()),
                Err(_) => Value::Bytes(bytes.to_vec()),
            }
        }),
    };
    decoded.map_err(|e| {
        let message = format!("column '{}' ({}): {e}", column.name(), ty.name());
        DatabaseError::with_source(ErrorKind::InvalidData, message, e)
    })
}

pub(crate) fn column_names(row: &Row) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

pub(crate) fn row_to_record(row: &Row) -> DbResult<Record> {
    let values = (0..row.len())
        .map(|idx| decode_value(row, idx))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Record::new(column_names(row), values))
}

/// Streaming cursor over a [`RowStream`]. Each fetch races the query
/// context.
pub struct WireRows {
    ctx: Context,
    stream: Option<Pin<Box<RowStream>>>,
    columns: Vec<String>,
    current: Option<Row>,
    err: Option<DatabaseError>,
}

impl WireRows {
    pub(crate) fn new(ctx: Context, stream: RowStream, columns: Vec<String>) -> Self {
        Self {
            ctx,
            stream: Some(Box::pin(stream)),
            columns,
            current: None,
            err: None,
        }
    }

    fn fail(&mut self, err: DatabaseError) -> bool {
        self.err = Some(err);
        self.current = None;
        self.stream = None;
        false
    }
}

#[async_trait]
impl Rows for WireRows {
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
            Ok(Some(Err(err))) => self.fail(err.into()),
            Ok(None) => {
                self.current = None;
                self.stream = None;
                false
            }
            Err(err) => self.fail(err),
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
                row.try_get::<_, Option<RawValue>>(idx)
                    .ok()
                    .map(|raw| raw.map(|RawValue(bytes)| bytes))
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

    #[test]
    fn test_raw_value_accepts_everything() {
        assert!(<RawValue as FromSql>::accepts(&Type::NUMERIC));
        assert!(<RawValue as FromSql>::accepts(&Type::INET));
        let raw = RawValue::from_sql(&Type::TEXT, b"abc").unwrap();
        assert_eq!(raw.0, b"abc");
    }
}
