//! Parameter binding for the wire backend.
//!
//! [`WireParam`] accepts every server type and encodes the [`Value`] to the
//! type the server inferred for the placeholder, so untyped NULLs and
//! integers bound to NUMERIC or SMALLINT columns work without casts.

use crate::db::types::{TypeCategory, categorize_type, encode_numeric};
use crate::models::Value;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::error::Error;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

type BoxError = Box<dyn Error + Sync + Send>;

#[derive(Debug)]
pub(crate) struct WireParam<'a>(pub(crate) &'a Value);

/// Wrap `args` for binding.
pub(crate) fn bind_params(args: &[Value]) -> Vec<WireParam<'_>> {
    args.iter().map(WireParam).collect()
}

/// Borrow the wrapped parameters as trait objects.
pub(crate) fn as_sql_refs<'a>(params: &'a [WireParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

fn cannot_bind(value: &Value, ty: &Type) -> BoxError {
    format!("cannot bind {} value to a parameter of type {}", value.type_name(), ty).into()
}

fn put_numeric(text: &str, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    out.put_slice(&encode_numeric(text)?);
    Ok(IsNull::No)
}

impl ToSql for WireParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        let category = categorize_type(ty.name());
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => match category {
                TypeCategory::SmallInt => i16::try_from(*i)?.to_sql(ty, out),
                TypeCategory::Integer => i32::try_from(*i)?.to_sql(ty, out),
                TypeCategory::Real => (*i as f32).to_sql(ty, out),
                TypeCategory::Double => (*i as f64).to_sql(ty, out),
                TypeCategory::Decimal => put_numeric(&i.to_string(), out),
                TypeCategory::Text => i.to_string().to_sql(ty, out),
                _ if *ty == Type::OID => u32::try_from(*i)?.to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match category {
                TypeCategory::Real => (*f as f32).to_sql(ty, out),
                TypeCategory::Decimal => put_numeric(&f.to_string(), out),
                TypeCategory::Text => f.to_string().to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => bind_text(s, ty, category, out),
            Value::Bytes(b) => b.as_slice().to_sql(ty, out),
            Value::Json(j) => match category {
                TypeCategory::Text => j.to_string().to_sql(ty, out),
                _ => j.to_sql(ty, out),
            },
            Value::Timestamp(t) => match category {
                TypeCategory::Timestamp => t.naive_utc().to_sql(ty, out),
                TypeCategory::Date => t.date_naive().to_sql(ty, out),
                TypeCategory::Text => t.to_rfc3339().to_sql(ty, out),
                _ => t.to_sql(ty, out),
            },
            Value::Uuid(u) => match category {
                TypeCategory::Text => u.to_string().to_sql(ty, out),
                _ => u.to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Text is the loosest input: parse it into the placeholder's type.
fn bind_text(s: &str, ty: &Type, category: TypeCategory, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match category {
        TypeCategory::SmallInt => s.trim().parse::<i16>()?.to_sql(ty, out),
        TypeCategory::Integer => s.trim().parse::<i32>()?.to_sql(ty, out),
        TypeCategory::BigInt => s.trim().parse::<i64>()?.to_sql(ty, out),
        TypeCategory::Real => s.trim().parse::<f32>()?.to_sql(ty, out),
        TypeCategory::Double => s.trim().parse::<f64>()?.to_sql(ty, out),
        TypeCategory::Decimal => put_numeric(s, out),
        TypeCategory::Boolean => match s.trim().to_ascii_lowercase().as_str() {
            "t" | "true" | "yes" | "on" | "1" => true.to_sql(ty, out),
            "f" | "false" | "no" | "off" | "0" => false.to_sql(ty, out),
            _ => Err(format!("invalid boolean '{s}'").into()),
        },
        TypeCategory::Uuid => uuid::Uuid::parse_str(s.trim())?.to_sql(ty, out),
        TypeCategory::Json => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        TypeCategory::TimestampTz => DateTime::parse_from_rfc3339(s.trim())?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        TypeCategory::Timestamp => s
            .trim()
            .parse::<chrono::NaiveDateTime>()?
            .to_sql(ty, out),
        TypeCategory::Date => s.trim().parse::<NaiveDate>()?.to_sql(ty, out),
        TypeCategory::Time => s.trim().parse::<NaiveTime>()?.to_sql(ty, out),
        TypeCategory::Binary => s.as_bytes().to_sql(ty, out),
        _ if <&str as ToSql>::accepts(ty) => s.to_sql(ty, out),
        _ => Err(cannot_bind(&Value::Text(s.to_string()), ty)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: Value, ty: &Type) -> Result<Option<Vec<u8>>, BoxError> {
        let mut out = BytesMut::new();
        match WireParam(&value).to_sql(ty, &mut out)? {
            IsNull::Yes => Ok(None),
            IsNull::No => Ok(Some(out.to_vec())),
        }
    }

    #[test]
    fn test_null_binds_to_any_type() {
        assert!(WireParam::accepts(&Type::INT4));
        assert_eq!(encode(Value::Null, &Type::INT4).unwrap(), None);
        assert_eq!(encode(Value::Null, &Type::JSONB).unwrap(), None);
    }

    #[test]
    fn test_int_narrows_to_column_type() {
        assert_eq!(
            encode(Value::Int(7), &Type::INT2).unwrap(),
            Some(7i16.to_be_bytes().to_vec())
        );
        assert_eq!(
            encode(Value::Int(7), &Type::INT4).unwrap(),
            Some(7i32.to_be_bytes().to_vec())
        );
        assert!(encode(Value::Int(70_000), &Type::INT2).is_err());
    }

    #[test]
    fn test_numeric_from_int_and_text() {
        let from_int = encode(Value::Int(42), &Type::NUMERIC).unwrap().unwrap();
        assert_eq!(from_int, encode_numeric("42").unwrap());
        let from_text = encode(Value::Text("12.50".into()), &Type::NUMERIC)
            .unwrap()
            .unwrap();
        assert_eq!(from_text, encode_numeric("12.50").unwrap());
    }

    #[test]
    fn test_text_parses_into_typed_params() {
        assert_eq!(
            encode(Value::Text("5".into()), &Type::INT8).unwrap(),
            Some(5i64.to_be_bytes().to_vec())
        );
        assert_eq!(
            encode(Value::Text("true".into()), &Type::BOOL).unwrap(),
            Some(vec![1])
        );
        assert!(encode(Value::Text("nope".into()), &Type::INT4).is_err());
        assert_eq!(
            encode(Value::Text("hi".into()), &Type::VARCHAR).unwrap(),
            Some(b"hi".to_vec())
        );
    }
}
