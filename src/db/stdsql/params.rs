//! Parameter binding for the sql backend.

use crate::models::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::{Encode, Postgres, Type};

pub(crate) type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// A NULL sent with the unspecified type oid, so the server infers the
/// placeholder's type the same way it would for a literal NULL.
#[derive(Debug, Clone, Copy)]
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind an owned copy of `value`, so the query only borrows its SQL text.
pub(crate) fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(UntypedNull),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Bytes(v) => query.bind(v.clone()),
        Value::Json(v) => query.bind(sqlx::types::Json(v.clone())),
        Value::Timestamp(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(*v),
    }
}

pub(crate) fn build_query<'q>(sql: &'q str, args: &[Value]) -> PgQuery<'q> {
    args.iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untyped_null_has_no_type() {
        assert_eq!(UntypedNull::type_info(), PgTypeInfo::with_oid(Oid(0)));
        let mut buf = PgArgumentBuffer::default();
        assert!(matches!(
            UntypedNull.encode_by_ref(&mut buf).unwrap(),
            IsNull::Yes
        ));
    }

    #[test]
    fn test_build_query_keeps_sql() {
        use sqlx::Execute;
        let query = build_query("SELECT $1, $2", &[Value::Int(1), Value::Null]);
        assert_eq!(query.sql(), "SELECT $1, $2");
    }
}
