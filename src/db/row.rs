//! Row helpers shared by the backends.

use crate::db::traits::{Row, Rows};
use crate::error::{DatabaseError, DbResult};
use crate::models::Record;

/// A row that was already fetched.
#[derive(Debug)]
pub struct SingleRow {
    state: SingleRowState,
}

#[derive(Debug)]
enum SingleRowState {
    Ready(Record),
    Empty,
    Scanned,
}

impl SingleRow {
    pub fn new(record: Record) -> Self {
        Self {
            state: SingleRowState::Ready(record),
        }
    }

    /// A row for a query that returned nothing.
    pub fn empty() -> Self {
        Self {
            state: SingleRowState::Empty,
        }
    }

    pub fn from_option(record: Option<Record>) -> Self {
        record.map_or_else(Self::empty, Self::new)
    }
}

impl Row for SingleRow {
    fn scan(&mut self) -> DbResult<Record> {
        match std::mem::replace(&mut self.state, SingleRowState::Scanned) {
            SingleRowState::Ready(record) => Ok(record),
            SingleRowState::Empty => Err(DatabaseError::not_found("no rows in result set")),
            SingleRowState::Scanned => Err(DatabaseError::invalid_data("row already scanned")),
        }
    }
}

/// Drain a cursor, close it and return its records or its error.
pub async fn collect_rows(mut rows: Box<dyn Rows + '_>) -> DbResult<Vec<Record>> {
    let mut records = Vec::new();
    while rows.next().await {
        match rows.scan() {
            Ok(record) => records.push(record),
            Err(err) => {
                rows.close().await;
                return Err(err);
            }
        }
    }
    let err = rows.take_err();
    rows.close().await;
    match err {
        Some(err) => Err(err),
        None => Ok(records),
    }
}
