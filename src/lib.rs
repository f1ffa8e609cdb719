//! pgbridge: driver-agnostic PostgreSQL access.
//!
//! One contract ([`db::Provider`], [`db::Pool`], [`db::Connection`],
//! [`db::Transaction`]) over three backends: tokio-postgres pooled by
//! deadpool-postgres (`wire`), sea-orm (`orm`) and a sqlx `PgPool` (`sql`).

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, DriverKind};
pub use db::{Context, new_provider};
pub use error::{DatabaseError, DbResult, ErrorKind};
