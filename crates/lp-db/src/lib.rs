//! MariaDB persistence for the panel: pool setup, schema bootstrap,
//! row models, and typed queries.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{connect, DbCredentials, DbError};
