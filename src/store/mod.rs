//! Persistence layer: libSQL-backed storage for leads and their message log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::LeadStore;
