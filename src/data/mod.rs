//! Data layer module
//!
//! - `DomainStore`: the storage interface the federation layer is written against
//! - `Database`: SQLite implementation (sqlx)
//! - Models for actors, relationships, blocks, referenced objects and delivery jobs

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::DomainStore;
