//! Data layer
//!
//! SQLite persistence (sqlx) and the runtime settings snapshot.

mod database;
mod models;
mod settings;

pub use database::Database;
pub use models::*;
pub use settings::RuntimeSettings;
