//! Data layer module
//!
//! Handles all data persistence:
//! - `FederationStore` repository trait
//! - SQLite implementation
//! - Actor and object models

mod database;
mod models;
mod store;

pub use database::Database;
pub use models::*;
pub use store::FederationStore;
