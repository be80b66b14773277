pub mod database;
pub mod error;
pub mod schema;
pub mod sequences;
pub mod tasks;

pub use database::Database;
pub use error::StoreError;
