//! Restament Common Library
//!
//! The backing-store side of Restament: the [`Store`] capability set the
//! runner purges, seeds and re-reads tables through, plus a SQLite-backed
//! implementation.

pub mod db;
pub mod error;
pub mod store;

// Re-export commonly used types
pub use db::Database;
pub use error::{Error, Result};
pub use store::{row_id, Row, Store, ID_COLUMN};
