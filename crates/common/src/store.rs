//! Store capability set
//!
//! The runner only ever needs four things from a relational backend: list a
//! table, insert a row, delete a row and read a row back as a plain mapping.
//! Rows travel as JSON objects so expectations written in YAML or with
//! `serde_json::json!` compare against them directly.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::Result;

/// Name of the row identifier column
pub const ID_COLUMN: &str = "id";

/// A materialized row: column name to value
pub type Row = Map<String, Value>;

/// Backing store the fixtures and state verification run against.
///
/// Implementations are shared between scenarios, so they must be usable from
/// concurrent futures within one phase (purging N rows at once, for example).
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch every row currently in `table`, in no particular order
    async fn find_all(&self, table: &str) -> Result<Vec<Row>>;

    /// Insert `data` into `table` and return the stored row, including its `id`
    async fn create(&self, table: &str, data: &Row) -> Result<Row>;

    /// Delete the row identified by `row`'s `id` column
    async fn remove(&self, table: &str, row: &Row) -> Result<()>;
}

/// Look up a row's identifier
pub fn row_id(row: &Row) -> Option<&Value> {
    row.get(ID_COLUMN).filter(|v| !v.is_null())
}
