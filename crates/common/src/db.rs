//! SQLite implementation of the [`Store`] capability set

use crate::store::{row_id, Row, Store, ID_COLUMN};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper shared by the runner and, in tests, the application under test
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL lets the application under test read while fixtures are written
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a batch of SQL statements, typically schema setup
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

// ========================================================================
// Row access
// ========================================================================

fn select_all(conn: &Connection, table: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table)?))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql(row.get_ref(idx)?));
        }
        results.push(record);
    }

    Ok(results)
}

fn insert(conn: &Connection, table: &str, data: &Row) -> Result<Row> {
    let table_ident = quote_ident(table)?;

    if data.is_empty() {
        conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", table_ident), [])?;
    } else {
        let mut columns = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());
        for (column, value) in data {
            columns.push(quote_ident(column)?);
            values.push(to_sql(column, value)?);
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();

        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table_ident,
                columns.join(", "),
                placeholders.join(", ")
            ),
            params_from_iter(values.iter()),
        )?;
    }

    let rowid = conn.last_insert_rowid();
    debug!("Inserted into {} (rowid {})", table, rowid);

    // Tables declared WITHOUT ROWID cannot be read back; return what was written
    let stored = read_by_rowid(conn, &table_ident, rowid).ok();
    Ok(stored.unwrap_or_else(|| data.clone()))
}

fn read_by_rowid(
    conn: &Connection,
    table_ident: &str,
    rowid: i64,
) -> std::result::Result<Row, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} WHERE rowid = ?1", table_ident))?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    stmt.query_row([rowid], |row| {
        let mut record = Row::new();
        for (idx, column) in columns.iter().enumerate() {
            record.insert(column.clone(), from_sql(row.get_ref(idx)?));
        }
        Ok(record)
    })
}

fn delete(conn: &Connection, table: &str, row: &Row) -> Result<()> {
    let id = row_id(row).ok_or_else(|| Error::MissingId {
        table: table.to_string(),
    })?;

    let affected = conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(table)?,
            quote_ident(ID_COLUMN)?
        ),
        [to_sql(ID_COLUMN, id)?],
    )?;

    if affected > 0 {
        debug!("Deleted {} with id {}", table, id);
    }
    Ok(())
}

#[async_trait]
impl Store for Database {
    async fn find_all(&self, table: &str) -> Result<Vec<Row>> {
        let table = table.to_string();
        self.with_conn(move |conn| select_all(conn, &table)).await
    }

    async fn create(&self, table: &str, data: &Row) -> Result<Row> {
        let table = table.to_string();
        let data = data.clone();
        self.with_conn(move |conn| insert(conn, &table, &data)).await
    }

    async fn remove(&self, table: &str, row: &Row) -> Result<()> {
        let table = table.to_string();
        let row = row.clone();
        self.with_conn(move |conn| delete(conn, &table, &row)).await
    }
}

// ========================================================================
// Value mapping
// ========================================================================

/// Quote a table or column name for interpolation into SQL
fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Nested arrays and objects are stored as JSON text
fn to_sql(column: &str, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                return Err(Error::UnsupportedValue {
                    column: column.to_string(),
                    reason: format!("number {} out of range", n),
                });
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

/// Blobs come back hex-encoded
fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}
