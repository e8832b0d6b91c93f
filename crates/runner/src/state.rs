//! Post-request verification of table contents
//!
//! Actual rows are sorted by `id` ascending and compared positionally with the
//! expected rows. Negation and predicate cells are checked on their own column.
//! A literal cell triggers a row-level comparison: the actual row must equal
//! the whole expected row, meaning same column set, literal cells equal and
//! matcher cells satisfied. Columns that should not be pinned must therefore
//! still be listed, e.g. `{ $present: true }`.

use std::cmp::Ordering;
use std::sync::Arc;

use restament_common::{row_id, Row, Store};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{RestamentError, RunResult};
use crate::matcher::Matcher;
use crate::scenario::{ExpectedRow, Scenario};

pub struct StateVerifier {
    store: Option<Arc<dyn Store>>,
}

impl StateVerifier {
    pub fn new(store: Option<Arc<dyn Store>>) -> Self {
        Self { store }
    }

    /// Verify every table expectation that carries expected rows, in declaration order
    pub async fn verify(&self, scenario: &Scenario) -> RunResult<()> {
        for table in &scenario.db {
            let Some(result) = &table.result else { continue };
            if result.data.is_empty() {
                continue;
            }
            self.verify_table(&table.tablename, &result.data).await?;
        }
        Ok(())
    }

    /// Compare the current contents of `table` with `expected`
    pub async fn verify_table(&self, table: &str, expected: &[ExpectedRow]) -> RunResult<()> {
        let store = self.store.as_ref().ok_or_else(|| {
            RestamentError::Config(
                "scenario verifies database tables but no database is configured".to_string(),
            )
        })?;

        let mut actual = store.find_all(table).await?;
        sort_by_id(&mut actual);

        compare_rows(table, expected, &actual)?;
        info!("Table {} matched {} expected row(s)", table, expected.len());
        Ok(())
    }
}

/// Sort rows by `id` ascending.
///
/// Numbers and numeric strings compare by value and come first, then other
/// strings, booleans and any remaining JSON. Rows without an id sort last.
pub fn sort_by_id(rows: &mut [Row]) {
    rows.sort_by(|a, b| cmp_ids(row_id(a), row_id(b)));
}

/// Sort key of one id
enum IdKey<'a> {
    Integer(i64),
    Float(f64),
    Text(&'a str),
    Bool(bool),
    Other(String),
}

impl IdKey<'_> {
    fn rank(&self) -> u8 {
        match self {
            IdKey::Integer(_) | IdKey::Float(_) => 0,
            IdKey::Text(_) => 1,
            IdKey::Bool(_) => 2,
            IdKey::Other(_) => 3,
        }
    }
}

fn id_key(value: &Value) -> IdKey<'_> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => IdKey::Integer(i),
            None => IdKey::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                IdKey::Integer(i)
            } else {
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_finite() => IdKey::Float(f),
                    _ => IdKey::Text(s),
                }
            }
        }
        Value::Bool(b) => IdKey::Bool(*b),
        other => IdKey::Other(other.to_string()),
    }
}

fn cmp_keys(a: &IdKey<'_>, b: &IdKey<'_>) -> Ordering {
    match (a, b) {
        (IdKey::Integer(x), IdKey::Integer(y)) => x.cmp(y),
        (IdKey::Integer(x), IdKey::Float(y)) => (*x as f64).total_cmp(y),
        (IdKey::Float(x), IdKey::Integer(y)) => x.total_cmp(&(*y as f64)),
        (IdKey::Float(x), IdKey::Float(y)) => x.total_cmp(y),
        (IdKey::Text(x), IdKey::Text(y)) => x.cmp(y),
        (IdKey::Bool(x), IdKey::Bool(y)) => x.cmp(y),
        (IdKey::Other(x), IdKey::Other(y)) => x.cmp(y),
        _ => a.rank().cmp(&b.rank()),
    }
}

fn cmp_ids(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp_keys(&id_key(x), &id_key(y)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Positional comparison of sorted actual rows against expected rows.
///
/// Differing row counts fail before any cell is compared.
pub fn compare_rows(table: &str, expected: &[ExpectedRow], actual: &[Row]) -> RunResult<()> {
    if expected.len() != actual.len() {
        return Err(RestamentError::RowCountMismatch {
            table: table.to_string(),
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    for (idx, (expected_row, actual_row)) in expected.iter().zip(actual).enumerate() {
        let mut row_checked = false;

        for (column, matcher) in expected_row.iter() {
            let actual_value = actual_row.get(column).unwrap_or(&Value::Null);

            match matcher {
                Matcher::Negation(_) | Matcher::Predicate(_) => {
                    if !matcher.matches(actual_value) {
                        let expected = matcher.describe();
                        return Err(column_mismatch(table, idx, column, expected, actual_value));
                    }
                }
                Matcher::Literal(_) => {
                    if row_checked {
                        continue;
                    }
                    row_checked = true;
                    if let Some((column, expected, actual)) =
                        row_mismatch(expected_row, actual_row)
                    {
                        return Err(column_mismatch(table, idx, &column, expected, &actual));
                    }
                }
            }
        }
        debug!("{}[{}] matched", table, idx);
    }

    Ok(())
}

/// First difference between an expected row and an actual row, if any
fn row_mismatch(expected: &ExpectedRow, actual: &Row) -> Option<(String, String, Value)> {
    for (column, matcher) in expected.iter() {
        match actual.get(column) {
            Some(value) if matcher.matches(value) => {}
            Some(value) => return Some((column.clone(), matcher.describe(), value.clone())),
            None => {
                return Some((
                    column.clone(),
                    format!("{} (column missing from row)", matcher.describe()),
                    Value::Null,
                ))
            }
        }
    }

    actual
        .iter()
        .find(|(column, _)| expected.get(column).is_none())
        .map(|(column, value)| (column.clone(), "<column not expected>".to_string(), value.clone()))
}

fn column_mismatch(
    table: &str,
    row: usize,
    column: &str,
    expected: String,
    actual: &Value,
) -> RestamentError {
    RestamentError::ColumnMismatch {
        table: table.to_string(),
        row,
        column: column.to_string(),
        expected,
        actual: actual.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    fn expected(value: Value) -> ExpectedRow {
        ExpectedRow::from_json(value).unwrap()
    }

    /// Store that returns rows in insertion order, whatever their ids
    struct UnorderedStore {
        rows: Mutex<Vec<Row>>,
    }

    #[async_trait]
    impl Store for UnorderedStore {
        async fn find_all(&self, _table: &str) -> restament_common::Result<Vec<Row>> {
            Ok(self.rows.lock().clone())
        }

        async fn create(&self, _table: &str, data: &Row) -> restament_common::Result<Row> {
            self.rows.lock().push(data.clone());
            Ok(data.clone())
        }

        async fn remove(&self, _table: &str, row: &Row) -> restament_common::Result<()> {
            self.rows.lock().retain(|r| row_id(r) != row_id(row));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rows_sorted_by_id_before_comparison() {
        let store = UnorderedStore {
            rows: Mutex::new(vec![
                row(json!({"id": 3, "name": "Cid"})),
                row(json!({"id": 1, "name": "Ann"})),
                row(json!({"id": 2, "name": "Bob"})),
            ]),
        };
        let verifier = StateVerifier::new(Some(Arc::new(store)));
        let rows = vec![
            expected(json!({"id": 1, "name": "Ann"})),
            expected(json!({"id": 2, "name": "Bob"})),
            expected(json!({"id": 3, "name": "Cid"})),
        ];

        verifier.verify_table("users", &rows).await.unwrap();
    }

    #[test]
    fn test_unsorted_rows_do_not_match() {
        let actual = vec![
            row(json!({"id": 3, "name": "Cid"})),
            row(json!({"id": 1, "name": "Ann"})),
        ];
        let rows = vec![
            expected(json!({"id": 1, "name": "Ann"})),
            expected(json!({"id": 3, "name": "Cid"})),
        ];
        assert!(compare_rows("users", &rows, &actual).is_err());

        let mut sorted = actual;
        sort_by_id(&mut sorted);
        assert!(compare_rows("users", &rows, &sorted).is_ok());
    }

    #[test]
    fn test_negation_cell() {
        let rows = vec![ExpectedRow::new().col("col", Matcher::not([5]))];

        let err = compare_rows("t", &rows, &[row(json!({"col": 5}))]).unwrap_err();
        assert!(matches!(
            err,
            RestamentError::ColumnMismatch { ref column, .. } if column == "col"
        ));
        assert!(compare_rows("t", &rows, &[row(json!({"col": 6}))]).is_ok());
    }

    #[test]
    fn test_predicate_cell() {
        let rows = vec![ExpectedRow::new().col(
            "col",
            Matcher::predicate(|v| v.as_i64().map(|n| n > 10).unwrap_or(false)),
        )];

        assert!(compare_rows("t", &rows, &[row(json!({"col": 15}))]).is_ok());
        assert!(compare_rows("t", &rows, &[row(json!({"col": 5}))]).is_err());
    }

    #[test]
    fn test_literal_is_row_level() {
        let rows = vec![expected(json!({"id": 1, "name": "Ann"}))];

        // Extra actual column fails even though both listed literals match
        let err = compare_rows(
            "users",
            &rows,
            &[row(json!({"id": 1, "name": "Ann", "created_at": "2024-01-01"}))],
        )
        .unwrap_err();
        match err {
            RestamentError::ColumnMismatch { column, row, .. } => {
                assert_eq!(column, "created_at");
                assert_eq!(row, 0);
            }
            other => panic!("unexpected error: {}", other),
        }

        // Matcher cells take part in the row-level comparison
        let rows = vec![expected(json!({
            "id": 1,
            "name": "Ann",
            "created_at": {"$present": true}
        }))];
        assert!(compare_rows(
            "users",
            &rows,
            &[row(json!({"id": 1, "name": "Ann", "created_at": "2024-01-01"}))]
        )
        .is_ok());
    }

    #[test]
    fn test_literal_mismatch_names_column() {
        let rows = vec![expected(json!({"id": 1, "name": "Bob"}))];
        let err =
            compare_rows("users", &rows, &[row(json!({"id": 1, "name": "Ann"}))]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("users") && msg.contains("name") && msg.contains("Ann"));
    }

    #[test]
    fn test_row_count_mismatch_fails_fast() {
        let rows = vec![expected(json!({"id": 1}))];
        let err = compare_rows("users", &rows, &[]).unwrap_err();
        assert!(matches!(
            err,
            RestamentError::RowCountMismatch { expected: 1, actual: 0, .. }
        ));
    }

    fn ids(rows: &[Row]) -> Vec<Value> {
        rows.iter()
            .map(|r| r.get("id").cloned().unwrap_or(Value::Null))
            .collect()
    }

    #[test]
    fn test_sort_mixed_ids() {
        let mut rows = vec![
            row(json!({"name": "none"})),
            row(json!({"id": "b"})),
            row(json!({"id": 10})),
            row(json!({"id": 2})),
        ];
        sort_by_id(&mut rows);
        assert_eq!(ids(&rows), vec![json!(2), json!(10), json!("b"), Value::Null]);
    }

    #[test]
    fn test_sort_numeric_string_ids_by_value() {
        let mut rows = vec![
            row(json!({"id": "10"})),
            row(json!({"id": "9"})),
            row(json!({"id": "100"})),
        ];
        sort_by_id(&mut rows);
        assert_eq!(ids(&rows), vec![json!("9"), json!("10"), json!("100")]);
    }

    #[test]
    fn test_sort_ids_total_order_across_types() {
        let expected = vec![
            json!(1),
            json!("2"),
            json!(2.5),
            json!(3),
            json!("abc"),
            json!("b"),
            json!(false),
            json!(true),
            json!([1]),
        ];
        let mut rows: Vec<Row> = expected
            .iter()
            .rev()
            .map(|id| row(json!({ "id": id })))
            .collect();
        rows.push(row(json!({"name": "none"})));
        sort_by_id(&mut rows);

        let mut want = expected;
        want.push(Value::Null);
        assert!(rows[9].get("id").is_none());
        assert_eq!(ids(&rows), want);
    }
}
