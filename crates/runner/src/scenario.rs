//! Declarative scenario description
//!
//! A [`Scenario`] is one API test case: the request to send, the rows and files
//! to seed beforehand, and everything that must hold afterwards. Scenarios are
//! either built in Rust with the builder methods or loaded from YAML:
//!
//! ```yaml
//! name: create-user
//! url: /users
//! method: POST
//! reqformat: JSON
//! reqdata: { name: Ann }
//! status: 201
//! resdata: { id: 1, name: Ann }
//! db:
//!   - tablename: users
//!     result:
//!       data: [{ id: 1, name: Ann }]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{RestamentError, RunResult};
use crate::matcher::Matcher;

/// HTTP method of a scenario request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    /// Only POST and PUT requests carry file parts
    pub fn carries_files(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How request data is encoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestFormat {
    #[default]
    Json,
    Form,
}

impl fmt::Display for RequestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFormat::Json => f.write_str("JSON"),
            RequestFormat::Form => f.write_str("FORM"),
        }
    }
}

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

type HookFn = dyn Fn() -> BoxFuture<'static, Result<(), HookError>> + Send + Sync;

/// Async callback run before the request or after the assertions
#[derive(Clone)]
pub struct Hook(Arc<HookFn>);

impl Hook {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        Hook(Arc::new(move || f().boxed()))
    }

    pub async fn call(&self) -> Result<(), HookError> {
        (self.0)().await
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hook")
    }
}

/// A file copied into the upload directory before the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSeed {
    pub src: PathBuf,
    /// Relative to the upload directory
    pub dest: PathBuf,
}

/// A file the application is expected to have written to the upload directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadExpectation {
    /// Relative to the upload directory
    pub filename: String,
    /// Reference image the uploaded file must match
    pub original: PathBuf,
}

/// Rows and files to seed before the request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockSpec {
    /// Each entry must be a mapping; a single mapping is a one-element list
    #[serde(default, deserialize_with = "one_or_many")]
    pub data: Vec<Value>,

    #[serde(default)]
    pub uploads: Vec<UploadSeed>,
}

/// Column name to expected value for one row
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ExpectedRow(BTreeMap<String, Matcher>);

impl ExpectedRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column expectation
    pub fn col(mut self, column: impl Into<String>, matcher: impl Into<Matcher>) -> Self {
        self.0.insert(column.into(), matcher.into());
        self
    }

    /// Build from a JSON object, recognising the declarative matcher forms
    pub fn from_json(value: Value) -> RunResult<Self> {
        let Value::Object(map) = value else {
            return Err(RestamentError::SpecParse(format!(
                "expected row must be a mapping, got {}",
                value
            )));
        };
        let mut row = BTreeMap::new();
        for (column, expected) in map {
            row.insert(column, Matcher::classify(expected)?);
        }
        Ok(Self(row))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Matcher)> {
        self.0.iter()
    }

    pub fn get(&self, column: &str) -> Option<&Matcher> {
        self.0.get(column)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Expected table state and uploaded files after the request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSpec {
    #[serde(default, deserialize_with = "one_or_many")]
    pub data: Vec<ExpectedRow>,

    #[serde(default)]
    pub uploads: Vec<UploadExpectation>,
}

/// Seed and verify description scoped to one table
#[derive(Debug, Clone, Deserialize)]
pub struct TableExpectation {
    pub tablename: String,

    #[serde(default)]
    pub mock: Option<MockSpec>,

    #[serde(default)]
    pub result: Option<ResultSpec>,
}

impl TableExpectation {
    pub fn new(tablename: impl Into<String>) -> Self {
        Self {
            tablename: tablename.into(),
            mock: None,
            result: None,
        }
    }

    /// Seed a row before the request
    pub fn seed(mut self, row: Value) -> Self {
        self.mock.get_or_insert_with(MockSpec::default).data.push(row);
        self
    }

    /// Copy `src` to `<uploadDir>/<dest>` before the request
    pub fn seed_upload(mut self, src: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        self.mock
            .get_or_insert_with(MockSpec::default)
            .uploads
            .push(UploadSeed {
                src: src.into(),
                dest: dest.into(),
            });
        self
    }

    /// Expect a row, positionally after sorting by `id`
    pub fn expect_row(mut self, row: ExpectedRow) -> Self {
        self.result.get_or_insert_with(ResultSpec::default).data.push(row);
        self
    }

    /// Expect `<uploadDir>/<filename>` to match the image at `original`
    pub fn expect_upload(
        mut self,
        filename: impl Into<String>,
        original: impl Into<PathBuf>,
    ) -> Self {
        self.result
            .get_or_insert_with(ResultSpec::default)
            .uploads
            .push(UploadExpectation {
                filename: filename.into(),
                original: original.into(),
            });
        self
    }

    fn touches_upload_dir(&self) -> bool {
        self.mock.as_ref().is_some_and(|m| !m.uploads.is_empty())
            || self.result.as_ref().is_some_and(|r| !r.uploads.is_empty())
    }
}

/// One declared API test case
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Defaults to the url
    #[serde(default)]
    pub name: Option<String>,

    /// Tags for filtering scenarios
    #[serde(default)]
    pub tags: Vec<String>,

    /// Path appended to the configured endpoint
    pub url: String,

    #[serde(default)]
    pub method: Method,

    #[serde(default)]
    pub reqformat: RequestFormat,

    /// JSON value for `JSON`, a mapping for `FORM`; null sends no body
    #[serde(default)]
    pub reqdata: Value,

    /// Form field name to local file path
    #[serde(default)]
    pub uploads: BTreeMap<String, PathBuf>,

    /// Expected HTTP status code
    pub status: u16,

    /// Expected parsed response body; when absent only JSON-ness is checked
    #[serde(default)]
    pub resdata: Option<Value>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub db: Vec<TableExpectation>,

    #[serde(skip)]
    pub before: Option<Hook>,

    #[serde(skip)]
    pub after: Option<Hook>,
}

impl Scenario {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            name: None,
            tags: Vec::new(),
            url: url.into(),
            method,
            reqformat: RequestFormat::Json,
            reqdata: Value::Null,
            uploads: BTreeMap::new(),
            status: 200,
            resdata: None,
            db: Vec::new(),
            before: None,
            after: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Send `data` as a JSON body
    pub fn json(mut self, data: Value) -> Self {
        self.reqformat = RequestFormat::Json;
        self.reqdata = data;
        self
    }

    /// Send `data` as form fields
    pub fn form(mut self, data: Value) -> Self {
        self.reqformat = RequestFormat::Form;
        self.reqdata = data;
        self
    }

    /// Attach a file part under `field`
    pub fn upload(mut self, field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.uploads.insert(field.into(), path.into());
        self
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn expect_body(mut self, body: Value) -> Self {
        self.resdata = Some(body);
        self
    }

    pub fn table(mut self, table: TableExpectation) -> Self {
        self.db.push(table);
        self
    }

    pub fn before<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.before = Some(Hook::new(f));
        self
    }

    pub fn after<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HookError>> + Send + 'static,
    {
        self.after = Some(Hook::new(f));
        self
    }

    /// Name used in reports
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    /// Human-readable test unit title
    pub fn title(&self) -> String {
        format!(
            "{}: should return {} on {} access (posting in {} format)",
            self.url, self.status, self.method, self.reqformat
        )
    }

    /// Distinct table names in declaration order
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for table in &self.db {
            if !names.contains(&table.tablename.as_str()) {
                names.push(&table.tablename);
            }
        }
        names
    }

    /// Whether seeding or verification needs the upload directory
    pub fn touches_upload_dir(&self) -> bool {
        self.db.iter().any(TableExpectation::touches_upload_dir)
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Parse one scenario or a list of scenarios from YAML
    pub fn from_yaml(yaml: &str) -> RunResult<Vec<Self>> {
        let parsed: OneOrMany<Scenario> = serde_yaml::from_str(yaml)?;
        Ok(parsed.into_vec())
    }

    /// Parse scenarios from a YAML file
    pub fn from_file(path: &Path) -> RunResult<Vec<Self>> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| {
            RestamentError::SpecParse(format!("{}: {}", path.display(), e))
        })
    }

    /// Load all scenarios from `*.yaml`/`*.yml` files under a directory
    pub fn load_all(dir: &Path) -> RunResult<Vec<Self>> {
        let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut scenarios = Vec::new();
        for path in paths {
            scenarios.extend(Self::from_file(&path)?);
        }

        Ok(scenarios)
    }
}

// ========================================================================
// One-or-many deserialization
// ========================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<OneOrMany<T>>::deserialize(deserializer)?
        .map(OneOrMany::into_vec)
        .unwrap_or_default())
}
