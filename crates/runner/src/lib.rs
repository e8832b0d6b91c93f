//! Restament: declarative end-to-end tests for HTTP/JSON APIs
//!
//! Each [`Scenario`] resets and seeds database tables and the upload
//! directory, sends one request to the application under test, and then
//! checks the response, the resulting table rows and any uploaded images.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Restament (suite host, per-scenario timeout)               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ScenarioRunner                                             │
//! │    ├── FixtureManager   reset storage, purge, seed          │
//! │    ├── build_request    JSON / url-encoded / multipart      │
//! │    ├── Transport        send -> { status, body }            │
//! │    ├── assert_response  status, JSON parse, body            │
//! │    ├── StateVerifier    rows sorted by id vs. matchers      │
//! │    └── UploadVerifier   ImageComparator on uploaded files   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  restament_common::Store (SQLite Database)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod fixtures;
pub mod matcher;
pub mod request;
pub mod response;
pub mod runner;
pub mod scenario;
pub mod state;
pub mod transport;
pub mod upload;
pub mod visual;

pub use config::{DbConfig, RestamentConfig};
pub use error::{ErrorKind, RestamentError, RunResult};
pub use matcher::{Matcher, MatcherKind, Predicate};
pub use runner::{
    Restament, RestamentBuilder, RunState, ScenarioReport, ScenarioResult, ScenarioRunner, Step,
    SuiteResult,
};
pub use scenario::{ExpectedRow, Method, RequestFormat, Scenario, TableExpectation};
pub use transport::{HttpResponse, HttpTransport, Transport};
pub use visual::{ImageComparator, PixelComparator};

/// Load every scenario under `dir`, optionally keeping only those with `tag`
/// and those whose name contains `name`
pub fn load_scenarios(
    dir: &std::path::Path,
    tag: Option<&str>,
    name: Option<&str>,
) -> RunResult<Vec<Scenario>> {
    let scenarios = Scenario::load_all(dir)?;
    Ok(scenarios
        .into_iter()
        .filter(|s| tag.map_or(true, |t| s.tags.iter().any(|st| st == t)))
        .filter(|s| name.map_or(true, |n| s.display_name().contains(n)))
        .collect())
}
