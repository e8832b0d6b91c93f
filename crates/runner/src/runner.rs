//! Scenario orchestration: the per-scenario state machine and the suite host

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use restament_common::{Database, Store};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RestamentConfig;
use crate::error::{ErrorKind, RestamentError, RunResult};
use crate::fixtures::{check_mock_rows, FixtureManager};
use crate::request::{build_request, PreparedRequest, RequestBody};
use crate::response::assert_response;
use crate::scenario::Scenario;
use crate::state::StateVerifier;
use crate::transport::{HttpTransport, Transport};
use crate::upload::UploadVerifier;
use crate::visual::{ImageComparator, PixelComparator};

/// A step of the scenario pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Configuration checks, request rendering, mock row and upload file checks
    Prepare,
    ResetFixtures,
    SeedFixtures,
    BeforeHook,
    SendRequest,
    AssertResponse,
    VerifyState,
    VerifyUploads,
    AfterHook,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::ResetFixtures => "reset_fixtures",
            Step::SeedFixtures => "seed_fixtures",
            Step::BeforeHook => "before_hook",
            Step::SendRequest => "send_request",
            Step::AssertResponse => "assert_response",
            Step::VerifyState => "verify_state",
            Step::VerifyUploads => "verify_uploads",
            Step::AfterHook => "after_hook",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States a scenario passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    FixturesReset,
    FixturesSeeded,
    RequestSent,
    ResponseAssertPassed,
    StateAssertPassed,
    UploadAssertPassed,
    AfterHook,
    Done,
    Failed(Step),
}

/// Outcome of one scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    /// Every state entered, starting at `Idle`
    pub trace: Vec<RunState>,
    pub failed_step: Option<Step>,
    pub error: Option<RestamentError>,
}

impl ScenarioReport {
    fn new() -> Self {
        Self {
            trace: vec![RunState::Idle],
            failed_step: None,
            error: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    /// Current (final, once the run returned) state
    pub fn state(&self) -> RunState {
        self.trace.last().copied().unwrap_or(RunState::Idle)
    }

    /// The first failure, if any
    pub fn into_result(self) -> RunResult<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn advance(&mut self, state: RunState) {
        debug!("{:?} -> {:?}", self.state(), state);
        self.trace.push(state);
    }

    fn fail(&mut self, failure: StepFailure) {
        self.advance(RunState::Failed(failure.step));
        self.failed_step = Some(failure.step);
        self.error = Some(failure.error);
    }
}

struct StepFailure {
    step: Step,
    error: RestamentError,
}

fn at(step: Step) -> impl FnOnce(RestamentError) -> StepFailure {
    move |error| StepFailure { step, error }
}

/// Runs one scenario through reset, seed, request and verification
pub struct ScenarioRunner {
    endpoint: String,
    has_store: bool,
    has_upload_dir: bool,
    fixtures: FixtureManager,
    transport: Arc<dyn Transport>,
    state: StateVerifier,
    uploads: UploadVerifier,
}

impl ScenarioRunner {
    pub fn new(
        config: &RestamentConfig,
        store: Option<Arc<dyn Store>>,
        transport: Arc<dyn Transport>,
        comparator: Arc<dyn ImageComparator>,
    ) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            has_store: store.is_some(),
            has_upload_dir: config.upload_dir.is_some(),
            fixtures: FixtureManager::new(store.clone(), config.upload_dir.clone()),
            transport,
            state: StateVerifier::new(store),
            uploads: UploadVerifier::new(
                comparator,
                config.upload_dir.clone(),
                config.log_dir.clone(),
                config.artifact_dir.clone(),
            ),
        }
    }

    /// Run `scenario` to a terminal state.
    ///
    /// The first failing step ends the pipeline. Once fixtures have been
    /// touched the `after` hook runs regardless, and its own failure is only
    /// reported when nothing failed before it.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let mut report = ScenarioReport::new();

        let request = match self.prepare(scenario).await {
            Ok(request) => request,
            Err(e) => {
                report.fail(StepFailure {
                    step: Step::Prepare,
                    error: e,
                });
                return report;
            }
        };

        let mut failure = self.execute(scenario, &request, &mut report).await.err();

        if let Some(hook) = &scenario.after {
            report.advance(RunState::AfterHook);
            if let Err(e) = hook.call().await {
                let hook_error = RestamentError::hook("after", e);
                match failure.as_ref().map(|f| f.step) {
                    Some(step) => warn!(
                        "Ignoring after hook failure ({}) in favour of {} failure",
                        hook_error, step
                    ),
                    None => {
                        failure = Some(StepFailure {
                            step: Step::AfterHook,
                            error: hook_error,
                        })
                    }
                }
            }
        }

        match failure {
            Some(failure) => report.fail(failure),
            None => report.advance(RunState::Done),
        }
        report
    }

    /// Checks run before any fixture is touched
    async fn prepare(&self, scenario: &Scenario) -> RunResult<PreparedRequest> {
        let request = build_request(&self.endpoint, scenario)?;

        if !self.has_store && !scenario.db.is_empty() {
            return Err(RestamentError::Config(format!(
                "scenario references table(s) {} but no database is configured",
                scenario.table_names().join(", ")
            )));
        }
        if !self.has_upload_dir && scenario.touches_upload_dir() {
            return Err(RestamentError::Config(
                "scenario uses upload fixtures or expectations but `upload_dir` is not configured"
                    .to_string(),
            ));
        }
        check_mock_rows(scenario)?;

        if let RequestBody::Multipart { files, .. } = &request.body {
            for (field, path) in files {
                if !tokio::fs::try_exists(path).await? {
                    return Err(RestamentError::Config(format!(
                        "upload {} for field {} doesn't exist",
                        path.display(),
                        field
                    )));
                }
            }
        }
        Ok(request)
    }

    async fn execute(
        &self,
        scenario: &Scenario,
        request: &PreparedRequest,
        report: &mut ScenarioReport,
    ) -> Result<(), StepFailure> {
        self.fixtures
            .reset(scenario)
            .await
            .map_err(at(Step::ResetFixtures))?;
        report.advance(RunState::FixturesReset);

        self.fixtures
            .seed(scenario)
            .await
            .map_err(at(Step::SeedFixtures))?;
        report.advance(RunState::FixturesSeeded);

        if let Some(hook) = &scenario.before {
            hook.call()
                .await
                .map_err(|e| RestamentError::hook("before", e))
                .map_err(at(Step::BeforeHook))?;
        }

        info!("{} {}", request.method, request.uri);
        let response = self
            .transport
            .send(request)
            .await
            .map_err(at(Step::SendRequest))?;
        report.advance(RunState::RequestSent);

        assert_response(&response, scenario.status, scenario.resdata.as_ref())
            .map_err(at(Step::AssertResponse))?;
        report.advance(RunState::ResponseAssertPassed);

        self.state
            .verify(scenario)
            .await
            .map_err(at(Step::VerifyState))?;
        report.advance(RunState::StateAssertPassed);

        self.uploads
            .verify(scenario)
            .await
            .map_err(at(Step::VerifyUploads))?;
        report.advance(RunState::UploadAssertPassed);

        Ok(())
    }
}

/// Failure details of one scenario, as reported
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&RestamentError> for FailureInfo {
    fn from(e: &RestamentError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Result of running a single scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub title: String,
    pub success: bool,
    pub duration_ms: u64,
    pub failed_step: Option<Step>,
    pub trace: Vec<RunState>,
    pub error: Option<FailureInfo>,
}

/// Result of running a suite of scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub results: Vec<ScenarioResult>,
}

impl SuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Write results as `test-results.json` under `dir`
    pub fn write_results(&self, dir: &Path) -> RunResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("test-results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Entry point: owns the collaborators and hosts scenario runs
pub struct Restament {
    config: RestamentConfig,
    runner: ScenarioRunner,
}

impl Restament {
    /// Build with the default collaborators: SQLite store (when configured),
    /// `reqwest` transport and pixel comparator
    pub fn new(config: RestamentConfig) -> RunResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: RestamentConfig) -> RestamentBuilder {
        RestamentBuilder {
            config,
            store: None,
            transport: None,
            comparator: None,
        }
    }

    pub fn config(&self) -> &RestamentConfig {
        &self.config
    }

    /// Run one scenario without a timeout, exposing its state trace
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        self.runner.run(scenario).await
    }

    /// Run scenarios serially, each bounded by the configured timeout
    pub async fn test(&self, scenarios: &[Scenario]) -> RunResult<SuiteResult> {
        if scenarios.is_empty() {
            return Err(RestamentError::Config("no scenarios to run".to_string()));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let mut results = Vec::with_capacity(scenarios.len());
        let mut passed = 0;
        let mut failed = 0;

        info!("Running {} scenario(s) against {}", scenarios.len(), self.config.endpoint);

        for scenario in scenarios {
            let result = self.test_one(scenario).await;
            if result.success {
                passed += 1;
                info!("✓ {} ({} ms)", result.title, result.duration_ms);
            } else {
                failed += 1;
                error!(
                    "✗ {} - {}",
                    result.title,
                    result
                        .error
                        .as_ref()
                        .map(|e| e.message.as_str())
                        .unwrap_or("unknown error")
                );
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("Scenario results: {} passed, {} failed ({} ms)", passed, failed, duration_ms);

        Ok(SuiteResult {
            total: scenarios.len(),
            passed,
            failed,
            duration_ms,
            started_at,
            results,
        })
    }

    async fn test_one(&self, scenario: &Scenario) -> ScenarioResult {
        let start = Instant::now();
        debug!("Running scenario: {}", scenario.display_name());

        let outcome = tokio::time::timeout(self.config.timeout(), self.runner.run(scenario)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (failed_step, trace, error) = match outcome {
            Ok(report) => (
                report.failed_step,
                report.trace.clone(),
                report.error.as_ref().map(FailureInfo::from),
            ),
            Err(_) => (
                None,
                Vec::new(),
                Some(FailureInfo::from(&RestamentError::Timeout(self.config.timeout_ms))),
            ),
        };

        ScenarioResult {
            name: scenario.display_name().to_string(),
            title: scenario.title(),
            success: error.is_none(),
            duration_ms,
            failed_step,
            trace,
            error,
        }
    }
}

/// Builder for [`Restament`] with injectable collaborators
pub struct RestamentBuilder {
    config: RestamentConfig,
    store: Option<Arc<dyn Store>>,
    transport: Option<Arc<dyn Transport>>,
    comparator: Option<Arc<dyn ImageComparator>>,
}

impl RestamentBuilder {
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn ImageComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    pub fn build(self) -> RunResult<Restament> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => Some(store),
            None => open_store(&self.config)?,
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_timeout(self.config.timeout())?),
        };
        let comparator = self
            .comparator
            .unwrap_or_else(|| Arc::new(PixelComparator::default()));

        let runner = ScenarioRunner::new(&self.config, store, transport, comparator);
        Ok(Restament {
            config: self.config,
            runner,
        })
    }
}

fn open_store(config: &RestamentConfig) -> RunResult<Option<Arc<dyn Store>>> {
    let Some(db) = config.db.as_ref() else {
        debug!("No database configured; table fixtures disabled");
        return Ok(None);
    };
    let Some(path) = db.path.as_ref().filter(|_| db.is_complete()) else {
        warn!("Database configuration has no `path`; table fixtures disabled");
        return Ok(None);
    };
    if let Some(host) = &db.host {
        debug!("Ignoring database host {} for the SQLite store", host);
    }

    let database = if db.is_memory() {
        Database::open_memory()
    } else {
        Database::open(path)
    }
    .map_err(|e| {
        RestamentError::Config(format!("cannot open database {}: {}", path.display(), e))
    })?;

    Ok(Some(Arc::new(database)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{ExpectedRow, HookError, TableExpectation};
    use crate::transport::HttpResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport that answers like a tiny users API backed by the same store
    struct UsersApi {
        db: Database,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Transport for UsersApi {
        async fn send(&self, request: &PreparedRequest) -> RunResult<HttpResponse> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if let crate::request::RequestBody::Json(body) = &request.body {
                let data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(body)?;
                let created = self.db.create("users", &data).await?;
                return Ok(HttpResponse {
                    status: 201,
                    body: serde_json::Value::Object(created).to_string(),
                });
            }
            Ok(HttpResponse {
                status: 200,
                body: "<html>hello</html>".to_string(),
            })
        }
    }

    fn users_db() -> Database {
        let db = Database::open_memory().unwrap();
        db.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);",
        )
        .unwrap();
        db
    }

    fn restament(db: &Database) -> (Restament, Arc<UsersApi>) {
        let api = Arc::new(UsersApi {
            db: db.clone(),
            sent: AtomicUsize::new(0),
        });
        let restament = Restament::builder(RestamentConfig::new("http://api.test"))
            .store(Arc::new(db.clone()))
            .transport(api.clone())
            .build()
            .unwrap();
        (restament, api)
    }

    fn create_ann(expected_name: &str) -> Scenario {
        Scenario::post("/users")
            .json(json!({"name": "Ann"}))
            .expect_status(201)
            .expect_body(json!({"id": 1, "name": "Ann"}))
            .table(TableExpectation::new("users").expect_row(
                ExpectedRow::from_json(json!({"id": 1, "name": expected_name})).unwrap(),
            ))
    }

    #[tokio::test]
    async fn test_passing_scenario_visits_every_state() {
        let db = users_db();
        let (restament, _) = restament(&db);

        let report = restament.run(&create_ann("Ann")).await;
        assert!(report.passed(), "{:?}", report.error);
        assert_eq!(
            report.trace,
            vec![
                RunState::Idle,
                RunState::FixturesReset,
                RunState::FixturesSeeded,
                RunState::RequestSent,
                RunState::ResponseAssertPassed,
                RunState::StateAssertPassed,
                RunState::UploadAssertPassed,
                RunState::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_wrong_row_fails_at_state_verification() {
        let db = users_db();
        let (restament, _) = restament(&db);

        let report = restament.run(&create_ann("Bob")).await;
        assert_eq!(report.failed_step, Some(Step::VerifyState));
        assert_eq!(report.state(), RunState::Failed(Step::VerifyState));
        assert!(matches!(report.error, Some(RestamentError::ColumnMismatch { .. })));
    }

    #[tokio::test]
    async fn test_uploads_with_json_rejected_before_sending() {
        let db = users_db();
        let (restament, api) = restament(&db);
        let scenario = Scenario::post("/users")
            .json(json!({"name": "Ann"}))
            .upload("avatar", "avatar.png");

        let report = restament.run(&scenario).await;
        assert_eq!(report.failed_step, Some(Step::Prepare));
        assert!(matches!(report.error, Some(RestamentError::UploadsWithJson)));
        assert_eq!(api.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_after_hook_runs_but_does_not_mask_failure() {
        let db = users_db();
        let (restament, _) = restament(&db);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let scenario = create_ann("Bob").after(move || {
            let counter = counter.clone();
            async move {
                *counter.lock() += 1;
                Err::<(), HookError>("cleanup failed".into())
            }
        });

        let report = restament.run(&scenario).await;
        assert_eq!(*calls.lock(), 1);
        assert_eq!(report.failed_step, Some(Step::VerifyState));
        assert!(report.trace.contains(&RunState::AfterHook));
    }

    #[tokio::test]
    async fn test_after_hook_failure_reported_when_alone() {
        let db = users_db();
        let (restament, _) = restament(&db);
        let scenario =
            create_ann("Ann").after(|| async { Err::<(), HookError>("cleanup failed".into()) });

        let report = restament.run(&scenario).await;
        assert_eq!(report.failed_step, Some(Step::AfterHook));
        assert_eq!(report.error.map(|e| e.kind()), Some(ErrorKind::Hook));
    }

    #[tokio::test]
    async fn test_before_hook_failure_skips_request() {
        let db = users_db();
        let (restament, api) = restament(&db);
        let scenario =
            create_ann("Ann").before(|| async { Err::<(), HookError>("not ready".into()) });

        let report = restament.run(&scenario).await;
        assert_eq!(report.failed_step, Some(Step::BeforeHook));
        assert_eq!(api.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rerun_purges_previous_rows() {
        let db = users_db();
        let (restament, _) = restament(&db);
        let scenario = Scenario::post("/users")
            .json(json!({"name": "Ann"}))
            .expect_status(201)
            .table(TableExpectation::new("users").expect_row(
                ExpectedRow::from_json(json!({"id": {"$present": true}, "name": "Ann"})).unwrap(),
            ));

        assert!(restament.run(&scenario).await.passed());
        assert!(restament.run(&scenario).await.passed());
    }

    #[tokio::test]
    async fn test_table_without_store_is_config_error() {
        let restament = Restament::builder(RestamentConfig::new("http://api.test"))
            .transport(Arc::new(UsersApi {
                db: users_db(),
                sent: AtomicUsize::new(0),
            }))
            .build()
            .unwrap();

        let report = restament.run(&create_ann("Ann")).await;
        assert_eq!(report.failed_step, Some(Step::Prepare));
        assert_eq!(report.error.map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_bad_mock_row_rejected_before_reset() {
        let db = users_db();
        let (restament, api) = restament(&db);
        let mut existing = serde_json::Map::new();
        existing.insert("id".to_string(), json!(7));
        existing.insert("name".to_string(), json!("Zed"));
        db.create("users", &existing).await.unwrap();

        let scenario = Scenario::post("/users")
            .json(json!({"name": "Ann"}))
            .table(TableExpectation::new("users").seed(json!(42)));

        let report = restament.run(&scenario).await;
        assert_eq!(report.failed_step, Some(Step::Prepare));
        assert_eq!(report.error.map(|e| e.kind()), Some(ErrorKind::Configuration));
        assert_eq!(report.trace, vec![RunState::Idle, RunState::Failed(Step::Prepare)]);
        assert_eq!(api.sent.load(Ordering::SeqCst), 0);

        let rows = db.find_all("users").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(7));
    }

    #[tokio::test]
    async fn test_missing_upload_file_rejected_before_reset() {
        let db = users_db();
        let (restament, api) = restament(&db);
        let scenario = Scenario::post("/avatars")
            .form(json!({"user_id": "1"}))
            .upload("avatar", "/nonexistent/avatar.png");

        let report = restament.run(&scenario).await;
        assert_eq!(report.failed_step, Some(Step::Prepare));
        let error = report.error.unwrap();
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(error.to_string().contains("/nonexistent/avatar.png"), "{}", error);
        assert_eq!(api.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suite_results_and_timeout() {
        let db = users_db();
        let api = Arc::new(UsersApi {
            db: db.clone(),
            sent: AtomicUsize::new(0),
        });
        let config = RestamentConfig::new("http://api.test").with_timeout_ms(1000);
        let restament = Restament::builder(config)
            .store(Arc::new(db.clone()))
            .transport(api)
            .build()
            .unwrap();

        let slow = Scenario::get("/slow").before(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            Ok::<(), HookError>(())
        });
        let suite = restament
            .test(&[create_ann("Ann"), Scenario::get("/"), slow])
            .await
            .unwrap();

        assert_eq!(suite.total, 3);
        assert_eq!(suite.passed, 1);
        assert_eq!(suite.failed, 2);
        assert_eq!(
            suite.results[0].title,
            "/users: should return 201 on POST access (posting in JSON format)"
        );
        assert_eq!(suite.results[1].failed_step, Some(Step::AssertResponse));
        assert_eq!(suite.results[1].error.as_ref().map(|e| e.kind), Some(ErrorKind::Parse));
        assert_eq!(suite.results[2].error.as_ref().map(|e| e.kind), Some(ErrorKind::Timeout));

        let tmp = tempfile::TempDir::new().unwrap();
        let path = suite.write_results(tmp.path()).unwrap();
        let written: SuiteResult =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written.failed, 2);
    }

    #[tokio::test]
    async fn test_empty_suite_rejected() {
        let db = users_db();
        let (restament, _) = restament(&db);
        assert!(matches!(restament.test(&[]).await, Err(RestamentError::Config(_))));
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        assert!(Restament::new(RestamentConfig::new("")).is_err());
    }
}
