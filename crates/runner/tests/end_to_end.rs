//! End-to-end runs against a small axum application sharing a SQLite file and
//! an upload directory with the runner.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use restament::{
    DbConfig, ErrorKind, ExpectedRow, Restament, RestamentConfig, RestamentError, RunState,
    Scenario, Step, TableExpectation,
};
use restament_common::{Database, Store};

#[derive(Clone)]
struct App {
    db: Database,
    upload_dir: PathBuf,
}

async fn create_user(
    State(app): State<App>,
    Json(data): Json<Map<String, Value>>,
) -> impl IntoResponse {
    match app.db.create("users", &data).await {
        Ok(row) => (StatusCode::CREATED, Json(Value::Object(row))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn upload_avatar(State(app): State<App>, mut multipart: Multipart) -> impl IntoResponse {
    let mut user_id = None;
    let mut image = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("user_id") => user_id = field.text().await.ok(),
            Some("avatar") => image = field.bytes().await.ok(),
            _ => {}
        }
    }
    let (Some(user_id), Some(image)) = (user_id, image) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing field"})));
    };

    let users = app.db.find_all("users").await.unwrap_or_default();
    if !users.iter().any(|u| u.get("id").map(|id| id.to_string()) == Some(user_id.clone())) {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "no such user"})));
    }

    let filename = format!("avatars/{}.png", user_id);
    let dest = app.upload_dir.join(&filename);
    if let Some(parent) = dest.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::write(&dest, &image).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"saved": filename}))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

async fn hello() -> Html<&'static str> {
    Html("<h1>Hello</h1>")
}

struct Harness {
    tmp: TempDir,
    restament: Restament,
}

impl Harness {
    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("app.db");
    let upload_dir = tmp.path().join("uploads");

    let db = Database::open(&db_path).unwrap();
    db.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
        .unwrap();

    let app = Router::new()
        .route("/users", post(create_user))
        .route("/avatars", post(upload_avatar))
        .route("/hello", get(hello))
        .with_state(App {
            db,
            upload_dir: upload_dir.clone(),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = RestamentConfig::new(format!("http://{}", addr))
        .with_upload_dir(&upload_dir)
        .with_log_dir(tmp.path().join("logs"))
        .with_artifact_dir(tmp.path().join("tmp/images"))
        .with_db(DbConfig::sqlite(&db_path));
    let restament = Restament::new(config).unwrap();

    Harness { tmp, restament }
}

fn write_png(path: &Path, color: [u8; 4]) {
    image::RgbaImage::from_pixel(8, 8, image::Rgba(color))
        .save(path)
        .unwrap();
}

fn create_ann(expected_name: &str) -> Scenario {
    Scenario::post("/users")
        .named("create-user")
        .json(json!({"name": "Ann"}))
        .expect_status(201)
        .expect_body(json!({"id": 1, "name": "Ann"}))
        .table(TableExpectation::new("users").expect_row(
            ExpectedRow::from_json(json!({"id": 1, "name": expected_name})).unwrap(),
        ))
}

#[tokio::test]
async fn test_create_user_passes() {
    let h = harness().await;

    let report = h.restament.run(&create_ann("Ann")).await;
    assert!(report.passed(), "{:?}", report.error);
    assert_eq!(report.state(), RunState::Done);

    // Purge before seeding makes the run repeatable
    let report = h.restament.run(&create_ann("Ann")).await;
    assert!(report.passed(), "{:?}", report.error);
}

#[tokio::test]
async fn test_wrong_expected_row_fails_at_state_verification() {
    let h = harness().await;

    let report = h.restament.run(&create_ann("Bob")).await;
    assert_eq!(report.failed_step, Some(Step::VerifyState));
    let message = report.error.map(|e| e.to_string()).unwrap_or_default();
    assert!(message.contains("Bob") && message.contains("Ann"));
}

#[tokio::test]
async fn test_avatar_upload_matches_reference() {
    let h = harness().await;
    let avatar = h.path("avatar.png");
    write_png(&avatar, [200, 40, 40, 255]);

    let scenario = Scenario::post("/avatars")
        .form(json!({"user_id": "1"}))
        .upload("avatar", &avatar)
        .expect_status(201)
        .expect_body(json!({"saved": "avatars/1.png"}))
        .table(
            TableExpectation::new("users")
                .seed(json!({"id": 1, "name": "Ann"}))
                .expect_upload("avatars/1.png", &avatar),
        );

    let report = h.restament.run(&scenario).await;
    assert!(report.passed(), "{:?}", report.error);
    assert!(report.trace.contains(&RunState::UploadAssertPassed));
}

#[tokio::test]
async fn test_avatar_mismatch_keeps_artifacts() {
    let h = harness().await;
    let avatar = h.path("avatar.png");
    let reference = h.path("reference.png");
    write_png(&avatar, [200, 40, 40, 255]);
    write_png(&reference, [40, 40, 200, 255]);

    let scenario = Scenario::post("/avatars")
        .form(json!({"user_id": "1"}))
        .upload("avatar", &avatar)
        .expect_status(201)
        .table(
            TableExpectation::new("users")
                .seed(json!({"id": 1, "name": "Ann"}))
                .expect_upload("avatars/1.png", &reference),
        );

    let report = h.restament.run(&scenario).await;
    assert_eq!(report.failed_step, Some(Step::VerifyUploads));
    assert!(matches!(report.error, Some(RestamentError::UploadMismatch { .. })));
    assert!(h.path("tmp/images/uploaded/avatars_1.png").exists());
    assert!(h.path("tmp/images/expected/avatars_1.png").exists());
    assert!(h.path("logs/images/diff/avatars_1.png").exists());
}

#[tokio::test]
async fn test_upload_for_unseeded_user_is_status_mismatch() {
    let h = harness().await;
    let avatar = h.path("avatar.png");
    write_png(&avatar, [0, 0, 0, 255]);

    let scenario = Scenario::post("/avatars")
        .form(json!({"user_id": "7"}))
        .upload("avatar", &avatar)
        .expect_status(201);

    let report = h.restament.run(&scenario).await;
    assert_eq!(report.failed_step, Some(Step::AssertResponse));
    match report.error {
        Some(RestamentError::StatusMismatch { expected, actual }) => {
            assert_eq!(expected, 201);
            assert_eq!(actual, 404);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_body_reports_raw_text() {
    let h = harness().await;

    let suite = h
        .restament
        .test(&[Scenario::get("/hello"), create_ann("Ann")])
        .await
        .unwrap();

    assert_eq!(suite.passed, 1);
    let hello = &suite.results[0];
    assert_eq!(hello.title, "/hello: should return 200 on GET access (posting in JSON format)");
    let error = hello.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Parse);
    assert!(error.message.contains("<h1>Hello</h1>"));
}
