use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;

use campus_ops::batch::BatchDeps;
use campus_ops::bot::ChatSender;
use campus_ops::db;
use campus_ops::dispatch::Dispatcher;
use campus_ops::mailer::Mailer;
use campus_ops::model::Delivery;
use campus_ops::server::{build_router, AppState};

const SECRET: &str = "test-secret";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingChat {
    calls: Arc<Mutex<Vec<(i64, String)>>>,
}

impl RecordingChat {
    async fn calls(&self) -> Vec<(i64, String)> {
        self.calls.lock().await.clone()
    }

    async fn wait_for_calls(&self, want: usize) -> Vec<(i64, String)> {
        for _ in 0..200 {
            let calls = self.calls().await;
            if calls.len() >= want {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls().await
    }
}

#[async_trait::async_trait]
impl ChatSender for RecordingChat {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<Delivery> {
        self.calls.lock().await.push((chat_id, text.to_string()));
        Ok(Delivery::Sent)
    }
}

#[derive(Clone, Default)]
struct RecordingMailer;

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<Delivery> {
        Ok(Delivery::Sent)
    }
}

fn make_app(pool: sqlx::SqlitePool, chat: RecordingChat) -> Router {
    let chat: Arc<dyn ChatSender> = Arc::new(chat);
    let mailer: Arc<dyn Mailer> = Arc::new(RecordingMailer);
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), chat.clone(), mailer.clone()));
    let deps = Arc::new(BatchDeps {
        pool,
        dispatcher: dispatcher.clone(),
        chat,
        mailer,
        page_size: 50,
        digest_department: "sales".into(),
    });
    build_router(AppState {
        deps,
        dispatcher,
        secret: SECRET.into(),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn trigger_request(auth: Option<&str>, job: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/automation/{job}"));
    if let Some(auth) = auth {
        builder = builder.header("Authorization", auth);
    }
    builder.body(Body::empty()).unwrap()
}

fn event_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn missing_or_wrong_bearer_is_rejected_without_side_effects() {
    let pool = setup_pool().await;
    let invoice = db::insert_invoice(&pool, "Acme Corp", None, 100).await.unwrap();
    let chat = RecordingChat::default();
    let app = make_app(pool.clone(), chat.clone());

    for auth in [None, Some("Bearer wrong"), Some(SECRET), Some("bearer test-secret")] {
        let (status, body) = send(&app, trigger_request(auth, "invoices")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"Unauthorized");
    }

    // The processor must never have run: the invoice is still pending and
    // no notification went out.
    let status: String = sqlx::query_scalar("SELECT status FROM invoices WHERE id = ?")
        .bind(invoice)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "pending");
    assert!(chat.calls().await.is_empty());
}

#[tokio::test]
async fn trigger_runs_batch_and_reports_summary() {
    let pool = setup_pool().await;
    db::insert_invoice(&pool, "Acme Corp", None, 12_500).await.unwrap();
    let app = make_app(pool.clone(), RecordingChat::default());

    let auth = format!("Bearer {SECRET}");
    let (status, body) = send(&app, trigger_request(Some(&auth), "invoices")).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["totalItems"], 1);
    assert_eq!(json["succeededCount"], 1);
    assert!(json.get("errors").is_none());
    assert!(json["timestamp"].as_str().unwrap().contains('T'));

    // GET works too; terminal rows are not reconsidered.
    let request = Request::builder()
        .method("GET")
        .uri("/automation/invoices")
        .header("Authorization", &auth)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["totalItems"], 0);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let pool = setup_pool().await;
    let app = make_app(pool, RecordingChat::default());

    let auth = format!("Bearer {SECRET}");
    let (status, body) = send(&app, trigger_request(Some(&auth), "reindex")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("reindex"));
}

#[tokio::test]
async fn event_is_queued_and_dispatched_in_background() {
    let pool = setup_pool().await;
    db::insert_subscription(&pool, &["new_lead_detected"], "chat", Some(77), None, true)
        .await
        .unwrap();
    let chat = RecordingChat::default();
    let app = make_app(pool, chat.clone());

    let (status, body) = send(
        &app,
        event_request(r#"{"event":"new_lead_detected","payload":{"name":"Dana Scully","company":"FBI"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["message"], "Event queued");

    let calls = chat.wait_for_calls(1).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, 77);
    assert!(calls[0].1.contains("Dana Scully"));
}

#[tokio::test]
async fn event_requires_event_and_payload() {
    let pool = setup_pool().await;
    let app = make_app(pool, RecordingChat::default());

    for body in [
        r#"{"payload":{"name":"Dana"}}"#,
        r#"{"event":"new_lead_detected"}"#,
        r#"{"event":"","payload":{}}"#,
        r#"{"event":"x","payload":"not an object"}"#,
        "not json at all",
    ] {
        let (status, body) = send(&app, event_request(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Missing event or payload");
    }
}

#[tokio::test]
async fn health_is_public() {
    let pool = setup_pool().await;
    let app = make_app(pool, RecordingChat::default());

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}
