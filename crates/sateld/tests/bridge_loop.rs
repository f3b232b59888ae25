use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use satele_core::config::AppConfig;
use satele_core::types::ReportRequest;
use sateld::llm_gateway::{GenerateRequest, LanguageModel, LlmGateway, ProviderError};
use sateld::Bridge;
use serde_json::{json, Value};

const TOKEN: &str = "test-token";

#[derive(Default)]
struct FakeQueue {
    pending: VecDeque<Value>,
    reports: Vec<ReportRequest>,
    unauthorized: usize,
    /// Polls answered with a 500 before the queue behaves again.
    failing_polls: usize,
    reject_reports: bool,
    report_attempts: Vec<String>,
}

type Shared = Arc<Mutex<FakeQueue>>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn get_task(State(queue): State<Shared>, headers: HeaderMap) -> Response {
    let mut q = queue.lock().unwrap();
    if !authorized(&headers) {
        q.unauthorized += 1;
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if q.failing_polls > 0 {
        q.failing_polls -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match q.pending.pop_front() {
        Some(task) => Json(task).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn report_result(
    State(queue): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<ReportRequest>,
) -> Response {
    let mut q = queue.lock().unwrap();
    if !authorized(&headers) {
        q.unauthorized += 1;
        return StatusCode::UNAUTHORIZED.into_response();
    }
    q.report_attempts.push(body.id.clone());
    if q.reject_reports {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    q.reports.push(body);
    Json(json!({ "status": "ok" })).into_response()
}

async fn spawn_queue() -> (String, Shared) {
    let queue: Shared = Arc::new(Mutex::new(FakeQueue::default()));
    let app = Router::new()
        .route("/get-task", get(get_task))
        .route("/report-result", post(report_result))
        .with_state(queue.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), queue)
}

fn enqueue(queue: &Shared, instruction: &str, media_path: Option<&str>) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    queue.lock().unwrap().pending.push_back(json!({
        "id": id,
        "instruction": instruction,
        "sender": "+15550100",
        "source": "whatsapp",
        "media_path": media_path,
    }));
    id
}

fn reports(queue: &Shared) -> Vec<ReportRequest> {
    queue.lock().unwrap().reports.clone()
}

/// Replies with canned text, one per call.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "test"
    }

    async fn generate(&self, _req: &GenerateRequest<'_>) -> Result<String, ProviderError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NonRetryable("script exhausted".to_string()))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::NonRetryable("no embeddings".to_string()))
    }
}

fn config_for(root: &Path, base_url: &str) -> AppConfig {
    let mut cfg = AppConfig::default().finalize(root);
    cfg.bridge.base_url = base_url.to_string();
    cfg.bridge.auth_token = TOKEN.to_string();
    cfg.sandbox.host_home = String::new();
    cfg
}

fn make_bridge(root: &Path, base_url: &str, model: Option<Arc<ScriptedModel>>) -> Bridge {
    let backends: Vec<Arc<dyn LanguageModel>> = model
        .into_iter()
        .map(|m| m as Arc<dyn LanguageModel>)
        .collect();
    Bridge::with_gateway(config_for(root, base_url), LlmGateway::new(backends, None)).unwrap()
}

fn root_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    (dir, root)
}

#[tokio::test]
async fn empty_queue_is_not_an_error() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    let mut bridge = make_bridge(&root, &url, None);
    assert!(!bridge.run_once().await.unwrap());
    assert!(reports(&queue).is_empty());
    assert_eq!(queue.lock().unwrap().unauthorized, 0);
}

#[tokio::test]
async fn raw_shell_task_is_reported_once() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    let id = enqueue(&queue, "sh: echo hello", None);
    let mut bridge = make_bridge(&root, &url, None);

    assert!(bridge.run_once().await.unwrap());
    let got = reports(&queue);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, id);
    assert_eq!(got[0].output, "Executing Raw: echo hello\n---\nhello");
    assert!(!bridge.run_once().await.unwrap());
}

#[tokio::test]
async fn handoff_task_is_left_alone() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "please use gravity on this", None);
    let mut bridge = make_bridge(&root, &url, None);
    assert!(bridge.run_once().await.unwrap());
    assert!(reports(&queue).is_empty());
}

#[tokio::test]
async fn restart_is_acknowledged_before_it_happens() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "restart", None);
    let mut bridge = make_bridge(&root, &url, None);
    assert!(bridge.run_once().await.unwrap());
    let got = reports(&queue);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].output, "Restarting Satele. I will be back in a moment...");
}

#[tokio::test]
async fn model_reply_is_cleaned_and_executed() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "say one and two", None);
    let model = ScriptedModel::new(&["```bash\necho one\n# comment\n`echo two`\n```"]);
    let mut bridge = make_bridge(&root, &url, Some(model));
    assert!(bridge.run_once().await.unwrap());
    assert_eq!(reports(&queue)[0].output, "one\ntwo");
}

#[tokio::test]
async fn upload_short_circuits_and_cd_persists() {
    let (_dir, root) = root_dir();
    let sub = root.join("Reports");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join("summary.txt"), "q3").unwrap();

    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "send the summary file", None);
    let model = ScriptedModel::new(&["cd Reports\nUPLOAD:*.txt\necho never"]);
    let mut bridge = make_bridge(&root, &url, Some(model));
    assert!(bridge.run_once().await.unwrap());
    assert_eq!(
        reports(&queue)[0].output,
        format!("UPLOAD: {}", sub.join("summary.txt").display())
    );

    let state = std::fs::read_to_string(root.join("brain/.satele_cwd")).unwrap();
    assert_eq!(state.trim(), sub.to_string_lossy());
    let restored = make_bridge(&root, &url, None);
    assert_eq!(restored.session().cwd(), sub.as_path());
}

#[tokio::test]
async fn directory_echoed_as_upload_is_refused() {
    let (_dir, root) = root_dir();
    std::fs::create_dir_all(root.join("photos")).unwrap();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "send my photos", None);
    let model = ScriptedModel::new(&["echo UPLOAD:photos\necho never"]);
    let mut bridge = make_bridge(&root, &url, Some(model));
    assert!(bridge.run_once().await.unwrap());
    assert_eq!(
        reports(&queue)[0].output,
        format!("Upload failed: '{}' is a directory, not a file.", root.join("photos").display())
    );
}

#[tokio::test]
async fn media_task_skips_raw_shell_bypass() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "sh: echo bypass", Some("/nonexistent/voice.ogg"));
    let model = ScriptedModel::new(&["echo interpreted"]);
    let mut bridge = make_bridge(&root, &url, Some(model));
    assert!(bridge.run_once().await.unwrap());
    assert_eq!(reports(&queue)[0].output, "interpreted");
}

#[tokio::test]
async fn long_output_is_truncated_for_transport() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    enqueue(&queue, "sh: seq 1 5000", None);
    let mut bridge = make_bridge(&root, &url, None);
    assert!(bridge.run_once().await.unwrap());
    let output = reports(&queue)[0].output.clone();
    assert_eq!(output.chars().count(), 5000);
    assert!(output.ends_with("... (Result truncated at 5000 characters) ..."));
}

#[tokio::test]
async fn wrong_token_surfaces_as_poll_error() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    let mut cfg = config_for(&root, &url);
    cfg.bridge.auth_token = "wrong".to_string();
    let mut bridge = Bridge::with_gateway(cfg, LlmGateway::new(Vec::new(), None)).unwrap();
    assert!(bridge.run_once().await.is_err());
    assert_eq!(queue.lock().unwrap().unauthorized, 1);
}

#[tokio::test]
async fn loop_backs_off_after_a_failed_poll_and_keeps_going() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    queue.lock().unwrap().failing_polls = 1;
    let id = enqueue(&queue, "sh: echo recovered", None);
    let mut cfg = config_for(&root, &url);
    cfg.bridge.error_backoff_seconds = 1;
    cfg.bridge.poll_interval_ms = 0;
    let mut bridge = Bridge::with_gateway(cfg, LlmGateway::new(Vec::new(), None)).unwrap();

    let reported = async {
        while reports(&queue).is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::select! {
            _ = bridge.run_loop() => panic!("run loop returned"),
            _ = reported => {}
        }
    })
    .await;
    assert!(outcome.is_ok(), "task was never reported");

    let q = queue.lock().unwrap();
    assert_eq!(q.failing_polls, 0);
    assert_eq!(q.reports.len(), 1);
    assert_eq!(q.reports[0].id, id);
    assert_eq!(q.reports[0].output, "Executing Raw: echo recovered\n---\nrecovered");
}

#[tokio::test]
async fn rejected_report_is_not_retried() {
    let (_dir, root) = root_dir();
    let (url, queue) = spawn_queue().await;
    queue.lock().unwrap().reject_reports = true;
    let first = enqueue(&queue, "sh: echo one", None);
    let second = enqueue(&queue, "sh: echo two", None);
    let mut bridge = make_bridge(&root, &url, None);

    assert!(bridge.run_once().await.unwrap());
    assert!(bridge.run_once().await.unwrap());
    assert!(!bridge.run_once().await.unwrap());

    let q = queue.lock().unwrap();
    assert_eq!(q.report_attempts, vec![first, second]);
    assert!(q.reports.is_empty());
}
