use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

/**
 * \brief 在 127.0.0.1 随机端口启动路由，返回 base URL。
 */
pub async fn spawn_mock(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock listener");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

/**
 * \brief 记录 mock 收到的请求。
 */
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<Value>>>);

impl Captured {
    pub fn push(&self, value: Value) {
        self.0.lock().expect("captured lock").push(value);
    }

    pub fn last(&self) -> Option<Value> {
        self.0.lock().expect("captured lock").last().cloned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("captured lock").len()
    }
}

#[derive(Default)]
struct FakeRepo {
    /** \brief path -> (blob sha, content) */
    files: BTreeMap<String, (String, String)>,
    extra_tree: Vec<(String, String)>,
    next_sha: u64,
    stale_reads: usize,
    failing_reads: usize,
    tree_fails: bool,
    requests: usize,
    commits: usize,
    last_auth: Option<String>,
}

impl FakeRepo {
    fn mint_sha(&mut self) -> String {
        self.next_sha += 1;
        format!("{:040x}", self.next_sha)
    }

    fn record(&mut self, headers: &HeaderMap) {
        self.requests += 1;
        self.last_auth = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
}

/**
 * \brief GitHub contents / trees API 的内存替身，按 sha 做冲突检测。
 */
#[derive(Clone, Default)]
pub struct FakeGitHub(Arc<Mutex<FakeRepo>>);

impl FakeGitHub {
    fn lock(&self) -> MutexGuard<'_, FakeRepo> {
        self.0.lock().expect("fake github lock")
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        {
            let mut repo = self.lock();
            let sha = repo.mint_sha();
            repo.files
                .insert(path.to_string(), (sha, content.to_string()));
        }
        self
    }

    pub fn with_tree_entry(self, path: &str, kind: &str) -> Self {
        self.lock()
            .extra_tree
            .push((path.to_string(), kind.to_string()));
        self
    }

    /** \brief 后续 n 次读取返回过期 sha，模拟并发修改。 */
    pub fn serve_stale_reads(&self, n: usize) {
        self.lock().stale_reads = n;
    }

    /** \brief 后续 n 次读取返回 500。 */
    pub fn fail_next_reads(&self, n: usize) {
        self.lock().failing_reads = n;
    }

    pub fn fail_tree(&self) {
        self.lock().tree_fails = true;
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.lock().files.get(path).map(|(_, c)| c.clone())
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    pub fn last_auth(&self) -> Option<String> {
        self.lock().last_auth.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(
                "/repos/{owner}/{repo}/contents/{*path}",
                get(fake_get_contents).put(fake_put_contents),
            )
            .route("/repos/{owner}/{repo}/git/trees/{branch}", get(fake_tree))
            .with_state(self.clone())
    }
}

#[derive(Deserialize)]
struct FakePutBody {
    content: String,
    #[serde(default)]
    sha: Option<String>,
}

async fn fake_get_contents(
    State(fake): State<FakeGitHub>,
    Path((_owner, _repo, path)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let path = path.trim_start_matches('/').to_string();
    let mut repo = fake.lock();
    repo.record(&headers);
    if repo.failing_reads > 0 {
        repo.failing_reads -= 1;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "Server Error"})),
        );
    }
    let current = repo.files.get(&path).map(|(sha, _)| sha.clone());
    match current {
        Some(sha) => {
            let sha = if repo.stale_reads > 0 {
                repo.stale_reads -= 1;
                "0".repeat(40)
            } else {
                sha
            };
            (
                StatusCode::OK,
                Json(json!({"type": "file", "path": path, "sha": sha})),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Not Found"})),
        ),
    }
}

async fn fake_put_contents(
    State(fake): State<FakeGitHub>,
    Path((owner, name, path)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<FakePutBody>,
) -> (StatusCode, Json<Value>) {
    let path = path.trim_start_matches('/').to_string();
    let mut repo = fake.lock();
    repo.record(&headers);

    let content = match BASE64
        .decode(body.content.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
    {
        Some(c) => c,
        None => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"message": "content is not valid Base64"})),
            )
        }
    };

    let current = repo.files.get(&path).map(|(sha, _)| sha.clone());
    match (current, body.sha) {
        (Some(_), None) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "Invalid request.\n\n\"sha\" wasn't supplied."})),
        ),
        (Some(cur), Some(given)) if cur != given => (
            StatusCode::CONFLICT,
            Json(json!({"message": format!("{} does not match {}", path, given)})),
        ),
        (None, Some(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"message": "sha supplied for a file that does not exist"})),
        ),
        (existing, _) => {
            let blob_sha = repo.mint_sha();
            let commit_sha = repo.mint_sha();
            repo.files.insert(path.clone(), (blob_sha.clone(), content));
            repo.commits += 1;
            let status = if existing.is_some() {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (
                status,
                Json(json!({
                    "content": {
                        "path": path,
                        "sha": blob_sha,
                        "html_url": format!("https://github.com/{}/{}/blob/main/{}", owner, name, path),
                    },
                    "commit": {
                        "sha": commit_sha,
                        "html_url": format!("https://github.com/{}/{}/commit/{}", owner, name, commit_sha),
                    }
                })),
            )
        }
    }
}

async fn fake_tree(State(fake): State<FakeGitHub>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let mut repo = fake.lock();
    repo.record(&headers);
    if repo.tree_fails {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "Not Found"})),
        );
    }
    let mut tree: Vec<Value> = repo
        .files
        .iter()
        .map(|(path, (sha, _))| json!({"path": path, "type": "blob", "sha": sha}))
        .collect();
    tree.extend(
        repo.extra_tree
            .iter()
            .map(|(path, kind)| json!({"path": path, "type": kind})),
    );
    (
        StatusCode::OK,
        Json(json!({"sha": "root", "tree": tree, "truncated": false})),
    )
}
