use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::CoreError;
use crate::llm::upstream_message;
use crate::models::{CommitOperation, CommitRequest, CommitResult, RepoCoordinates};
use crate::telemetry;

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const GITHUB_API_VERSION: &str = "2022-11-28";
const CLIENT_AGENT: &str = "codequill";

/** \brief 不提供给模型作为上下文的锁文件。 */
const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "composer.lock",
    "Gemfile.lock",
    "poetry.lock",
    "bun.lockb",
];

/**
 * \brief 远端文件当前版本的不透明标识（GitHub blob sha）。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMarker(pub String);

/**
 * \brief 读取现有 blob 的结论。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /** \brief 文件存在，携带其 sha。 */
    Existing(RevisionMarker),
    /** \brief 404：文件尚不存在，按创建处理。 */
    Absent,
    /** \brief 读取失败但已记录，按创建尝试写入。 */
    Unknown,
}

impl ProbeOutcome {
    pub fn marker(&self) -> Option<&RevisionMarker> {
        match self {
            ProbeOutcome::Existing(marker) => Some(marker),
            _ => None,
        }
    }
}

/**
 * \brief 尽力而为的探测策略：非 404 的读取失败只记录日志，不中断提交。
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct BestEffortProbe;

impl BestEffortProbe {
    pub fn settle(
        &self,
        path: &str,
        result: Result<Option<RevisionMarker>, CoreError>,
    ) -> ProbeOutcome {
        match result {
            Ok(Some(marker)) => ProbeOutcome::Existing(marker),
            Ok(None) => ProbeOutcome::Absent,
            Err(e) => {
                telemetry::log_error(
                    "github.probe",
                    &format!("path={} kind={} err={} (continuing)", path, e.kind(), e),
                );
                ProbeOutcome::Unknown
            }
        }
    }
}

#[derive(Deserialize)]
struct ContentsEntry {
    sha: String,
}

#[derive(Serialize)]
struct PutContentsBody<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Deserialize)]
struct PutContentsResponse {
    #[serde(default)]
    content: Option<HtmlLink>,
    #[serde(default)]
    commit: Option<HtmlLink>,
}

#[derive(Deserialize)]
struct HtmlLink {
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
}

#[derive(Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/**
 * \brief GitHub 提交网关：校验 → 读取现有 sha → 单次创建或更新 → 返回结果。
 * \details 不做自动重试；sha 过期导致的冲突以 CommitFailed 抛给调用方，由其重新执行整个流程。
 */
#[derive(Debug, Clone)]
pub struct CommitGateway {
    http: reqwest::Client,
    api_base: String,
    fallback_token: Option<String>,
    probe: BestEffortProbe,
}

impl CommitGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.github_api_base.clone(),
            fallback_token: config.github_token.clone(),
            probe: BestEffortProbe,
        }
    }

    /**
     * \brief 执行一次创建或更新。
     */
    pub async fn commit(
        &self,
        request: &CommitRequest,
        coords: &RepoCoordinates,
    ) -> Result<CommitResult, CoreError> {
        request.validate()?;
        validate_coordinates(coords)?;
        let token = self.resolve_token(coords)?;
        let path = request.normalized_path();
        let url = self.contents_url(coords, path)?;

        let outcome = self
            .probe
            .settle(path, self.read_revision(url.clone(), coords, token).await);
        let marker = outcome.marker();

        let body = PutContentsBody {
            message: request.commit_message.trim(),
            content: BASE64.encode(request.new_content.as_bytes()),
            branch: branch_of(coords),
            sha: marker.map(|m| m.0.as_str()),
        };

        let resp = self
            .authed(self.http.put(url), Some(token))
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::CommitFailed(e.without_url().to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let err = CoreError::CommitFailed(format!(
                "GitHub API error ({}): {}",
                status.as_u16(),
                upstream_message(&text)
            ));
            telemetry::log_error(
                "github.commit",
                &format!("repo={}/{} path={} {}", coords.owner, coords.repo, path, err),
            );
            return Err(err);
        }

        let parsed: PutContentsResponse = serde_json::from_str(&text).map_err(|e| {
            CoreError::CommitFailed(format!("unexpected GitHub response: {}", e))
        })?;
        let html_url = parsed
            .commit
            .and_then(|c| c.html_url)
            .or_else(|| parsed.content.and_then(|c| c.html_url))
            .unwrap_or_default();

        let operation = if marker.is_some() {
            CommitOperation::Updated
        } else {
            CommitOperation::Created
        };
        telemetry::log_event(
            "github.commit",
            &format!(
                "repo={}/{} branch={} path={} op={:?} url={}",
                coords.owner, coords.repo, coords.branch, path, operation, html_url
            ),
        );

        Ok(CommitResult {
            success: true,
            operation,
            html_url,
        })
    }

    /**
     * \brief 列出仓库文件（过滤目录、.git 元数据与锁文件），失败时返回空列表。
     */
    pub async fn list_files(&self, coords: &RepoCoordinates) -> Vec<String> {
        match self.try_list_files(coords).await {
            Ok(files) => files,
            Err(e) => {
                telemetry::log_error(
                    "github.tree",
                    &format!("repo={}/{} kind={} err={}", coords.owner, coords.repo, e.kind(), e),
                );
                Vec::new()
            }
        }
    }

    async fn try_list_files(&self, coords: &RepoCoordinates) -> Result<Vec<String>, CoreError> {
        validate_coordinates(coords)?;
        let mut url = self.repo_url(coords)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CoreError::InvalidRequest("GitHub API base cannot carry a path".into()))?;
            segments.extend(["git", "trees", branch_of(coords).unwrap_or("HEAD")]);
        }
        url.query_pairs_mut().append_pair("recursive", "1");

        let token = coords.token.as_deref().or(self.fallback_token.as_deref());
        let resp = self.authed(self.http.get(url), token).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CoreError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&text),
            });
        }
        let tree: TreeResponse = serde_json::from_str(&text)
            .map_err(|e| CoreError::MalformedResponse(format!("git tree payload: {}", e)))?;
        Ok(tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| entry.path)
            .filter(|path| !is_excluded_path(path))
            .collect())
    }

    /**
     * \brief 读取文件当前 sha；404 视为正常的“不存在”。
     */
    async fn read_revision(
        &self,
        mut url: Url,
        coords: &RepoCoordinates,
        token: &str,
    ) -> Result<Option<RevisionMarker>, CoreError> {
        if let Some(branch) = branch_of(coords) {
            url.query_pairs_mut().append_pair("ref", branch);
        }
        let resp = self.authed(self.http.get(url), Some(token)).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CoreError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&text),
            });
        }
        let entry: ContentsEntry = serde_json::from_str(&text)
            .map_err(|e| CoreError::MalformedResponse(format!("contents payload: {}", e)))?;
        Ok(Some(RevisionMarker(entry.sha)))
    }

    fn resolve_token<'a>(&'a self, coords: &'a RepoCoordinates) -> Result<&'a str, CoreError> {
        coords
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.fallback_token.as_deref())
            .ok_or_else(|| CoreError::MissingCredential("GITHUB_TOKEN".to_string()))
    }

    fn authed(&self, req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
        let req = req
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(USER_AGENT, CLIENT_AGENT)
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
        match token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    fn repo_url(&self, coords: &RepoCoordinates) -> Result<Url, CoreError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| CoreError::InvalidRequest(format!("invalid GitHub API base: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CoreError::InvalidRequest("GitHub API base cannot carry a path".into()))?;
            segments
                .pop_if_empty()
                .extend(["repos", coords.owner.trim(), coords.repo.trim()]);
        }
        Ok(url)
    }

    fn contents_url(&self, coords: &RepoCoordinates, path: &str) -> Result<Url, CoreError> {
        let mut url = self.repo_url(coords)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CoreError::InvalidRequest("GitHub API base cannot carry a path".into()))?;
            segments.push("contents");
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }
}

fn validate_coordinates(coords: &RepoCoordinates) -> Result<(), CoreError> {
    if coords.owner.trim().is_empty() || coords.repo.trim().is_empty() {
        return Err(CoreError::InvalidRequest(
            "repository owner and name are required".to_string(),
        ));
    }
    Ok(())
}

fn branch_of(coords: &RepoCoordinates) -> Option<&str> {
    let branch = coords.branch.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch)
    }
}

/**
 * \brief 排除 .git 元数据与锁文件。
 */
pub fn is_excluded_path(path: &str) -> bool {
    if path.split('/').any(|segment| segment == ".git") {
        return true;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    LOCK_FILES.contains(&name) || name.ends_with(".lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_mock, FakeGitHub};

    fn coords() -> RepoCoordinates {
        RepoCoordinates {
            owner: "octo".into(),
            repo: "site".into(),
            branch: "main".into(),
            token: Some("ghp_test".into()),
        }
    }

    fn request(path: &str, content: &str) -> CommitRequest {
        CommitRequest {
            file_path: path.into(),
            new_content: content.into(),
            commit_message: "m".into(),
        }
    }

    async fn gateway_for(fake: &FakeGitHub) -> CommitGateway {
        let base = spawn_mock(fake.router()).await;
        CommitGateway::new(&Config {
            github_api_base: base,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_create_when_file_absent() {
        let fake = FakeGitHub::default();
        let gateway = gateway_for(&fake).await;
        let result = gateway
            .commit(&request("docs/new file.md", "hello"), &coords())
            .await
            .expect("commit");
        assert!(result.success);
        assert_eq!(result.operation, CommitOperation::Created);
        assert_eq!(result.operation.message(), "File created successfully");
        assert!(result.html_url.starts_with("https://github.com/octo/site/commit/"));
        assert_eq!(fake.content("docs/new file.md").as_deref(), Some("hello"));
        assert_eq!(fake.last_auth().as_deref(), Some("Bearer ghp_test"));
    }

    #[tokio::test]
    async fn test_update_when_file_exists() {
        let fake = FakeGitHub::default().with_file("index.html", "<p>old</p>");
        let gateway = gateway_for(&fake).await;
        let result = gateway
            .commit(&request("/index.html", "<p>new</p>"), &coords())
            .await
            .expect("commit");
        assert_eq!(result.operation, CommitOperation::Updated);
        assert_eq!(result.operation.message(), "File updated successfully");
        assert_eq!(fake.content("index.html").as_deref(), Some("<p>new</p>"));
    }

    #[tokio::test]
    async fn test_same_commit_twice_is_content_idempotent() {
        let fake = FakeGitHub::default();
        let gateway = gateway_for(&fake).await;
        let req = request("a.txt", "hello");

        let first = gateway.commit(&req, &coords()).await.expect("first");
        let second = gateway.commit(&req, &coords()).await.expect("second");
        assert!(first.success && second.success);
        assert_eq!(first.operation, CommitOperation::Created);
        assert_eq!(second.operation, CommitOperation::Updated);
        assert_ne!(first.html_url, second.html_url);
        assert_eq!(fake.content("a.txt").as_deref(), Some("hello"));
        assert_eq!(fake.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_makes_no_network_call() {
        let fake = FakeGitHub::default();
        let gateway = gateway_for(&fake).await;

        let err = gateway
            .commit(&request("a.txt", ""), &coords())
            .await
            .expect_err("empty content");
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        let mut no_repo = coords();
        no_repo.repo = String::new();
        let err = gateway
            .commit(&request("a.txt", "x"), &no_repo)
            .await
            .expect_err("no repo");
        assert!(matches!(err, CoreError::InvalidRequest(_)));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_token_without_fallback() {
        let fake = FakeGitHub::default();
        let gateway = gateway_for(&fake).await;
        let mut anon = coords();
        anon.token = None;
        let err = gateway
            .commit(&request("a.txt", "x"), &anon)
            .await
            .expect_err("no token");
        assert!(matches!(err, CoreError::MissingCredential(_)));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn test_fallback_token_is_used() {
        let fake = FakeGitHub::default();
        let base = spawn_mock(fake.router()).await;
        let gateway = CommitGateway::new(&Config {
            github_api_base: base,
            github_token: Some("server-token".into()),
            ..Config::default()
        });
        let mut anon = coords();
        anon.token = None;
        gateway
            .commit(&request("a.txt", "x"), &anon)
            .await
            .expect("commit");
        assert_eq!(fake.last_auth().as_deref(), Some("Bearer server-token"));
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_abort_commit() {
        let fake = FakeGitHub::default();
        fake.fail_next_reads(1);
        let gateway = gateway_for(&fake).await;
        let result = gateway
            .commit(&request("new.txt", "x"), &coords())
            .await
            .expect("commit proceeds");
        assert_eq!(result.operation, CommitOperation::Created);
    }

    #[tokio::test]
    async fn test_stale_marker_conflict_then_fresh_retry() {
        let fake = FakeGitHub::default().with_file("a.txt", "v1");
        fake.serve_stale_reads(1);
        let gateway = gateway_for(&fake).await;
        let req = request("a.txt", "v2");

        let err = gateway.commit(&req, &coords()).await.expect_err("conflict");
        match &err {
            CoreError::CommitFailed(msg) => assert!(msg.contains("409"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fake.content("a.txt").as_deref(), Some("v1"));

        let ok = gateway.commit(&req, &coords()).await.expect("retry");
        assert_eq!(ok.operation, CommitOperation::Updated);
        assert_eq!(fake.content("a.txt").as_deref(), Some("v2"));
    }

    #[test]
    fn test_best_effort_probe_settles_errors_as_unknown() {
        let probe = BestEffortProbe;
        assert_eq!(
            probe.settle("a", Ok(Some(RevisionMarker("abc".into())))),
            ProbeOutcome::Existing(RevisionMarker("abc".into()))
        );
        assert_eq!(probe.settle("a", Ok(None)), ProbeOutcome::Absent);
        let outcome = probe.settle(
            "a",
            Err(CoreError::Upstream {
                status: 502,
                message: "bad gateway".into(),
            }),
        );
        assert_eq!(outcome, ProbeOutcome::Unknown);
        assert!(outcome.marker().is_none());
    }

    #[tokio::test]
    async fn test_list_files_filters_dirs_git_and_locks() {
        let fake = FakeGitHub::default()
            .with_file("src/main.js", "x")
            .with_file("package-lock.json", "{}")
            .with_file("README.md", "#")
            .with_tree_entry("src", "tree")
            .with_tree_entry(".git/config", "blob");
        let gateway = gateway_for(&fake).await;
        let mut files = gateway.list_files(&coords()).await;
        files.sort();
        assert_eq!(files, vec!["README.md".to_string(), "src/main.js".to_string()]);
    }

    #[tokio::test]
    async fn test_list_files_failure_yields_empty() {
        let fake = FakeGitHub::default().with_file("a.txt", "x");
        fake.fail_tree();
        let gateway = gateway_for(&fake).await;
        assert!(gateway.list_files(&coords()).await.is_empty());
    }

    #[test]
    fn test_excluded_paths() {
        assert!(is_excluded_path(".git/HEAD"));
        assert!(is_excluded_path("web/yarn.lock"));
        assert!(is_excluded_path("Cargo.lock"));
        assert!(!is_excluded_path(".github/workflows/ci.yml"));
        assert!(!is_excluded_path("src/lock.rs"));
    }
}
