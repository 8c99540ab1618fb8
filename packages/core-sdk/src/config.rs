use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::models::RepoCoordinates;

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com";
pub const DEFAULT_ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_BRANCH: &str = "main";

/**
 * \brief 默认系统提示词：约束模型始终输出 `{text, structuredData}` JSON 文档。
 */
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = r#"You are a senior software engineer pairing with the user on a GitHub repository.
Always answer with a single JSON object and nothing else:
{
  "text": "<your conversational reply, markdown allowed>",
  "structuredData": null | {
    "action": "COMMIT" | "CHAT",
    "filePath": "<repository-relative path of the file to write>",
    "commitMessage": "<short imperative commit message>",
    "newContent": "<the complete new content of the file>",
    "previewContent": "<optional self-contained HTML snippet that renders a preview>"
  }
}
Only use action COMMIT when you propose a concrete change to exactly one file, and then
always provide filePath and the full newContent. Use null for structuredData when you are
only chatting."#;

/**
 * \brief 进程级配置，启动时构造一次并以引用传入各客户端。
 */
#[derive(Debug, Clone)]
pub struct Config {
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_base: String,
    pub openai_api_base: String,
    pub anthropic_api_base: String,
    pub github_api_base: String,
    pub github_token: Option<String>,
    pub github_owner: Option<String>,
    pub github_repo: Option<String>,
    pub github_branch: String,
    /** \brief 系统提示词，属于外部配置而非核心行为。 */
    pub system_instruction: String,
    pub telemetry_enabled: bool,
    pub log_dir: PathBuf,
    pub ui_dir: PathBuf,
    pub db_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            openai_api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            anthropic_api_base: DEFAULT_ANTHROPIC_API_BASE.to_string(),
            github_api_base: DEFAULT_GITHUB_API_BASE.to_string(),
            github_token: None,
            github_owner: None,
            github_repo: None,
            github_branch: DEFAULT_BRANCH.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            telemetry_enabled: false,
            log_dir: PathBuf::from("logs"),
            ui_dir: PathBuf::from("web"),
            db_path: PathBuf::from("codequill.db"),
        }
    }
}

impl Config {
    /**
     * \brief 从环境变量读取配置，仅在进程启动时调用。
     */
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值查找函数构造配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let system_instruction = match non_empty("CODEQUILL_SYSTEM_PROMPT") {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("read system prompt file {} failed", path))?,
            None => defaults.system_instruction,
        };

        let telemetry_enabled = non_empty("CODEQUILL_TELEMETRY")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            gemini_api_key: non_empty("GEMINI_API_KEY"),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            anthropic_api_key: non_empty("ANTHROPIC_API_KEY"),
            gemini_api_base: non_empty("GEMINI_API_BASE").unwrap_or(defaults.gemini_api_base),
            openai_api_base: non_empty("OPENAI_API_BASE").unwrap_or(defaults.openai_api_base),
            anthropic_api_base: non_empty("ANTHROPIC_API_BASE")
                .unwrap_or(defaults.anthropic_api_base),
            github_api_base: non_empty("GITHUB_API_BASE").unwrap_or(defaults.github_api_base),
            github_token: non_empty("GITHUB_TOKEN"),
            github_owner: non_empty("GITHUB_OWNER"),
            github_repo: non_empty("GITHUB_REPO"),
            github_branch: non_empty("GITHUB_BRANCH").unwrap_or(defaults.github_branch),
            system_instruction,
            telemetry_enabled,
            log_dir: non_empty("CODEQUILL_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            ui_dir: non_empty("CODEQUILL_UI_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ui_dir),
            db_path: non_empty("CODEQUILL_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
        })
    }

    /**
     * \brief 解析目标仓库坐标：调用方显式输入优先，其次回退到配置。
     * \return 缺少 owner 或 repo 时返回 None。
     */
    pub fn repo_coordinates(&self, overrides: &RepoOverrides) -> Option<RepoCoordinates> {
        let pick = |explicit: &Option<String>, fallback: &Option<String>| {
            explicit
                .as_ref()
                .filter(|v| !v.trim().is_empty())
                .or(fallback.as_ref())
                .cloned()
        };
        let owner = pick(&overrides.owner, &self.github_owner)?;
        let repo = pick(&overrides.repo, &self.github_repo)?;
        let branch = overrides
            .branch
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.github_branch.clone());
        Some(RepoCoordinates {
            owner,
            repo,
            branch,
            token: pick(&overrides.token, &self.github_token),
        })
    }
}

/**
 * \brief 调用方针对单次请求给出的仓库坐标覆盖项。
 */
#[derive(Debug, Clone, Default)]
pub struct RepoOverrides {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub token: Option<String>,
}
