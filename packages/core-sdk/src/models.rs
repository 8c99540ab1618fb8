use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/**
 * \brief 会话角色：用户或模型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "assistant")]
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "model" | "assistant" => Some(Role::Model),
            _ => None,
        }
    }
}

/**
 * \brief 会话中的一轮发言，按顺序只追加。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/**
 * \brief 文本生成后端类型，决定 Provider Client 的分发目标。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /** \brief 该 Provider 所需凭据对应的环境变量名。 */
    pub fn credential_name(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::OpenAi => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/**
 * \brief 模型目录条目，只读。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /** \brief 发送给 Provider 的模型名。 */
    pub id: String,
    pub display_name: String,
    pub provider_kind: ProviderKind,
    pub description: String,
}

impl ModelConfig {
    fn entry(id: &str, display_name: &str, kind: ProviderKind, description: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            provider_kind: kind,
            description: description.to_string(),
        }
    }
}

/**
 * \brief 内置可选模型目录。
 */
pub fn default_catalog() -> Vec<ModelConfig> {
    vec![
        ModelConfig::entry(
            "gemini-2.5-flash",
            "Gemini 2.5 Flash",
            ProviderKind::Gemini,
            "Fast default model for everyday edits",
        ),
        ModelConfig::entry(
            "gemini-2.5-pro",
            "Gemini 2.5 Pro",
            ProviderKind::Gemini,
            "Stronger reasoning for larger refactors",
        ),
        ModelConfig::entry(
            "gpt-4o",
            "GPT-4o",
            ProviderKind::OpenAi,
            "OpenAI general purpose model",
        ),
        ModelConfig::entry(
            "claude-sonnet-4-20250514",
            "Claude Sonnet 4",
            ProviderKind::Anthropic,
            "Anthropic model tuned for code",
        ),
    ]
}

/**
 * \brief 按 ID 在目录中查找模型。
 */
pub fn find_model<'a>(catalog: &'a [ModelConfig], id: &str) -> Option<&'a ModelConfig> {
    catalog.iter().find(|m| m.id == id)
}

/**
 * \brief 一次 Provider 交互的结果；text 总是存在。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AIResponse {
    pub text: String,
    pub structured_data: Option<ChangeProposal>,
}

impl AIResponse {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured_data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProposalAction {
    Commit,
    Chat,
}

/**
 * \brief 模型提出的单文件修改建议，可附带独立的预览片段。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeProposal {
    pub action: ProposalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    /** \brief 仅用于渲染，不参与提交。 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_content: Option<String>,
}

impl ChangeProposal {
    /**
     * \brief COMMIT 建议必须带非空 filePath 与 newContent。
     */
    pub fn is_commit_ready(&self) -> bool {
        self.action == ProposalAction::Commit
            && self.file_path.as_deref().is_some_and(has_repo_path)
            && self.new_content.as_deref().is_some_and(has_content)
    }

    /**
     * \brief 转换为提交请求；缺少提交信息时以 `Update <path>` 补齐。
     */
    pub fn to_commit_request(&self) -> Result<CommitRequest, CoreError> {
        if self.action != ProposalAction::Commit {
            return Err(CoreError::InvalidRequest(
                "proposal action is CHAT, nothing to commit".to_string(),
            ));
        }
        if !self.is_commit_ready() {
            return Err(CoreError::InvalidRequest(
                "COMMIT proposal requires non-empty filePath and newContent".to_string(),
            ));
        }
        let file_path = self.file_path.clone().unwrap_or_default();
        let commit_message = self
            .commit_message
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| format!("Update {}", file_path.trim()));
        Ok(CommitRequest {
            file_path,
            new_content: self.new_content.clone().unwrap_or_default(),
            commit_message,
        })
    }
}

/**
 * \brief 提交请求，三个字段均为必填。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub file_path: String,
    pub new_content: String,
    pub commit_message: String,
}

impl CommitRequest {
    /**
     * \brief 本地字段校验，失败时不发起任何网络请求。
     */
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut missing = Vec::new();
        if !has_repo_path(&self.file_path) {
            missing.push("file_path");
        }
        if !has_content(&self.new_content) {
            missing.push("new_content");
        }
        if self.commit_message.trim().is_empty() {
            missing.push("commit_message");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidRequest(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    /** \brief 去掉首尾空白与前导斜杠后的仓库内路径。 */
    pub fn normalized_path(&self) -> &str {
        self.file_path.trim().trim_start_matches('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Created,
    Updated,
}

impl CommitOperation {
    pub fn message(&self) -> &'static str {
        match self {
            CommitOperation::Created => "File created successfully",
            CommitOperation::Updated => "File updated successfully",
        }
    }
}

/**
 * \brief 一次提交调用的结果。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub success: bool,
    pub operation: CommitOperation,
    pub html_url: String,
}

/**
 * \brief 目标仓库坐标，单次请求内只读。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct RepoCoordinates {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub token: Option<String>,
}

impl fmt::Debug for RepoCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepoCoordinates")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish()
    }
}

/**
 * \brief 路径去掉空白与前导斜杠后仍非空。
 */
pub fn has_repo_path(path: &str) -> bool {
    !path.trim().trim_start_matches('/').is_empty()
}

/**
 * \brief 文件内容只要求非空串，纯空白也是合法内容。
 */
pub fn has_content(content: &str) -> bool {
    !content.is_empty()
}
