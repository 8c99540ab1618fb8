use crate::config::Config;
use crate::error::CoreError;
use crate::github::CommitGateway;
use crate::llm::ProviderClient;
use crate::models::{AIResponse, ChangeProposal, CommitResult, ConversationTurn, ModelConfig, RepoCoordinates};
use crate::{parser, telemetry};

/** \brief 附加到提示词中的仓库文件数量上限。 */
const MAX_CONTEXT_FILES: usize = 400;

/**
 * \brief 单轮对话编排：组装提示词 → 调用 Provider → 解析；提交需调用方单独确认。
 */
#[derive(Debug, Clone)]
pub struct Orchestrator {
    provider: ProviderClient,
    gateway: CommitGateway,
    system_instruction: String,
}

impl Orchestrator {
    pub fn new(config: &Config) -> Self {
        Self {
            provider: ProviderClient::new(config),
            gateway: CommitGateway::new(config),
            system_instruction: config.system_instruction.clone(),
        }
    }

    pub fn provider(&self) -> &ProviderClient {
        &self.provider
    }

    pub fn gateway(&self) -> &CommitGateway {
        &self.gateway
    }

    /**
     * \brief 发起一轮对话；Provider 侧的任何错误都转为可展示的回复，不向上抛出。
     */
    pub async fn converse(
        &self,
        history: &[ConversationTurn],
        new_message: &str,
        model: &ModelConfig,
    ) -> AIResponse {
        self.converse_with_files(history, new_message, model, &[])
            .await
    }

    /**
     * \brief 同 converse，并把仓库文件列表作为上下文附加到系统提示词。
     */
    pub async fn converse_with_files(
        &self,
        history: &[ConversationTurn],
        new_message: &str,
        model: &ModelConfig,
        files: &[String],
    ) -> AIResponse {
        let system_instruction = build_system_instruction(&self.system_instruction, files);
        match self
            .provider
            .send(&system_instruction, history, new_message, model)
            .await
        {
            Ok(raw) => {
                let response = parser::parse(&raw);
                telemetry::log_event(
                    "orchestrator",
                    &format!(
                        "model={} reply_len={} proposal={}",
                        model.id,
                        response.text.len(),
                        response.structured_data.is_some()
                    ),
                );
                response
            }
            Err(e) => {
                telemetry::log_error(
                    "orchestrator",
                    &format!("model={} provider failure absorbed: {}", model.id, e),
                );
                AIResponse::plain(format!("Error ({}): {}", model.provider_kind, e))
            }
        }
    }

    /**
     * \brief 用户确认后提交建议；错误原样返回给调用方。
     */
    pub async fn confirm_and_commit(
        &self,
        proposal: &ChangeProposal,
        coords: &RepoCoordinates,
    ) -> Result<CommitResult, CoreError> {
        let request = proposal.to_commit_request()?;
        self.gateway.commit(&request, coords).await
    }
}

/**
 * \brief 组装系统提示词，可选附加仓库文件列表。
 */
pub fn build_system_instruction(base: &str, files: &[String]) -> String {
    if files.is_empty() {
        return base.to_string();
    }
    let mut out = String::with_capacity(base.len() + files.len() * 24);
    out.push_str(base);
    out.push_str("\n\nFiles currently in the repository:\n");
    for path in files.iter().take(MAX_CONTEXT_FILES) {
        out.push_str("- ");
        out.push_str(path);
        out.push('\n');
    }
    if files.len() > MAX_CONTEXT_FILES {
        out.push_str(&format!("... and {} more\n", files.len() - MAX_CONTEXT_FILES));
    }
    out
}
