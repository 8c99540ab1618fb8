use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::error::CoreError;
use crate::models::{ConversationTurn, ModelConfig, ProviderKind, Role};
use crate::telemetry;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 8192;
const GEMINI_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone)]
struct Backend {
    api_base: String,
    api_key: Option<String>,
}

/**
 * \brief 多后端文本生成客户端：按 ModelConfig.provider_kind 分发，统一输出原始文本。
 * \details 每次调用只尝试一次，不做重试。
 */
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    gemini: Backend,
    openai: Backend,
    anthropic: Backend,
}

impl ProviderClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            gemini: Backend {
                api_base: config.gemini_api_base.clone(),
                api_key: config.gemini_api_key.clone(),
            },
            openai: Backend {
                api_base: config.openai_api_base.clone(),
                api_key: config.openai_api_key.clone(),
            },
            anthropic: Backend {
                api_base: config.anthropic_api_base.clone(),
                api_key: config.anthropic_api_key.clone(),
            },
        }
    }

    fn backend(&self, kind: ProviderKind) -> &Backend {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        }
    }

    /**
     * \brief 查询指定 Provider 的凭据是否已配置。
     */
    pub fn has_credential(&self, kind: ProviderKind) -> bool {
        self.backend(kind).api_key.is_some()
    }

    /**
     * \brief 发送一轮对话，返回模型原始文本（期望内含一个 JSON 文档）。
     * \param system_instruction 系统提示词
     * \param history 既往会话
     * \param new_message 本轮用户输入
     * \param model 所选模型
     */
    pub async fn send(
        &self,
        system_instruction: &str,
        history: &[ConversationTurn],
        new_message: &str,
        model: &ModelConfig,
    ) -> Result<String, CoreError> {
        let backend = self.backend(model.provider_kind);
        let api_key = backend
            .api_key
            .as_deref()
            .ok_or_else(|| {
                CoreError::MissingCredential(model.provider_kind.credential_name().to_string())
            })?;

        let mut turns = history.to_vec();
        turns.push(ConversationTurn::user(new_message));

        telemetry::log_event(
            "llm.send",
            &format!(
                "provider={} model={} turns={}",
                model.provider_kind,
                model.id,
                turns.len()
            ),
        );

        let result = match model.provider_kind {
            ProviderKind::OpenAi => {
                chat_once_openai(
                    &self.http,
                    &backend.api_base,
                    api_key,
                    &model.id,
                    system_instruction,
                    &turns,
                )
                .await
            }
            ProviderKind::Anthropic => {
                chat_once_claude(
                    &self.http,
                    &backend.api_base,
                    api_key,
                    &model.id,
                    system_instruction,
                    &turns,
                )
                .await
            }
            ProviderKind::Gemini => {
                chat_once_gemini(
                    &self.http,
                    &backend.api_base,
                    api_key,
                    &model.id,
                    system_instruction,
                    &turns,
                )
                .await
            }
        };

        if let Err(e) = &result {
            telemetry::log_error(
                "llm.send",
                &format!("provider={} model={} kind={} err={}", model.provider_kind, model.id, e.kind(), e),
            );
        }
        result
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

async fn chat_once_openai(
    http: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    system_instruction: &str,
    turns: &[ConversationTurn],
) -> Result<String, CoreError> {
    let url = format!("{}/v1/chat/completions", api_base.trim_end_matches('/'));
    let body = json!({
        "model": model,
        "messages": openai_payload(system_instruction, turns),
        "response_format": {"type": "json_object"},
        "stream": false
    });

    let resp = http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await?;

    let parsed: OpenAiResponse = decode_success(resp, "openai").await?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default())
}

async fn chat_once_claude(
    http: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    system_instruction: &str,
    turns: &[ConversationTurn],
) -> Result<String, CoreError> {
    let url = format!("{}/v1/messages", api_base.trim_end_matches('/'));
    let mut body = json!({
        "model": model,
        "max_tokens": ANTHROPIC_MAX_TOKENS,
        "messages": anthropic_payload(turns),
    });
    if !system_instruction.is_empty() {
        body["system"] = json!(system_instruction);
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        "x-api-key",
        HeaderValue::from_str(api_key)
            .map_err(|_| CoreError::MissingCredential("ANTHROPIC_API_KEY is not a valid header value".to_string()))?,
    );
    headers.insert(
        "anthropic-version",
        HeaderValue::from_static(ANTHROPIC_VERSION),
    );

    let resp = http.post(url).headers(headers).json(&body).send().await?;
    let parsed: AnthropicResponse = decode_success(resp, "anthropic").await?;
    Ok(parsed
        .content
        .into_iter()
        .filter(|b| b.kind.is_empty() || b.kind == "text")
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join(""))
}

async fn chat_once_gemini(
    http: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    model: &str,
    system_instruction: &str,
    turns: &[ConversationTurn],
) -> Result<String, CoreError> {
    let base = normalize_gemini_base(api_base);
    let url = format!("{}/models/{}:generateContent", base, model);

    let mut body = json!({
        "contents": gemini_payload(turns),
        "generationConfig": {"responseMimeType": "application/json"},
    });
    if !system_instruction.is_empty() {
        body["system_instruction"] = json!({
            "parts": [{"text": system_instruction}]
        });
    }

    let resp = http
        .post(url)
        .header(GEMINI_KEY_HEADER, api_key)
        .json(&body)
        .send()
        .await?;

    let parsed: GeminiResponse = decode_success(resp, "gemini").await?;
    Ok(parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default())
}

/**
 * \brief 校验状态码并把响应体解码为指定 Provider 的结构。
 */
async fn decode_success<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    provider: &str,
) -> Result<T, CoreError> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(CoreError::Upstream {
            status: status.as_u16(),
            message: upstream_message(&text),
        });
    }
    serde_json::from_str(&text)
        .map_err(|e| CoreError::MalformedResponse(format!("{} payload: {}", provider, e)))
}

/**
 * \brief 提取上游错误体中的 `error.message` / `message`，否则返回原文。
 */
pub(crate) fn upstream_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let found = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(|m| m.as_str())
            .map(|s| s.to_string())
    });
    match found {
        Some(msg) => msg,
        None if body.trim().is_empty() => "empty response body".to_string(),
        None => body.trim().to_string(),
    }
}

fn openai_payload(system_instruction: &str, turns: &[ConversationTurn]) -> Vec<Value> {
    let mut items = Vec::with_capacity(turns.len() + 1);
    if !system_instruction.is_empty() {
        items.push(json!({"role": "system", "content": system_instruction}));
    }
    for turn in turns {
        let role = match turn.role {
            Role::User => "user",
            Role::Model => "assistant",
        };
        items.push(json!({"role": role, "content": turn.text}));
    }
    items
}

fn anthropic_payload(turns: &[ConversationTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| {
            let role = match turn.role {
                Role::User => "user",
                Role::Model => "assistant",
            };
            json!({
                "role": role,
                "content": [{"type": "text", "text": turn.text}]
            })
        })
        .collect()
}

fn gemini_payload(turns: &[ConversationTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role.as_str(),
                "parts": [{"text": turn.text}]
            })
        })
        .collect()
}

fn normalize_gemini_base(api_base: &str) -> String {
    let trimmed = api_base.trim_end_matches('/');
    if trimmed.ends_with("/v1")
        || trimmed.ends_with("/v1beta")
        || trimmed.contains("/v1/")
        || trimmed.contains("/v1beta/")
    {
        trimmed.to_string()
    } else {
        format!("{}/v1beta", trimmed)
    }
}
