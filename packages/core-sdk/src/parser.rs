use serde_json::Value;

use crate::models::{AIResponse, ChangeProposal};
use crate::telemetry;

/** \brief 模型 JSON 中缺少 text 字段时使用的默认回复。 */
pub const DEFAULT_REPLY_TEXT: &str = "Here is the code.";

const FENCE: &str = "```";

/**
 * \brief 去掉首行与末行的代码围栏（不论语言标签），各最多一行。
 */
pub fn strip_fences(raw: &str) -> String {
    let mut lines: Vec<&str> = raw.trim().lines().collect();
    if lines
        .first()
        .map(|l| l.trim_start().starts_with(FENCE))
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    if lines
        .last()
        .map(|l| l.trim().starts_with(FENCE))
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n")
}

/**
 * \brief 将 Provider 原始文本解析为 AIResponse，永不失败。
 * \details 解码失败时原样返回未清洗的输入作为纯文本回复；
 *          structuredData 缺失或结构不合法时视为 None，不做部分信任。
 */
pub fn parse(raw: &str) -> AIResponse {
    let cleaned = strip_fences(raw);
    let value: Value = match serde_json::from_str(&cleaned) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => {
            telemetry::log_event("parser", "decoded value is not an object, using raw text");
            return AIResponse::plain(raw);
        }
        Err(e) => {
            telemetry::log_event("parser", &format!("not a JSON document ({}), using raw text", e));
            return AIResponse::plain(raw);
        }
    };

    let text = value
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_REPLY_TEXT.to_string());

    let structured_data = match value.get("structuredData") {
        None | Some(Value::Null) => None,
        Some(data) => match serde_json::from_value::<ChangeProposal>(data.clone()) {
            Ok(proposal) => Some(proposal),
            Err(e) => {
                telemetry::log_event("parser", &format!("dropping malformed structuredData: {}", e));
                None
            }
        },
    };

    AIResponse {
        text,
        structured_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProposalAction;

    const BODY: &str = r#"{"text":"Added a header.","structuredData":{"action":"COMMIT","filePath":"index.html","commitMessage":"Add header","newContent":"<h1>Hi</h1>","previewContent":"<h1>Hi</h1>"}}"#;

    #[test]
    fn test_parse_plain_json() {
        let resp = parse(BODY);
        assert_eq!(resp.text, "Added a header.");
        let proposal = resp.structured_data.expect("proposal");
        assert_eq!(proposal.action, ProposalAction::Commit);
        assert_eq!(proposal.file_path.as_deref(), Some("index.html"));
        assert_eq!(proposal.commit_message.as_deref(), Some("Add header"));
    }

    #[test]
    fn test_fences_with_any_label_or_none() {
        for open in ["```json", "```", "```JSON  ", "```javascript"] {
            let raw = format!("{}\n{}\n```", open, BODY);
            let resp = parse(&raw);
            assert_eq!(resp.text, "Added a header.", "label {:?}", open);
            assert!(resp.structured_data.is_some());
        }
    }

    #[test]
    fn test_strip_fences_only_one_line_each_side() {
        let raw = "```json\n```\n{}\n```\n```";
        assert_eq!(strip_fences(raw), "```\n{}\n```");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_fences("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_invalid_json_returns_original_input() {
        for raw in [
            "Sure, here you go!",
            "```json\n{\"text\": \"unterminated\n```",
            "{\"text\": 1,,}",
            "",
        ] {
            let resp = parse(raw);
            assert_eq!(resp.text, raw);
            assert!(resp.structured_data.is_none());
        }
    }

    #[test]
    fn test_non_object_json_is_plain_text() {
        let resp = parse("[1, 2, 3]");
        assert_eq!(resp.text, "[1, 2, 3]");
        assert!(resp.structured_data.is_none());
    }

    #[test]
    fn test_missing_fields_get_defaults() {
        let resp = parse(r#"{"structuredData": null}"#);
        assert_eq!(resp.text, DEFAULT_REPLY_TEXT);
        assert!(resp.structured_data.is_none());

        let resp = parse(r#"{"text": "only chat"}"#);
        assert_eq!(resp.text, "only chat");
        assert!(resp.structured_data.is_none());
    }

    #[test]
    fn test_malformed_structured_data_is_dropped_entirely() {
        for data in [
            r#""COMMIT""#,
            r#"{"filePath": "a.txt", "newContent": "x"}"#,
            r#"{"action": "DELETE", "filePath": "a.txt"}"#,
            r#"{"action": "COMMIT", "filePath": 42}"#,
        ] {
            let raw = format!(r#"{{"text": "t", "structuredData": {}}}"#, data);
            let resp = parse(&raw);
            assert_eq!(resp.text, "t");
            assert!(resp.structured_data.is_none(), "data {}", data);
        }
    }
}
