//! 提示协议：在只会返回文本的 LlmClient 之上实现三种补全模式
//!
//! - Text：原样返回
//! - Structured：把 JSON Schema 拼入 system，回复中提取第一个 JSON 块
//! - ToolChoice：列出工具与调用格式；回复若为 `{"tool": "...", "args": {...}}` 则为工具调用，否则视为最终回答

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{
    CompletionClient, CompletionMode, CompletionRequest, CompletionResponse, LlmClient, LlmError, Message,
    ToolCall,
};
use crate::tools::{tool_call_schema_json, ToolSpec};

/// 解析失败时写入错误信息的回复预览长度
const REPLY_PREVIEW_CHARS: usize = 200;

pub struct PromptedCompletion {
    llm: Arc<dyn LlmClient>,
}

impl PromptedCompletion {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl CompletionClient for PromptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let messages = build_messages(request);
        let raw = self.llm.complete(&messages).await?;

        match &request.mode {
            CompletionMode::Text => Ok(CompletionResponse::Text(raw.trim().to_string())),
            CompletionMode::Structured { name, .. } => {
                let block = extract_json_block(&raw)
                    .ok_or_else(|| LlmError::MalformedResponse(format!("no JSON {name} in: {}", preview(&raw))))?;
                serde_json::from_str(block)
                    .map(CompletionResponse::Structured)
                    .map_err(|e| LlmError::MalformedResponse(format!("{name}: {e}: {}", preview(block))))
            }
            CompletionMode::ToolChoice { .. } => parse_tool_reply(&raw),
        }
    }
}

fn build_messages(request: &CompletionRequest) -> Vec<Message> {
    let mut system = request.system.clone().unwrap_or_default();
    match &request.mode {
        CompletionMode::Text => {}
        CompletionMode::Structured { name, schema } => {
            let schema = serde_json::to_string_pretty(schema).unwrap_or_default();
            system.push_str(&format!(
                "\n\n## Output format\nReply with ONLY one JSON value ({name}) matching this JSON Schema, \
                 no Markdown and no explanation:\n```json\n{schema}\n```"
            ));
        }
        CompletionMode::ToolChoice { tools } => {
            system.push_str(&tool_choice_instructions(tools));
        }
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !system.trim().is_empty() {
        messages.push(Message::system(system.trim_start().to_string()));
    }
    messages.extend(request.messages.iter().cloned());
    messages
}

fn tool_choice_instructions(tools: &[ToolSpec]) -> String {
    let mut out = String::from("\n\n## Available tools\n");
    if tools.is_empty() {
        out.push_str("(none)\n");
    }
    for spec in tools {
        out.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            spec.name, spec.description, spec.parameters
        ));
    }
    out.push_str(&format!(
        "\n## Tool call JSON Schema\n```json\n{}\n```\n\
         To call a tool reply with ONLY one JSON object: {{\"tool\": \"<name>\", \"args\": {{...}}}}.\n\
         When you have enough information, reply with the final answer as plain text (no JSON).",
        tool_call_schema_json()
    ));
    out
}

/// 解析工具选择模式的回复：合法且 tool 非空的 JSON 为工具调用，纯文本为最终回答
pub fn parse_tool_reply(output: &str) -> Result<CompletionResponse, LlmError> {
    let trimmed = output.trim();
    let Some(json_str) = extract_json_block(trimmed) else {
        return Ok(CompletionResponse::Text(trimmed.to_string()));
    };

    match serde_json::from_str::<ToolCall>(json_str) {
        Ok(call) if !call.tool.trim().is_empty() => Ok(CompletionResponse::ToolCall(call)),
        Ok(_) => Ok(CompletionResponse::Text(trimmed.to_string())),
        // 明显是想调用工具但 JSON 不合法
        Err(e) if json_str.contains("\"tool\"") => Err(LlmError::MalformedResponse(format!(
            "{e}: {}",
            preview(json_str)
        ))),
        Err(_) => Ok(CompletionResponse::Text(trimmed.to_string())),
    }
}

/// 提取 JSON 块（```json ... ``` 或首个 `{`/`[` 到最后一个对应闭合符）
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim());
        return (!block.is_empty()).then_some(block);
    }

    let obj = trimmed.find('{').zip(trimmed.rfind('}'));
    let arr = trimmed.find('[').zip(trimmed.rfind(']'));
    let (start, end) = match (obj, arr) {
        (Some(o), Some(a)) => {
            if a.0 < o.0 {
                a
            } else {
                o
            }
        }
        (Some(o), None) => o,
        (None, Some(a)) => a,
        (None, None) => return None,
    };
    (start < end).then(|| &trimmed[start..=end])
}

fn preview(s: &str) -> String {
    if s.chars().count() > REPLY_PREVIEW_CHARS {
        format!("{}...", s.chars().take(REPLY_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// 记录收到的消息并返回固定回复
    struct FixedLlm {
        reply: String,
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
            self.seen.lock().unwrap().extend(messages.iter().cloned());
            Ok(self.reply.clone())
        }
    }

    fn client(reply: &str) -> (PromptedCompletion, Arc<FixedLlm>) {
        let llm = Arc::new(FixedLlm {
            reply: reply.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        (PromptedCompletion::new(llm.clone()), llm)
    }

    #[test]
    fn test_parse_tool_call() {
        let out = parse_tool_reply(r#"{"tool": "slowlog", "args": {"count": 10}}"#).unwrap();
        assert_eq!(
            out,
            CompletionResponse::ToolCall(ToolCall::new("slowlog", json!({"count": 10})))
        );
    }

    #[test]
    fn test_parse_fenced_tool_call() {
        let out = parse_tool_reply("Let me check.\n```json\n{\"tool\": \"info\", \"args\": {}}\n```").unwrap();
        assert!(matches!(out, CompletionResponse::ToolCall(c) if c.tool == "info"));
    }

    #[test]
    fn test_plain_text_is_final_answer() {
        let out = parse_tool_reply("Memory usage is healthy.").unwrap();
        assert_eq!(out, CompletionResponse::Text("Memory usage is healthy.".into()));
    }

    #[test]
    fn test_broken_tool_json_is_malformed() {
        let err = parse_tool_reply(r#"{"tool": "info", "args": }"#).unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[test]
    fn test_extract_json_prefers_outermost() {
        assert_eq!(extract_json_block("x [1, {\"a\": 2}] y"), Some("[1, {\"a\": 2}]"));
        assert_eq!(extract_json_block("no json here"), None);
    }

    #[tokio::test]
    async fn test_structured_mode_parses_and_injects_schema() {
        let (completion, llm) = client("Here you go: {\"strategy\": \"deep\"}");
        let req = CompletionRequest::structured("classify", "classification", json!({"type": "object"}));
        let out = completion.complete(&req).await.unwrap();
        assert_eq!(out, CompletionResponse::Structured(json!({"strategy": "deep"})));

        let seen = llm.seen.lock().unwrap();
        assert!(seen[0].content.contains("JSON Schema"));
    }

    #[tokio::test]
    async fn test_structured_mode_without_json_is_malformed() {
        let (completion, _) = client("I cannot answer");
        let req = CompletionRequest::structured("classify", "classification", json!({}));
        assert!(matches!(
            completion.complete(&req).await,
            Err(LlmError::MalformedResponse(_))
        ));
    }
}
