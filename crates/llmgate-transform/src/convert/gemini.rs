use serde_json::Value as JsonValue;

use super::common::{Block, Conversation, Message, Role};

fn parts_to_blocks(parts: &[JsonValue]) -> Vec<Block> {
    parts
        .iter()
        .map(|part| {
            let Some(obj) = part.as_object() else {
                return Block::Opaque(part.clone());
            };
            if let Some(text) = obj.get("text").and_then(JsonValue::as_str) {
                return Block::Text(text.to_string());
            }
            if let Some(call) = obj.get("functionCall").and_then(JsonValue::as_object) {
                return Block::ToolCall {
                    id: call
                        .get("id")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    name: call
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: call.get("args").cloned().unwrap_or(JsonValue::Null),
                };
            }
            if let Some(response) = obj.get("functionResponse").and_then(JsonValue::as_object) {
                return Block::ToolResult {
                    tool_call_id: response
                        .get("id")
                        .or_else(|| response.get("name"))
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    content: response.get("response").cloned().unwrap_or(JsonValue::Null),
                };
            }
            Block::Opaque(part.clone())
        })
        .collect()
}

fn blocks_to_parts(blocks: &[Block]) -> Vec<JsonValue> {
    blocks
        .iter()
        .map(|block| match block {
            Block::Text(text) => serde_json::json!({"text": text}),
            Block::ToolCall { id, name, arguments } => {
                serde_json::json!({"functionCall": {"id": id, "name": name, "args": arguments}})
            }
            Block::ToolResult {
                tool_call_id,
                content,
            } => serde_json::json!({
                "functionResponse": {"id": tool_call_id, "name": tool_call_id, "response": content},
            }),
            Block::Opaque(value) => value.clone(),
        })
        .collect()
}

/// Reads `contents`/`systemInstruction` out of a Gemini request's untyped
/// `rest` map.
pub fn to_conversation(rest: &serde_json::Map<String, JsonValue>) -> Conversation {
    let mut messages = Vec::new();

    if let Some(parts) = rest
        .get("systemInstruction")
        .and_then(|v| v.get("parts"))
        .and_then(JsonValue::as_array)
    {
        let blocks = parts_to_blocks(parts);
        if !blocks.is_empty() {
            messages.push(Message {
                role: Role::System,
                blocks,
            });
        }
    }

    if let Some(contents) = rest.get("contents").and_then(JsonValue::as_array) {
        for content in contents {
            let Some(obj) = content.as_object() else { continue };
            let role = match obj.get("role").and_then(JsonValue::as_str) {
                Some("model") => Role::Assistant,
                _ => Role::User,
            };
            let parts = obj.get("parts").and_then(JsonValue::as_array);
            let blocks = parts.map(|p| parts_to_blocks(p)).unwrap_or_default();
            messages.push(Message { role, blocks });
        }
    }

    Conversation { messages }
}

/// Writes a conversation into `contents`/`systemInstruction` on a Gemini
/// request body.
pub fn write_conversation(rest: &mut serde_json::Map<String, JsonValue>, conversation: &Conversation) {
    let mut system_blocks = Vec::new();
    let mut contents = Vec::new();

    for message in &conversation.messages {
        match message.role {
            Role::System => system_blocks.extend(message.blocks.iter().cloned()),
            Role::User | Role::Assistant => {
                let role = if matches!(message.role, Role::Assistant) {
                    "model"
                } else {
                    "user"
                };
                contents.push(serde_json::json!({
                    "role": role,
                    "parts": blocks_to_parts(&message.blocks),
                }));
            }
        }
    }

    if !system_blocks.is_empty() {
        rest.insert(
            "systemInstruction".to_string(),
            serde_json::json!({"parts": blocks_to_parts(&system_blocks)}),
        );
    }
    rest.insert("contents".to_string(), JsonValue::Array(contents));
}

pub fn content_to_blocks(candidates: &[JsonValue]) -> Vec<Block> {
    let Some(first) = candidates.first() else {
        return Vec::new();
    };
    first
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(JsonValue::as_array)
        .map(|p| parts_to_blocks(p))
        .unwrap_or_default()
}

pub fn blocks_to_candidates(blocks: &[Block], finish_reason: &str) -> Vec<JsonValue> {
    vec![serde_json::json!({
        "index": 0,
        "content": {"role": "model", "parts": blocks_to_parts(blocks)},
        "finishReason": finish_reason,
    })]
}
