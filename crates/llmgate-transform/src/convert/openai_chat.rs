use serde_json::Value as JsonValue;

use super::common::{Block, Conversation, Message, Role};

fn content_blocks(content: &JsonValue) -> Vec<Block> {
    match content {
        JsonValue::String(text) => vec![Block::Text(text.clone())],
        JsonValue::Array(parts) => parts
            .iter()
            .filter_map(|part| {
                part.as_object().and_then(|obj| {
                    obj.get("text")
                        .and_then(JsonValue::as_str)
                        .map(|text| Block::Text(text.to_string()))
                })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Reads `messages` out of a chat-completions request's untyped `rest` map.
pub fn to_conversation(rest: &serde_json::Map<String, JsonValue>) -> Conversation {
    let mut messages = Vec::new();

    if let Some(items) = rest.get("messages").and_then(JsonValue::as_array) {
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            let role = match obj.get("role").and_then(JsonValue::as_str) {
                Some("system") | Some("developer") => Role::System,
                Some("assistant") => Role::Assistant,
                _ => Role::User,
            };

            let mut blocks = obj
                .get("content")
                .map(content_blocks)
                .unwrap_or_default();

            if let Some(tool_calls) = obj.get("tool_calls").and_then(JsonValue::as_array) {
                for tool_call in tool_calls {
                    let Some(tc) = tool_call.as_object() else { continue };
                    let id = tc.get("id").and_then(JsonValue::as_str).unwrap_or_default();
                    let function = tc.get("function").and_then(JsonValue::as_object);
                    let name = function
                        .and_then(|f| f.get("name"))
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default();
                    let arguments = function
                        .and_then(|f| f.get("arguments"))
                        .and_then(JsonValue::as_str)
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(JsonValue::Null);
                    blocks.push(Block::ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments,
                    });
                }
            }

            if let Some(tool_call_id) = obj.get("tool_call_id").and_then(JsonValue::as_str) {
                blocks.push(Block::ToolResult {
                    tool_call_id: tool_call_id.to_string(),
                    content: obj.get("content").cloned().unwrap_or(JsonValue::Null),
                });
            }

            messages.push(Message { role, blocks });
        }
    }

    Conversation { messages }
}

/// Writes a conversation into `messages` on a chat-completions request body.
pub fn write_conversation(rest: &mut serde_json::Map<String, JsonValue>, conversation: &Conversation) {
    let messages: Vec<JsonValue> = conversation
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::Assistant => "assistant",
                Role::User => "user",
            };

            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in &message.blocks {
                match block {
                    Block::Text(t) => text.push_str(t),
                    Block::ToolCall { id, name, arguments } => tool_calls.push(serde_json::json!({
                        "id": id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": serde_json::to_string(arguments).unwrap_or_default(),
                        },
                    })),
                    Block::ToolResult { .. } | Block::Opaque(_) => {}
                }
            }

            let mut entry = serde_json::json!({"role": role, "content": text});
            if !tool_calls.is_empty()
                && let Some(obj) = entry.as_object_mut()
            {
                obj.insert("tool_calls".to_string(), JsonValue::Array(tool_calls));
            }
            entry
        })
        .collect();

    rest.insert("messages".to_string(), JsonValue::Array(messages));
}

pub fn content_to_blocks(choices: &[JsonValue]) -> Vec<Block> {
    let Some(first) = choices.first() else {
        return Vec::new();
    };
    let message = first.get("message").or_else(|| first.get("delta"));
    let Some(message) = message.and_then(JsonValue::as_object) else {
        return Vec::new();
    };

    let mut blocks = message
        .get("content")
        .map(content_blocks)
        .unwrap_or_default();

    if let Some(tool_calls) = message.get("tool_calls").and_then(JsonValue::as_array) {
        for tool_call in tool_calls {
            let Some(tc) = tool_call.as_object() else { continue };
            let id = tc.get("id").and_then(JsonValue::as_str).unwrap_or_default();
            let function = tc.get("function").and_then(JsonValue::as_object);
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let arguments = function
                .and_then(|f| f.get("arguments"))
                .and_then(JsonValue::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(JsonValue::Null);
            blocks.push(Block::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            });
        }
    }

    blocks
}

pub fn blocks_to_choices(blocks: &[Block], finish_reason: &str) -> Vec<JsonValue> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block {
            Block::Text(t) => text.push_str(t),
            Block::ToolCall { id, name, arguments } => tool_calls.push(serde_json::json!({
                "id": id,
                "type": "function",
                "function": {
                    "name": name,
                    "arguments": serde_json::to_string(arguments).unwrap_or_default(),
                },
            })),
            Block::ToolResult { .. } | Block::Opaque(_) => {}
        }
    }

    let mut message = serde_json::json!({"role": "assistant", "content": text});
    if !tool_calls.is_empty()
        && let Some(obj) = message.as_object_mut()
    {
        obj.insert("tool_calls".to_string(), JsonValue::Array(tool_calls));
    }

    vec![serde_json::json!({
        "index": 0,
        "message": message,
        "finish_reason": finish_reason,
    })]
}
