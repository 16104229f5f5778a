use serde_json::Value as JsonValue;

use super::common::{Block, Conversation, Message, Role};

fn item_blocks(item: &serde_json::Map<String, JsonValue>) -> Vec<Block> {
    match item.get("type").and_then(JsonValue::as_str) {
        Some("function_call") => {
            let id = item
                .get("call_id")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let name = item.get("name").and_then(JsonValue::as_str).unwrap_or_default();
            let arguments = item
                .get("arguments")
                .and_then(JsonValue::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(JsonValue::Null);
            vec![Block::ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            }]
        }
        Some("function_call_output") => {
            let tool_call_id = item
                .get("call_id")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            vec![Block::ToolResult {
                tool_call_id: tool_call_id.to_string(),
                content: item.get("output").cloned().unwrap_or(JsonValue::Null),
            }]
        }
        _ => item
            .get("content")
            .and_then(JsonValue::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| {
                        part.get("text")
                            .and_then(JsonValue::as_str)
                            .map(|text| Block::Text(text.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Reads `input` out of a Responses API request's untyped `rest` map.
pub fn to_conversation(rest: &serde_json::Map<String, JsonValue>) -> Conversation {
    let mut messages = Vec::new();

    match rest.get("input") {
        Some(JsonValue::String(text)) => messages.push(Message {
            role: Role::User,
            blocks: vec![Block::Text(text.clone())],
        }),
        Some(JsonValue::Array(items)) => {
            for item in items {
                let Some(obj) = item.as_object() else { continue };
                let role = match obj.get("role").and_then(JsonValue::as_str) {
                    Some("system") | Some("developer") => Role::System,
                    Some("assistant") => Role::Assistant,
                    _ => Role::User,
                };
                let blocks = item_blocks(obj);
                if !blocks.is_empty() {
                    messages.push(Message { role, blocks });
                }
            }
        }
        _ => {}
    }

    if let Some(instructions) = rest.get("instructions").and_then(JsonValue::as_str) {
        messages.insert(
            0,
            Message {
                role: Role::System,
                blocks: vec![Block::Text(instructions.to_string())],
            },
        );
    }

    Conversation { messages }
}

/// Writes a conversation into `input`/`instructions` on a Responses request.
pub fn write_conversation(rest: &mut serde_json::Map<String, JsonValue>, conversation: &Conversation) {
    let mut instructions = String::new();
    let mut input = Vec::new();

    for message in &conversation.messages {
        if matches!(message.role, Role::System) {
            for block in &message.blocks {
                if let Block::Text(text) = block {
                    if !instructions.is_empty() {
                        instructions.push('\n');
                    }
                    instructions.push_str(text);
                }
            }
            continue;
        }

        let role = if matches!(message.role, Role::Assistant) {
            "assistant"
        } else {
            "user"
        };

        for block in &message.blocks {
            match block {
                Block::Text(text) => input.push(serde_json::json!({
                    "role": role,
                    "content": [{"type": "input_text", "text": text}],
                })),
                Block::ToolCall { id, name, arguments } => input.push(serde_json::json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": serde_json::to_string(arguments).unwrap_or_default(),
                })),
                Block::ToolResult {
                    tool_call_id,
                    content,
                } => input.push(serde_json::json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": content,
                })),
                Block::Opaque(_) => {}
            }
        }
    }

    if !instructions.is_empty() {
        rest.insert("instructions".to_string(), JsonValue::String(instructions));
    }
    rest.insert("input".to_string(), JsonValue::Array(input));
}

pub fn content_to_blocks(output: &[JsonValue]) -> Vec<Block> {
    output
        .iter()
        .filter_map(JsonValue::as_object)
        .flat_map(item_blocks)
        .collect()
}

pub fn blocks_to_output(blocks: &[Block]) -> Vec<JsonValue> {
    let mut text = String::new();
    let mut items = Vec::new();

    for block in blocks {
        match block {
            Block::Text(t) => text.push_str(t),
            Block::ToolCall { id, name, arguments } => items.push(serde_json::json!({
                "type": "function_call",
                "call_id": id,
                "name": name,
                "arguments": serde_json::to_string(arguments).unwrap_or_default(),
            })),
            Block::ToolResult {
                tool_call_id,
                content,
            } => items.push(serde_json::json!({
                "type": "function_call_output",
                "call_id": tool_call_id,
                "output": content,
            })),
            Block::Opaque(_) => {}
        }
    }

    if !text.is_empty() {
        items.insert(
            0,
            serde_json::json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text, "annotations": []}],
            }),
        );
    }

    items
}
