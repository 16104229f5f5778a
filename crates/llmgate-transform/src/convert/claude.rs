use serde_json::Value as JsonValue;

use super::common::{block_from_value, block_to_claude, Block, Conversation, Message, Role};

/// Reads `system` + `messages` out of a Claude request's untyped `rest` map.
pub fn to_conversation(rest: &serde_json::Map<String, JsonValue>) -> Conversation {
    let mut messages = Vec::new();

    if let Some(system) = rest.get("system") {
        let blocks = match system {
            JsonValue::String(text) => vec![Block::Text(text.clone())],
            JsonValue::Array(blocks) => blocks.iter().map(block_from_value).collect(),
            _ => Vec::new(),
        };
        if !blocks.is_empty() {
            messages.push(Message {
                role: Role::System,
                blocks,
            });
        }
    }

    if let Some(items) = rest.get("messages").and_then(JsonValue::as_array) {
        for item in items {
            let Some(obj) = item.as_object() else { continue };
            let role = match obj.get("role").and_then(JsonValue::as_str) {
                Some("assistant") => Role::Assistant,
                _ => Role::User,
            };
            let blocks = match obj.get("content") {
                Some(JsonValue::String(text)) => vec![Block::Text(text.clone())],
                Some(JsonValue::Array(blocks)) => blocks.iter().map(block_from_value).collect(),
                _ => Vec::new(),
            };
            messages.push(Message { role, blocks });
        }
    }

    Conversation { messages }
}

/// Writes a conversation into `system` + `messages` on a Claude request body.
pub fn write_conversation(rest: &mut serde_json::Map<String, JsonValue>, conversation: &Conversation) {
    let mut system_text = String::new();
    let mut messages = Vec::new();

    for message in &conversation.messages {
        match message.role {
            Role::System => {
                for block in &message.blocks {
                    if let Block::Text(text) = block {
                        if !system_text.is_empty() {
                            system_text.push('\n');
                        }
                        system_text.push_str(text);
                    }
                }
            }
            Role::User | Role::Assistant => {
                let role = if matches!(message.role, Role::Assistant) {
                    "assistant"
                } else {
                    "user"
                };
                let content: Vec<JsonValue> = message.blocks.iter().map(block_to_claude).collect();
                messages.push(serde_json::json!({"role": role, "content": content}));
            }
        }
    }

    if !system_text.is_empty() {
        rest.insert("system".to_string(), JsonValue::String(system_text));
    }
    rest.insert("messages".to_string(), JsonValue::Array(messages));
}

/// Best-effort text + tool-call extraction from a Claude response's opaque
/// `content` array, for building the destination's minimal content.
pub fn content_to_blocks(content: &[JsonValue]) -> Vec<Block> {
    content.iter().map(block_from_value).collect()
}

pub fn blocks_to_content(blocks: &[Block]) -> Vec<JsonValue> {
    blocks.iter().map(block_to_claude).collect()
}
