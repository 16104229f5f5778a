use serde_json::Value as JsonValue;

/// A single turn of a conversation, normalized across the four wire formats.
/// `blocks` holds only what the converter can recognize generically (plain
/// text, a tool call, a tool result); anything else is kept as `Opaque` so it
/// round-trips through formats that happen to share shape, without the
/// gateway ever interpreting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub enum Block {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        arguments: JsonValue,
    },
    ToolResult {
        tool_call_id: String,
        content: JsonValue,
    },
    Opaque(JsonValue),
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn text_only(&self) -> String {
        self.messages
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b {
                Block::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn block_from_value(value: &JsonValue) -> Block {
    let Some(obj) = value.as_object() else {
        return Block::Opaque(value.clone());
    };

    let kind = obj.get("type").and_then(JsonValue::as_str);

    match kind {
        Some("text") => obj
            .get("text")
            .and_then(JsonValue::as_str)
            .map(|text| Block::Text(text.to_string()))
            .unwrap_or_else(|| Block::Opaque(value.clone())),
        Some("tool_use") | Some("function_call") => {
            let id = obj
                .get("id")
                .or_else(|| obj.get("call_id"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let name = obj
                .get("name")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = obj
                .get("input")
                .or_else(|| obj.get("arguments"))
                .cloned()
                .unwrap_or(JsonValue::Null);
            Block::ToolCall {
                id,
                name,
                arguments,
            }
        }
        Some("tool_result") | Some("function_call_output") => {
            let tool_call_id = obj
                .get("tool_use_id")
                .or_else(|| obj.get("call_id"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let content = obj
                .get("content")
                .or_else(|| obj.get("output"))
                .cloned()
                .unwrap_or(JsonValue::Null);
            Block::ToolResult {
                tool_call_id,
                content,
            }
        }
        _ => Block::Opaque(value.clone()),
    }
}

pub fn block_to_claude(block: &Block) -> JsonValue {
    match block {
        Block::Text(text) => serde_json::json!({"type": "text", "text": text}),
        Block::ToolCall {
            id,
            name,
            arguments,
        } => serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": arguments}),
        Block::ToolResult {
            tool_call_id,
            content,
        } => serde_json::json!({"type": "tool_result", "tool_use_id": tool_call_id, "content": content}),
        Block::Opaque(value) => value.clone(),
    }
}

pub fn block_to_openai_chat(block: &Block) -> JsonValue {
    match block {
        Block::Text(text) => JsonValue::String(text.clone()),
        Block::ToolCall {
            id,
            name,
            arguments,
        } => serde_json::json!({
            "id": id,
            "type": "function",
            "function": {
                "name": name,
                "arguments": serde_json::to_string(arguments).unwrap_or_default(),
            },
        }),
        Block::ToolResult { content, .. } => content.clone(),
        Block::Opaque(value) => value.clone(),
    }
}

pub fn block_to_openai_response(block: &Block) -> JsonValue {
    match block {
        Block::Text(text) => serde_json::json!({"type": "output_text", "text": text, "annotations": []}),
        Block::ToolCall {
            id,
            name,
            arguments,
        } => serde_json::json!({
            "type": "function_call",
            "call_id": id,
            "name": name,
            "arguments": serde_json::to_string(arguments).unwrap_or_default(),
        }),
        Block::ToolResult {
            tool_call_id,
            content,
        } => serde_json::json!({"type": "function_call_output", "call_id": tool_call_id, "output": content}),
        Block::Opaque(value) => value.clone(),
    }
}

pub fn block_to_gemini_part(block: &Block) -> JsonValue {
    match block {
        Block::Text(text) => serde_json::json!({"text": text}),
        Block::ToolCall { id, name, arguments } => {
            serde_json::json!({"functionCall": {"id": id, "name": name, "args": arguments}})
        }
        Block::ToolResult {
            tool_call_id,
            content,
        } => serde_json::json!({"functionResponse": {"id": tool_call_id, "name": tool_call_id, "response": content}}),
        Block::Opaque(value) => value.clone(),
    }
}
