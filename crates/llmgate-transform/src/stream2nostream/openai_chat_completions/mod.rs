use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use llmgate_protocol::openai::create_chat_completions::response::{
    ChatCompletionObjectType, CompletionUsage, CreateChatCompletionResponse,
};
use llmgate_protocol::openai::create_chat_completions::stream::CreateChatCompletionStreamResponse;

#[derive(Debug, Clone, Default)]
struct ToolCallState {
    id: Option<String>,
    r#type: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Clone, Default)]
struct ChoiceState {
    role: Option<String>,
    content: String,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: Option<String>,
}

/// Accumulates a chat-completions SSE stream back into a single response.
/// `choices`/`delta` are opaque JSON; only the generic `content`/`tool_calls`/
/// `finish_reason` fields the known delta shape uses are merged.
#[derive(Debug, Clone)]
pub struct OpenAIChatCompletionStreamToResponseState {
    id: String,
    model: String,
    created: i64,
    usage: Option<CompletionUsage>,
    choices: BTreeMap<i64, ChoiceState>,
}

impl OpenAIChatCompletionStreamToResponseState {
    pub fn new() -> Self {
        Self {
            id: "chatcmpl".to_string(),
            model: "unknown".to_string(),
            created: 0,
            usage: None,
            choices: BTreeMap::new(),
        }
    }

    pub fn push_chunk(
        &mut self,
        chunk: CreateChatCompletionStreamResponse,
    ) -> Option<CreateChatCompletionResponse> {
        self.id = chunk.id;
        self.model = chunk.model;
        self.created = chunk.created;
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in &chunk.choices {
            self.merge_choice(choice);
        }

        self.is_finished().then(|| self.build())
    }

    pub fn finalize(&self) -> CreateChatCompletionResponse {
        self.build()
    }

    pub fn finalize_on_eof(&self) -> CreateChatCompletionResponse {
        self.build()
    }

    fn merge_choice(&mut self, choice: &JsonValue) {
        let Some(obj) = choice.as_object() else {
            return;
        };
        let index = obj.get("index").and_then(JsonValue::as_i64).unwrap_or(0);
        let state = self.choices.entry(index).or_default();

        let Some(delta) = obj.get("delta").and_then(JsonValue::as_object) else {
            if let Some(reason) = obj.get("finish_reason").and_then(JsonValue::as_str) {
                state.finish_reason = Some(reason.to_string());
            }
            return;
        };

        if let Some(role) = delta.get("role").and_then(JsonValue::as_str) {
            state.role = Some(role.to_string());
        }
        if let Some(content) = delta.get("content").and_then(JsonValue::as_str) {
            state.content.push_str(content);
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(JsonValue::as_array) {
            for tool_call in tool_calls {
                self.merge_tool_call(index, tool_call);
            }
        }
        if let Some(reason) = obj.get("finish_reason").and_then(JsonValue::as_str) {
            let state = self.choices.entry(index).or_default();
            state.finish_reason = Some(reason.to_string());
        }
    }

    fn merge_tool_call(&mut self, choice_index: i64, tool_call: &JsonValue) {
        let Some(obj) = tool_call.as_object() else {
            return;
        };
        let tc_index = obj.get("index").and_then(JsonValue::as_i64).unwrap_or(0);
        let state = self
            .choices
            .entry(choice_index)
            .or_default()
            .tool_calls
            .entry(tc_index)
            .or_default();

        if let Some(id) = obj.get("id").and_then(JsonValue::as_str) {
            state.id = Some(id.to_string());
        }
        if let Some(r#type) = obj.get("type").and_then(JsonValue::as_str) {
            state.r#type = Some(r#type.to_string());
        }
        if let Some(function) = obj.get("function").and_then(JsonValue::as_object) {
            if let Some(name) = function.get("name").and_then(JsonValue::as_str) {
                state.name = Some(name.to_string());
            }
            if let Some(arguments) = function.get("arguments").and_then(JsonValue::as_str) {
                state.arguments.push_str(arguments);
            }
        }
    }

    fn is_finished(&self) -> bool {
        !self.choices.is_empty() && self.choices.values().all(|c| c.finish_reason.is_some())
    }

    fn build(&self) -> CreateChatCompletionResponse {
        let choices = self
            .choices
            .iter()
            .map(|(index, state)| build_choice(*index, state))
            .collect();

        CreateChatCompletionResponse {
            id: self.id.clone(),
            object: ChatCompletionObjectType::ChatCompletion,
            created: self.created,
            model: self.model.clone(),
            choices,
            usage: self.usage.clone(),
        }
    }
}

impl Default for OpenAIChatCompletionStreamToResponseState {
    fn default() -> Self {
        Self::new()
    }
}

fn build_choice(index: i64, state: &ChoiceState) -> JsonValue {
    let tool_calls: Vec<JsonValue> = state
        .tool_calls
        .iter()
        .map(|(idx, tool)| {
            serde_json::json!({
                "id": tool.id.clone().unwrap_or_else(|| format!("call_{index}_{idx}")),
                "type": tool.r#type.clone().unwrap_or_else(|| "function".to_string()),
                "function": {
                    "name": tool.name.clone().unwrap_or_default(),
                    "arguments": tool.arguments,
                },
            })
        })
        .collect();

    let mut message = serde_json::json!({
        "role": state.role.clone().unwrap_or_else(|| "assistant".to_string()),
    });
    if let Some(obj) = message.as_object_mut() {
        if !state.content.is_empty() {
            obj.insert("content".to_string(), JsonValue::String(state.content.clone()));
        }
        if !tool_calls.is_empty() {
            obj.insert("tool_calls".to_string(), JsonValue::Array(tool_calls));
        }
    }

    serde_json::json!({
        "index": index,
        "message": message,
        "finish_reason": state.finish_reason.clone().unwrap_or_else(|| "stop".to_string()),
    })
}
