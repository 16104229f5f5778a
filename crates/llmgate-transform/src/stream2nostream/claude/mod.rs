use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use llmgate_protocol::claude::create_message::response::CreateMessageResponse;
use llmgate_protocol::claude::create_message::stream::{
    BetaStreamEvent, BetaStreamEventKnown, BetaStreamUsage,
};
use llmgate_protocol::claude::create_message::types::{
    BetaMessageRole, BetaMessageType, BetaStopReason, BetaUsage, Model,
};

/// Accumulates a Claude SSE stream back into a single non-streamed message.
/// Content blocks are opaque JSON; deltas are merged by the generic `text`/
/// `thinking`/`partial_json` fields the known delta shapes use, not by a
/// typed per-block-kind catalog.
#[derive(Debug, Default)]
pub struct ClaudeStreamToMessageState {
    id: String,
    model: Option<Model>,
    content: Vec<JsonValue>,
    partial_json: BTreeMap<u32, String>,
    stop_reason: Option<BetaStopReason>,
    stop_sequence: Option<String>,
    usage: BetaStreamUsage,
    started: bool,
}

impl ClaudeStreamToMessageState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: BetaStreamEvent) -> Option<CreateMessageResponse> {
        let BetaStreamEvent::Known(event) = event else {
            return None;
        };

        match event {
            BetaStreamEventKnown::MessageStart { message } => {
                self.id = message.id;
                self.model = Some(message.model);
                self.usage = message.usage;
                self.started = true;
                None
            }
            BetaStreamEventKnown::ContentBlockStart {
                index,
                content_block,
            } => {
                self.set_block(index, content_block);
                None
            }
            BetaStreamEventKnown::ContentBlockDelta { index, delta } => {
                self.apply_delta(index, &delta);
                None
            }
            BetaStreamEventKnown::ContentBlockStop { index } => {
                self.flush_partial_json(index);
                None
            }
            BetaStreamEventKnown::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                self.stop_sequence = delta.stop_sequence;
                merge_usage(&mut self.usage, usage);
                None
            }
            BetaStreamEventKnown::MessageStop => Some(self.build()),
            BetaStreamEventKnown::Ping | BetaStreamEventKnown::Error { .. } => None,
        }
    }

    pub fn finalize(&mut self) -> Option<CreateMessageResponse> {
        self.started.then(|| self.build())
    }

    pub fn finalize_on_eof(&mut self) -> Option<CreateMessageResponse> {
        self.finalize()
    }

    fn ensure_slot(&mut self, index: u32) {
        let index = index as usize;
        while self.content.len() <= index {
            self.content.push(JsonValue::Null);
        }
    }

    fn set_block(&mut self, index: u32, block: JsonValue) {
        self.ensure_slot(index);
        self.content[index as usize] = block;
    }

    fn apply_delta(&mut self, index: u32, delta: &JsonValue) {
        self.ensure_slot(index);
        let Some(delta) = delta.as_object() else {
            return;
        };

        if let Some(text) = delta.get("text").and_then(JsonValue::as_str) {
            append_string_field(&mut self.content[index as usize], "text", text);
        }
        if let Some(thinking) = delta.get("thinking").and_then(JsonValue::as_str) {
            append_string_field(&mut self.content[index as usize], "thinking", thinking);
        }
        if let Some(signature) = delta.get("signature").and_then(JsonValue::as_str) {
            set_string_field(&mut self.content[index as usize], "signature", signature);
        }
        if let Some(partial) = delta.get("partial_json").and_then(JsonValue::as_str) {
            self.partial_json.entry(index).or_default().push_str(partial);
        }
    }

    fn flush_partial_json(&mut self, index: u32) {
        let Some(raw) = self.partial_json.remove(&index) else {
            return;
        };
        if raw.is_empty() {
            return;
        }
        if let Ok(parsed) = serde_json::from_str::<JsonValue>(&raw) {
            set_value_field(&mut self.content[index as usize], "input", parsed);
        }
    }

    fn build(&self) -> CreateMessageResponse {
        llmgate_protocol::claude::create_message::types::BetaMessage {
            id: self.id.clone(),
            r#type: BetaMessageType::Message,
            role: BetaMessageRole::Assistant,
            content: self.content.clone(),
            model: self
                .model
                .clone()
                .unwrap_or_else(|| Model::Custom("unknown".to_string())),
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence.clone(),
            usage: BetaUsage {
                input_tokens: self.usage.input_tokens.unwrap_or(0),
                output_tokens: self.usage.output_tokens.unwrap_or(0),
                cache_creation_input_tokens: self.usage.cache_creation_input_tokens,
                cache_read_input_tokens: self.usage.cache_read_input_tokens,
            },
        }
    }
}

fn append_string_field(block: &mut JsonValue, key: &str, value: &str) {
    let Some(obj) = block.as_object_mut() else {
        return;
    };
    let existing = obj.get(key).and_then(JsonValue::as_str).unwrap_or_default();
    let merged = format!("{existing}{value}");
    obj.insert(key.to_string(), JsonValue::String(merged));
}

fn set_string_field(block: &mut JsonValue, key: &str, value: &str) {
    if let Some(obj) = block.as_object_mut() {
        obj.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

fn set_value_field(block: &mut JsonValue, key: &str, value: JsonValue) {
    if let Some(obj) = block.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

fn merge_usage(base: &mut BetaStreamUsage, incoming: BetaStreamUsage) {
    if incoming.input_tokens.is_some() {
        base.input_tokens = incoming.input_tokens;
    }
    if incoming.output_tokens.is_some() {
        base.output_tokens = incoming.output_tokens;
    }
    if incoming.cache_creation_input_tokens.is_some() {
        base.cache_creation_input_tokens = incoming.cache_creation_input_tokens;
    }
    if incoming.cache_read_input_tokens.is_some() {
        base.cache_read_input_tokens = incoming.cache_read_input_tokens;
    }
}
