use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use llmgate_protocol::gemini::generate_content::response::GenerateContentResponse;
use llmgate_protocol::gemini::generate_content::types::{ModelStatus, PromptFeedback, UsageMetadata};
use llmgate_protocol::gemini::stream_content::StreamGenerateContentResponse;

/// Accumulates a streamGenerateContent chunk sequence back into a single
/// response. Candidates are opaque JSON; parts are merged by concatenating
/// the generic `text` field chunks carry for incremental delivery, keeping
/// the first occurrence of any other part shape (function calls, inline
/// data, ...) since those arrive whole rather than incrementally.
#[derive(Debug, Clone, Default)]
pub struct GeminiStreamToResponseState {
    candidates: BTreeMap<u32, JsonValue>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
    response_id: Option<String>,
    model_status: Option<ModelStatus>,
}

impl GeminiStreamToResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(
        &mut self,
        chunk: StreamGenerateContentResponse,
    ) -> Option<GenerateContentResponse> {
        if chunk.prompt_feedback.is_some() {
            self.prompt_feedback = chunk.prompt_feedback.clone();
        }
        if chunk.usage_metadata.is_some() {
            self.usage_metadata = chunk.usage_metadata.clone();
        }
        if chunk.model_version.is_some() {
            self.model_version = chunk.model_version.clone();
        }
        if chunk.response_id.is_some() {
            self.response_id = chunk.response_id.clone();
        }
        if chunk.model_status.is_some() {
            self.model_status = chunk.model_status;
        }

        for (idx, candidate) in chunk.candidates.into_iter().enumerate() {
            let index = candidate
                .get("index")
                .and_then(JsonValue::as_u64)
                .map(|v| v as u32)
                .unwrap_or(idx as u32);
            self.merge_candidate(index, candidate);
        }

        self.is_finished().then(|| self.build())
    }

    pub fn finalize(&self) -> GenerateContentResponse {
        self.build()
    }

    pub fn finalize_on_eof(&self) -> GenerateContentResponse {
        self.build()
    }

    fn merge_candidate(&mut self, index: u32, incoming: JsonValue) {
        if let Some(reason) = incoming.get("finishReason") {
            if !matches!(reason, JsonValue::Null) {
                // Terminal chunk for this candidate: adopt wholesale, keeping
                // any text already accumulated if this chunk carries none.
                let existing_text = self.candidate_text(index);
                self.candidates.insert(index, incoming.clone());
                if self.candidate_text(index).is_none() {
                    if let Some(text) = existing_text {
                        self.set_candidate_text(index, &text);
                    }
                }
                return;
            }
        }

        let entry = self
            .candidates
            .entry(index)
            .or_insert_with(|| serde_json::json!({"index": index, "content": {"parts": []}}));

        let Some(parts) = incoming
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(JsonValue::as_array)
        else {
            return;
        };

        for part in parts {
            if let Some(text) = part.get("text").and_then(JsonValue::as_str) {
                append_text_part(entry, text);
            } else {
                push_part(entry, part.clone());
            }
        }
    }

    fn candidate_text(&self, index: u32) -> Option<String> {
        self.candidates.get(&index).and_then(|c| {
            c.get("content")?
                .get("parts")?
                .as_array()?
                .first()?
                .get("text")?
                .as_str()
                .map(str::to_string)
        })
    }

    fn set_candidate_text(&mut self, index: u32, text: &str) {
        if let Some(candidate) = self.candidates.get_mut(&index) {
            append_text_part(candidate, text);
        }
    }

    fn is_finished(&self) -> bool {
        !self.candidates.is_empty()
            && self
                .candidates
                .values()
                .all(|c| c.get("finishReason").is_some_and(|r| !r.is_null()))
    }

    fn build(&self) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: self.candidates.values().cloned().collect(),
            prompt_feedback: self.prompt_feedback.clone(),
            usage_metadata: self.usage_metadata.clone(),
            model_version: self.model_version.clone(),
            response_id: self.response_id.clone(),
            model_status: self.model_status,
        }
    }
}

fn append_text_part(candidate: &mut JsonValue, text: &str) {
    let Some(parts) = candidate
        .get_mut("content")
        .and_then(|c| c.get_mut("parts"))
        .and_then(JsonValue::as_array_mut)
    else {
        return;
    };
    if let Some(first) = parts.first_mut()
        && let Some(existing) = first.get("text").and_then(JsonValue::as_str)
    {
        let merged = format!("{existing}{text}");
        if let Some(obj) = first.as_object_mut() {
            obj.insert("text".to_string(), JsonValue::String(merged));
        }
        return;
    }
    parts.insert(0, serde_json::json!({"text": text}));
}

fn push_part(candidate: &mut JsonValue, part: JsonValue) {
    if let Some(parts) = candidate
        .get_mut("content")
        .and_then(|c| c.get_mut("parts"))
        .and_then(JsonValue::as_array_mut)
    {
        parts.push(part);
    }
}
