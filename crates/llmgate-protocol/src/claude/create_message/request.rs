use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::claude::create_message::types::Model;
use crate::claude::types::AnthropicHeaders;

pub type CreateMessageHeaders = AnthropicHeaders;

/// Only the fields the gateway actually routes on are typed; everything else
/// (messages, system, tools, thinking, metadata, ...) passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequestBody {
    pub model: Model,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub rest: Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CreateMessageRequest {
    pub headers: CreateMessageHeaders,
    pub body: CreateMessageRequestBody,
}
