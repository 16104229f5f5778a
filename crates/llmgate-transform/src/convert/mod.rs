//! Minimal cross-protocol adapter used when a channel's wire format differs
//! from the client's. Per the Non-goals this never deep-parses payload
//! semantics beyond routing identifiers: requests and responses are reduced
//! to a normalized conversation of text/tool-call/tool-result blocks and
//! rebuilt in the destination's envelope, dropping anything that needs a
//! format-specific schema to express (images, documents, citations, sampling
//! parameters, provider-specific tool types). Same-protocol traffic never
//! goes through this module; it is forwarded byte-for-byte.

mod claude;
mod common;
mod gemini;
mod openai_chat;
mod openai_response;

pub use common::{Block, Conversation};

use llmgate_protocol::claude::create_message::request::{
    CreateMessageRequest as ClaudeRequest, CreateMessageRequestBody as ClaudeRequestBody,
};
use llmgate_protocol::claude::create_message::response::CreateMessageResponse as ClaudeResponse;
use llmgate_protocol::claude::create_message::types::{
    BetaMessageRole, BetaMessageType, BetaUsage, Model as ClaudeModel,
};
use llmgate_protocol::gemini::generate_content::request::{
    GenerateContentPath, GenerateContentRequest as GeminiRequest, GenerateContentRequestBody,
};
use llmgate_protocol::gemini::generate_content::response::GenerateContentResponse as GeminiResponse;
use llmgate_protocol::openai::create_chat_completions::request::{
    CreateChatCompletionRequest as OpenAIChatRequest,
    CreateChatCompletionRequestBody as OpenAIChatRequestBody,
};
use llmgate_protocol::openai::create_chat_completions::response::{
    ChatCompletionObjectType, CreateChatCompletionResponse as OpenAIChatResponse,
};
use llmgate_protocol::openai::create_response::request::{
    CreateResponseRequest as OpenAIResponseRequest, CreateResponseRequestBody as OpenAIResponseRequestBody,
};
use llmgate_protocol::openai::create_response::response::{
    Response as OpenAIResponseResponse, ResponseObjectType,
};

use super::types::{GenerateContentRequest, GenerateContentResponse};

struct Source {
    conversation: Conversation,
    model: String,
}

fn source_from_request(req: GenerateContentRequest) -> Source {
    match req {
        GenerateContentRequest::Claude(req) => Source {
            conversation: claude::to_conversation(&req.body.rest),
            model: req.body.model.to_string(),
        },
        GenerateContentRequest::OpenAIChat(req) => Source {
            conversation: openai_chat::to_conversation(&req.body.rest),
            model: req.body.model,
        },
        GenerateContentRequest::OpenAIResponse(req) => Source {
            conversation: openai_response::to_conversation(&req.body.rest),
            model: req.body.model,
        },
        GenerateContentRequest::Gemini(req) => Source {
            conversation: gemini::to_conversation(&req.body.rest),
            model: req.path.model,
        },
        GenerateContentRequest::GeminiStream(req) => Source {
            conversation: gemini::to_conversation(&req.body.rest),
            model: req.path.model,
        },
    }
}

pub fn to_claude(req: GenerateContentRequest) -> ClaudeRequest {
    let source = source_from_request(req);
    let mut rest = serde_json::Map::new();
    claude::write_conversation(&mut rest, &source.conversation);
    ClaudeRequest {
        headers: Default::default(),
        body: ClaudeRequestBody {
            model: ClaudeModel::Custom(source.model),
            max_tokens: 4096,
            stream: None,
            rest,
        },
    }
}

pub fn to_openai_chat(req: GenerateContentRequest) -> OpenAIChatRequest {
    let source = source_from_request(req);
    let mut rest = serde_json::Map::new();
    openai_chat::write_conversation(&mut rest, &source.conversation);
    OpenAIChatRequest {
        body: OpenAIChatRequestBody {
            model: source.model,
            stream: None,
            rest,
        },
    }
}

pub fn to_openai_response(req: GenerateContentRequest) -> OpenAIResponseRequest {
    let source = source_from_request(req);
    let mut rest = serde_json::Map::new();
    openai_response::write_conversation(&mut rest, &source.conversation);
    OpenAIResponseRequest {
        body: OpenAIResponseRequestBody {
            model: source.model,
            stream: None,
            previous_response_id: None,
            rest,
        },
    }
}

pub fn to_gemini(req: GenerateContentRequest) -> GeminiRequest {
    let source = source_from_request(req);
    let mut rest = serde_json::Map::new();
    gemini::write_conversation(&mut rest, &source.conversation);
    GeminiRequest {
        path: GenerateContentPath { model: source.model },
        body: GenerateContentRequestBody { model: None, rest },
    }
}

pub fn response_to_claude(resp: GenerateContentResponse) -> ClaudeResponse {
    let (blocks, model, usage) = match resp {
        GenerateContentResponse::Claude(resp) => return resp,
        GenerateContentResponse::OpenAIChat(resp) => (
            openai_chat::content_to_blocks(&resp.choices),
            resp.model,
            resp.usage
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
        ),
        GenerateContentResponse::OpenAIResponse(resp) => (
            openai_response::content_to_blocks(&resp.output),
            resp.model,
            resp.usage
                .map(|u| (u.input_tokens, u.output_tokens))
                .unwrap_or_default(),
        ),
        GenerateContentResponse::Gemini(resp) => (
            gemini::content_to_blocks(&resp.candidates),
            resp.model_version.unwrap_or_else(|| "unknown".to_string()),
            resp.usage_metadata
                .map(|u| (u.prompt_token_count, u.candidates_token_count))
                .unwrap_or_default(),
        ),
    };

    llmgate_protocol::claude::create_message::types::BetaMessage {
        id: "converted".to_string(),
        r#type: BetaMessageType::Message,
        role: BetaMessageRole::Assistant,
        content: claude::blocks_to_content(&blocks),
        model: ClaudeModel::Custom(model),
        stop_reason: None,
        stop_sequence: None,
        usage: BetaUsage {
            input_tokens: usage.0,
            output_tokens: usage.1,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

pub fn response_to_openai_chat(resp: GenerateContentResponse) -> OpenAIChatResponse {
    let (blocks, model, usage) = match resp {
        GenerateContentResponse::OpenAIChat(resp) => return resp,
        GenerateContentResponse::Claude(resp) => (
            claude::content_to_blocks(&resp.content),
            resp.model.to_string(),
            (resp.usage.input_tokens, resp.usage.output_tokens),
        ),
        GenerateContentResponse::OpenAIResponse(resp) => (
            openai_response::content_to_blocks(&resp.output),
            resp.model,
            resp.usage
                .map(|u| (u.input_tokens, u.output_tokens))
                .unwrap_or_default(),
        ),
        GenerateContentResponse::Gemini(resp) => (
            gemini::content_to_blocks(&resp.candidates),
            resp.model_version.unwrap_or_else(|| "unknown".to_string()),
            resp.usage_metadata
                .map(|u| (u.prompt_token_count, u.candidates_token_count))
                .unwrap_or_default(),
        ),
    };

    OpenAIChatResponse {
        id: "converted".to_string(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: 0,
        model,
        choices: openai_chat::blocks_to_choices(&blocks, "stop"),
        usage: Some(llmgate_protocol::openai::create_chat_completions::response::CompletionUsage {
            prompt_tokens: usage.0,
            completion_tokens: usage.1,
            total_tokens: usage.0 + usage.1,
        }),
    }
}

pub fn response_to_openai_response(resp: GenerateContentResponse) -> OpenAIResponseResponse {
    let (blocks, model, usage) = match resp {
        GenerateContentResponse::OpenAIResponse(resp) => return resp,
        GenerateContentResponse::Claude(resp) => (
            claude::content_to_blocks(&resp.content),
            resp.model.to_string(),
            (resp.usage.input_tokens, resp.usage.output_tokens),
        ),
        GenerateContentResponse::OpenAIChat(resp) => (
            openai_chat::content_to_blocks(&resp.choices),
            resp.model,
            resp.usage
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
        ),
        GenerateContentResponse::Gemini(resp) => (
            gemini::content_to_blocks(&resp.candidates),
            resp.model_version.unwrap_or_else(|| "unknown".to_string()),
            resp.usage_metadata
                .map(|u| (u.prompt_token_count, u.candidates_token_count))
                .unwrap_or_default(),
        ),
    };

    OpenAIResponseResponse {
        id: "converted".to_string(),
        object: ResponseObjectType::Response,
        created_at: 0,
        status: None,
        model,
        output: openai_response::blocks_to_output(&blocks),
        usage: Some(llmgate_protocol::openai::create_response::response::ResponseUsage {
            input_tokens: usage.0,
            output_tokens: usage.1,
            total_tokens: usage.0 + usage.1,
        }),
        previous_response_id: None,
    }
}

pub fn response_to_gemini(resp: GenerateContentResponse) -> GeminiResponse {
    let (blocks, usage) = match resp {
        GenerateContentResponse::Gemini(resp) => return resp,
        GenerateContentResponse::Claude(resp) => (
            claude::content_to_blocks(&resp.content),
            (resp.usage.input_tokens, resp.usage.output_tokens),
        ),
        GenerateContentResponse::OpenAIChat(resp) => (
            openai_chat::content_to_blocks(&resp.choices),
            resp.usage
                .map(|u| (u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
        ),
        GenerateContentResponse::OpenAIResponse(resp) => (
            openai_response::content_to_blocks(&resp.output),
            resp.usage
                .map(|u| (u.input_tokens, u.output_tokens))
                .unwrap_or_default(),
        ),
    };

    GeminiResponse {
        candidates: gemini::blocks_to_candidates(&blocks, "STOP"),
        prompt_feedback: None,
        usage_metadata: Some(llmgate_protocol::gemini::generate_content::types::UsageMetadata {
            prompt_token_count: usage.0,
            candidates_token_count: usage.1,
            total_token_count: usage.0 + usage.1,
            cached_content_token_count: 0,
            prompt_tokens_details: None,
        }),
        model_version: None,
        response_id: None,
        model_status: None,
    }
}
