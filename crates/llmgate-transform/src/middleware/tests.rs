use super::*;
use llmgate_protocol::claude::create_message::request::{
    CreateMessageRequest as ClaudeCreateMessageRequest, CreateMessageRequestBody,
};
use llmgate_protocol::claude::create_message::stream::{BetaStreamEvent, BetaStreamEventKnown};
use llmgate_protocol::claude::create_message::types::{
    BetaMessage, BetaMessageRole, BetaMessageType, BetaUsage, Model as ClaudeModel,
};
use llmgate_protocol::gemini::generate_content::response::GenerateContentResponse as GeminiGenerateContentResponse;
use llmgate_protocol::gemini::generate_content::types::UsageMetadata;
use llmgate_protocol::openai::create_chat_completions::request::{
    CreateChatCompletionRequest, CreateChatCompletionRequestBody,
};
use llmgate_protocol::openai::create_chat_completions::response::{
    ChatCompletionObjectType, CompletionUsage, CreateChatCompletionResponse,
};
use llmgate_protocol::openai::create_response::response::{
    Response as OpenAIResponse, ResponseObjectType, ResponseUsage,
};

fn claude_headers() -> llmgate_protocol::claude::create_message::request::CreateMessageHeaders {
    Default::default()
}

fn make_claude_request(stream: Option<bool>) -> ClaudeCreateMessageRequest {
    let mut rest = serde_json::Map::new();
    rest.insert(
        "messages".to_string(),
        serde_json::json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}]),
    );
    ClaudeCreateMessageRequest {
        headers: claude_headers(),
        body: CreateMessageRequestBody {
            model: ClaudeModel::Custom("claude-test".to_string()),
            max_tokens: 256,
            stream,
            rest,
        },
    }
}

fn make_openai_chat_request(stream: Option<bool>) -> CreateChatCompletionRequest {
    let mut rest = serde_json::Map::new();
    rest.insert(
        "messages".to_string(),
        serde_json::json!([{"role": "user", "content": "hi"}]),
    );
    CreateChatCompletionRequest {
        body: CreateChatCompletionRequestBody {
            model: "gpt-test".to_string(),
            stream,
            rest,
        },
    }
}

fn make_claude_response() -> BetaMessage {
    BetaMessage {
        id: "claude-test".to_string(),
        r#type: BetaMessageType::Message,
        role: BetaMessageRole::Assistant,
        content: vec![serde_json::json!({"type": "text", "text": "hello"})],
        model: ClaudeModel::Custom("claude-test".to_string()),
        stop_reason: None,
        stop_sequence: None,
        usage: BetaUsage {
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_input_tokens: Some(4),
            cache_read_input_tokens: Some(3),
        },
    }
}

fn make_openai_chat_response(usage: CompletionUsage) -> CreateChatCompletionResponse {
    CreateChatCompletionResponse {
        id: "chatcmpl-test".to_string(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: 0,
        model: "gpt-test".to_string(),
        choices: vec![serde_json::json!({
            "index": 0,
            "message": {"role": "assistant", "content": "ok"},
            "finish_reason": "stop",
        })],
        usage: Some(usage),
    }
}

fn make_openai_response(usage: ResponseUsage) -> OpenAIResponse {
    OpenAIResponse {
        id: "resp-test".to_string(),
        object: ResponseObjectType::Response,
        created_at: 0,
        status: None,
        model: "gpt-test".to_string(),
        output: Vec::new(),
        usage: Some(usage),
        previous_response_id: None,
    }
}

fn make_gemini_response(usage: UsageMetadata) -> GeminiGenerateContentResponse {
    GeminiGenerateContentResponse {
        candidates: Vec::new(),
        prompt_feedback: None,
        usage_metadata: Some(usage),
        model_version: None,
        response_id: None,
        model_status: None,
    }
}

#[test]
fn stream_format_basic() {
    assert_eq!(stream_format(Proto::Claude), StreamFormat::SseNamedEvent);
    assert_eq!(stream_format(Proto::OpenAIChat), StreamFormat::SseDataOnly);
    assert_eq!(
        stream_format(Proto::OpenAIResponse),
        StreamFormat::SseNamedEvent
    );
    assert_eq!(stream_format(Proto::Gemini), StreamFormat::JsonStream);
}

#[test]
fn same_protocol_request_passes_through() {
    let ctx = TransformContext {
        src: Proto::Claude,
        dst: Proto::Claude,
        src_op: Op::GenerateContent,
        dst_op: Op::GenerateContent,
    };
    let req = make_claude_request(None);
    let out = transform_request(
        &ctx,
        Request::GenerateContent(GenerateContentRequest::Claude(req)),
    )
    .unwrap();
    match out {
        Request::GenerateContent(GenerateContentRequest::Claude(req)) => {
            assert_eq!(req.body.stream, Some(false));
        }
        _ => panic!("unexpected output"),
    }
}

#[test]
fn cross_protocol_request_carries_model_and_messages() {
    let ctx = TransformContext {
        src: Proto::Claude,
        dst: Proto::OpenAIChat,
        src_op: Op::GenerateContent,
        dst_op: Op::GenerateContent,
    };
    let req = make_claude_request(Some(false));
    let out = transform_request(
        &ctx,
        Request::GenerateContent(GenerateContentRequest::Claude(req)),
    )
    .unwrap();
    let out_req = match out {
        Request::GenerateContent(GenerateContentRequest::OpenAIChat(req)) => req,
        _ => panic!("unexpected output"),
    };
    assert_eq!(out_req.body.model, "claude-test");
    let messages = out_req.body.rest.get("messages").unwrap().as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "user");
}

#[test]
fn openai_chat_stream_include_usage_default() {
    let ctx = TransformContext {
        src: Proto::OpenAIChat,
        dst: Proto::OpenAIChat,
        src_op: Op::GenerateContent,
        dst_op: Op::StreamGenerateContent,
    };
    let req = make_openai_chat_request(None);
    let out = transform_request(
        &ctx,
        Request::GenerateContent(GenerateContentRequest::OpenAIChat(req)),
    )
    .unwrap();
    let out_req = match out {
        Request::GenerateContent(GenerateContentRequest::OpenAIChat(req)) => req,
        _ => panic!("unexpected output"),
    };
    assert_eq!(out_req.body.stream, Some(true));
    assert_eq!(
        out_req
            .body
            .rest
            .get("stream_options")
            .and_then(|v| v.get("include_usage"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );
}

#[test]
fn usage_cache_mapping_claude() {
    let resp = make_claude_response();
    let summary =
        usage_from_response(Proto::Claude, &GenerateContentResponse::Claude(resp)).unwrap();
    assert_eq!(summary.input_tokens, Some(1));
    assert_eq!(summary.output_tokens, Some(2));
    assert_eq!(summary.cache_read_input_tokens, Some(3));
    assert_eq!(summary.cache_creation_input_tokens, Some(4));
}

#[test]
fn usage_cache_mapping_openai_chat() {
    let usage = CompletionUsage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    };
    let resp = make_openai_chat_response(usage);
    let summary = usage_from_response(
        Proto::OpenAIChat,
        &GenerateContentResponse::OpenAIChat(resp),
    )
    .unwrap();
    assert_eq!(summary.input_tokens, Some(10));
    assert_eq!(summary.output_tokens, Some(5));
    assert_eq!(summary.cache_read_input_tokens, None);
}

#[test]
fn usage_cache_mapping_openai_response() {
    let usage = ResponseUsage {
        input_tokens: 11,
        output_tokens: 22,
        total_tokens: 33,
    };
    let resp = make_openai_response(usage);
    let summary = usage_from_response(
        Proto::OpenAIResponse,
        &GenerateContentResponse::OpenAIResponse(resp),
    )
    .unwrap();
    assert_eq!(summary.input_tokens, Some(11));
    assert_eq!(summary.output_tokens, Some(22));
}

#[test]
fn usage_cache_mapping_gemini() {
    let usage = UsageMetadata {
        prompt_token_count: 1,
        candidates_token_count: 3,
        total_token_count: 4,
        cached_content_token_count: 2,
        prompt_tokens_details: None,
    };
    let resp = make_gemini_response(usage);
    let summary =
        usage_from_response(Proto::Gemini, &GenerateContentResponse::Gemini(resp)).unwrap();
    assert_eq!(summary.input_tokens, Some(1));
    assert_eq!(summary.output_tokens, Some(3));
    assert_eq!(summary.cache_read_input_tokens, Some(2));
}

#[test]
fn cross_protocol_stream_replays_converted_answer() {
    let ctx = TransformContext {
        src: Proto::Claude,
        dst: Proto::OpenAIChat,
        src_op: Op::StreamGenerateContent,
        dst_op: Op::StreamGenerateContent,
    };
    let mut transformer = StreamTransformer::new(&ctx).unwrap();

    let start = transformer
        .push(StreamEvent::Claude(BetaStreamEvent::Known(
            BetaStreamEventKnown::MessageStart {
                message: llmgate_protocol::claude::create_message::stream::BetaStreamMessage {
                    id: "claude-test".to_string(),
                    content: Vec::new(),
                    model: ClaudeModel::Custom("claude-test".to_string()),
                    role: BetaMessageRole::Assistant,
                    stop_reason: None,
                    stop_sequence: None,
                    r#type: BetaMessageType::Message,
                    usage: Default::default(),
                },
            },
        )))
        .unwrap();
    assert!(start.is_empty());

    let stop = transformer
        .push(StreamEvent::Claude(BetaStreamEvent::Known(
            BetaStreamEventKnown::MessageStop,
        )))
        .unwrap();
    assert_eq!(stop.len(), 2);
    match &stop[0] {
        StreamEvent::OpenAIChat(chunk) => assert_eq!(chunk.model, "claude-test"),
        _ => panic!("expected an OpenAI chat chunk"),
    }
}
