pub use crate::openai::create_chat_completions::{
    ChatCompletionChunkObjectType, ChatCompletionObjectType, CompletionUsage,
    CreateChatCompletionRequest, CreateChatCompletionRequestBody, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse, StopConfiguration,
};
pub use crate::openai::create_response::{
    CreateResponseRequest, CreateResponseRequestBody, Response, ResponseObjectType,
    ResponseStatus, ResponseStreamEvent, ResponseUsage,
};
