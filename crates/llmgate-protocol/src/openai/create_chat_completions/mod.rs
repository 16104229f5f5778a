pub mod request;
pub mod response;
pub mod stream;

pub use request::{CreateChatCompletionRequest, CreateChatCompletionRequestBody, StopConfiguration};
pub use response::{ChatCompletionObjectType, CompletionUsage, CreateChatCompletionResponse};
pub use stream::{ChatCompletionChunkObjectType, CreateChatCompletionStreamResponse};

