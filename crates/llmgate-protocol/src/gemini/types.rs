pub type JsonValue = serde_json::Value;

pub use crate::gemini::generate_content::types::*;
pub use crate::gemini::generate_content::{
    GenerateContentPath, GenerateContentRequest, GenerateContentRequestBody,
    GenerateContentResponse,
};
pub use crate::gemini::stream_content::{
    StreamGenerateContentRequest, StreamGenerateContentResponse,
};
