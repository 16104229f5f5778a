pub mod request;

pub use request::StreamGenerateContentRequest;

/// streamGenerateContent responses are a JSON-array-framed or SSE-framed
/// sequence of `GenerateContentResponse` chunks; the gateway forwards bytes
/// verbatim and only taps usage via the stream synthesizer.
pub type StreamGenerateContentResponse = crate::gemini::generate_content::GenerateContentResponse;
