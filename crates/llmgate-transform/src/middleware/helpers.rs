use super::types::{Proto, TransformError};

pub(crate) fn ensure_generate_proto(proto: Proto) -> Result<(), TransformError> {
    match proto {
        Proto::Claude | Proto::OpenAIChat | Proto::OpenAIResponse | Proto::Gemini => Ok(()),
    }
}
