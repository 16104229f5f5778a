pub use crate::claude::create_message::types::BetaMessage;

/// The gateway forwards successful response bytes verbatim; this alias exists
/// only so callers that need the typed shape (tests, the stream synthesizer's
/// non-streamed fallback) can deserialize into it.
pub type CreateMessageResponse = BetaMessage;
