use serde::{Deserialize, Serialize};

use crate::openai::create_response::response::Response;

/// Every `response.*` SSE event the Responses API emits. Only the terminal
/// events carrying the final `Response` (and therefore `usage`) are typed;
/// the many incremental delta events (text/audio/reasoning/tool-call deltas)
/// are forwarded to the client untouched and never parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: Response },
    #[serde(rename = "response.in_progress")]
    InProgress { response: Response },
    #[serde(rename = "response.completed")]
    Completed { response: Response },
    #[serde(rename = "response.failed")]
    Failed { response: Response },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: Response },
}
