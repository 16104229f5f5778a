use llmgate_protocol::openai::create_response::response::Response;
use llmgate_protocol::openai::create_response::stream::ResponseStreamEvent;

/// Accumulates a Responses API SSE stream back into a single response. Every
/// typed event already carries the full `Response`; only the incremental
/// delta events (untyped, forwarded to the client verbatim) are not tapped.
#[derive(Debug, Clone, Default)]
pub struct OpenAIResponseStreamToResponseState {
    latest: Option<Response>,
    terminal: bool,
}

impl OpenAIResponseStreamToResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: ResponseStreamEvent) -> Option<Response> {
        match event {
            ResponseStreamEvent::Created { response } | ResponseStreamEvent::InProgress { response } => {
                self.latest = Some(response);
                None
            }
            ResponseStreamEvent::Completed { response }
            | ResponseStreamEvent::Failed { response }
            | ResponseStreamEvent::Incomplete { response } => {
                self.latest = Some(response.clone());
                self.terminal = true;
                Some(response)
            }
        }
    }

    pub fn finalize(self) -> Option<Response> {
        self.latest
    }

    pub fn finalize_on_eof(self) -> Option<Response> {
        if self.terminal { None } else { self.latest }
    }
}
