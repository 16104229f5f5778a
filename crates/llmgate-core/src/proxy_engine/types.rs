use llmgate_provider_core::{Op, Proto, Request};

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub user_id: i64,
    pub user_key_id: i64,
    pub user_agent: Option<String>,
    /// Channel ids this key may reach. Empty means unrestricted.
    pub allowed_channels: Vec<String>,
    /// Model-name substrings this key may request. Empty means unrestricted.
    pub allowed_models: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ProxyCall {
    Generate {
        trace_id: Option<String>,
        auth: ProxyAuth,
        user_proto: Proto,
        user_op: Op,
        req: Box<Request>,
        /// `Session_id` request header, used as the session-affinity key
        /// (§4.4/§6). Advisory only — absent means no affinity is tried.
        session_id: Option<String>,
    },
}
