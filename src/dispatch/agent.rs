//! The downstream agent invocation boundary.
//!
//! The runtime behind it is opaque: invocations are slow, responses stream in
//! chunks, and failures can happen before or mid-stream. Everything above
//! this module talks to [`AgentInvoker`] only.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Chunked agent response body.
pub type AgentChunkStream = BoxStream<'static, Result<Bytes, AgentError>>;

/// One invocation of the rebalancing agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub session_id: String,
    pub input_text: String,
}

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Could not reach the runtime at all.
    #[error("agent transport error: {0}")]
    Transport(Arc<reqwest::Error>),
    #[error("agent invocation timed out")]
    Timeout,
    /// The runtime answered with a non-success status.
    #[error("agent rejected invocation with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The response started but the chunk stream broke.
    #[error("agent response stream failed: {0}")]
    Stream(Arc<reqwest::Error>),
}

impl AgentError {
    /// Transient failures are retried; everything else dead-letters.
    /// A rejection is transient only for throttling and server-side errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Stream(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(Arc::new(error))
        }
    }
}

/// Invokes the agent runtime and yields the streamed response.
pub trait AgentInvoker: Clone + Send + Sync + 'static {
    fn invoke(
        &self,
        request: InvocationRequest,
    ) -> impl Future<Output = Result<AgentChunkStream, AgentError>> + Send;
}

#[derive(Serialize)]
struct InvokeBody<'a> {
    #[serde(rename = "inputText")]
    input_text: &'a str,
    #[serde(rename = "enableTrace")]
    enable_trace: bool,
}

/// HTTP client for the agent runtime's invoke endpoint.
#[derive(Clone, Debug)]
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    endpoint: Url,
    agent_id: String,
    agent_alias_id: String,
    invoke_timeout: Duration,
}

impl HttpAgentInvoker {
    #[must_use]
    pub fn new(
        endpoint: Url,
        agent_id: String,
        agent_alias_id: String,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            agent_id,
            agent_alias_id,
            invoke_timeout,
        }
    }

    fn invoke_url(&self, session_id: &str) -> String {
        format!(
            "{}/agents/{}/agentAliases/{}/sessions/{}/text",
            self.endpoint.as_str().trim_end_matches('/'),
            self.agent_id,
            self.agent_alias_id,
            session_id,
        )
    }
}

impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<AgentChunkStream, AgentError> {
        let url = self.invoke_url(&request.session_id);
        debug!(session_id = %request.session_id, "Invoking agent runtime");

        let response = self
            .client
            .post(&url)
            // Covers connect, request and the whole streamed body.
            .timeout(self.invoke_timeout)
            .json(&InvokeBody {
                input_text: &request.input_text,
                enable_trace: false,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| AgentError::Stream(Arc::new(e))))
            .boxed())
    }
}
