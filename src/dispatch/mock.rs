//! Scripted [`AgentInvoker`] for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};

use crate::dispatch::agent::{AgentChunkStream, AgentError, AgentInvoker, InvocationRequest};

#[derive(Default)]
struct MockAgentState {
    script: VecDeque<Result<Vec<String>, AgentError>>,
    invocations: Vec<InvocationRequest>,
    response_delay: Duration,
}

/// In-memory agent with one scripted outcome per invocation.
///
/// Invocations beyond the script succeed with a single `ok` chunk. Clones
/// share the script and the recorded invocations.
#[derive(Clone, Default)]
pub struct MockAgent {
    state: Arc<Mutex<MockAgentState>>,
}

impl MockAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, chunks: &[&str]) {
        self.lock()
            .script
            .push_back(Ok(chunks.iter().map(|c| (*c).to_owned()).collect()));
    }

    pub fn push_error(&self, error: AgentError) {
        self.lock().script.push_back(Err(error));
    }

    pub fn push_errors(&self, error: &AgentError, count: usize) {
        for _ in 0..count {
            self.push_error(error.clone());
        }
    }

    /// Delays every outcome, keeping invocations in flight so tests can
    /// exercise deadline behavior.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    #[must_use]
    pub fn invocations(&self) -> Vec<InvocationRequest> {
        self.lock().invocations.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockAgentState> {
        self.state.lock().expect("mock agent state poisoned")
    }
}

impl AgentInvoker for MockAgent {
    async fn invoke(&self, request: InvocationRequest) -> Result<AgentChunkStream, AgentError> {
        let (outcome, delay) = {
            let mut state = self.lock();
            state.invocations.push(request);
            let outcome = state
                .script
                .pop_front()
                .unwrap_or_else(|| Ok(vec!["ok".to_owned()]));
            (outcome, state.response_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let chunks = outcome?;
        Ok(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c)))).boxed())
    }
}
