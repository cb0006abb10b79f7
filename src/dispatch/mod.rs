//! Drives a claimed event through agent invocation to a terminal ledger state.

use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::chain::RebalanceEvent;
use crate::store::{DispatchLedger, StoreError};

mod agent;
mod mock;
mod retry;

pub use agent::{AgentChunkStream, AgentError, AgentInvoker, HttpAgentInvoker, InvocationRequest};
pub use mock::MockAgent;
pub use retry::{RetryDecision, RetryPolicy};

/// Terminal outcome of dispatching one claimed event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Succeeded { response: String },
    DeadLettered { attempts: u32, error: AgentError },
}

#[derive(Clone)]
pub struct Dispatcher<A> {
    agent: A,
    ledger: DispatchLedger,
    retry: RetryPolicy,
}

impl<A: AgentInvoker> Dispatcher<A> {
    pub fn new(agent: A, ledger: DispatchLedger, retry: RetryPolicy) -> Self {
        Self { agent, ledger, retry }
    }

    /// Invokes the agent until the event reaches a terminal state.
    ///
    /// Only ledger failures bubble up as errors; agent failures end in a
    /// `DeadLettered` outcome so one poisoned event never wedges the pass.
    pub async fn dispatch(&self, event: &RebalanceEvent) -> Result<DispatchOutcome, StoreError> {
        let event_id = event.event_id();
        let session_id = session_id(event);
        let input_text = build_prompt(event);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.ledger.record_attempt(event_id, &session_id).await?;
            info!(
                %event_id,
                %session_id,
                attempt,
                portfolio = %event.portfolio,
                deviation_bps = %event.deviation_bps,
                "Invoking rebalancing agent"
            );

            match self.invoke_once(&session_id, &input_text).await {
                Ok(response) => {
                    self.ledger.mark_succeeded(event_id, &response).await?;
                    info!(%event_id, attempt, "Agent invocation succeeded");
                    return Ok(DispatchOutcome::Succeeded { response });
                }
                Err(error) => match self.retry.decide(attempt, &error) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            %event_id,
                            attempt,
                            error = %error,
                            "Agent invocation failed, retrying after {:?}", delay
                        );
                        self.ledger.mark_failed(event_id, &error.to_string()).await?;
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DeadLetter => {
                        error!(
                            %event_id,
                            attempt,
                            error = %error,
                            "Giving up on event, dead-lettering"
                        );
                        self.ledger
                            .mark_dead_lettered(event_id, &error.to_string())
                            .await?;
                        return Ok(DispatchOutcome::DeadLettered {
                            attempts: attempt,
                            error,
                        });
                    }
                },
            }
        }
    }

    async fn invoke_once(&self, session_id: &str, input_text: &str) -> Result<String, AgentError> {
        let request = InvocationRequest {
            session_id: session_id.to_owned(),
            input_text: input_text.to_owned(),
        };

        let mut stream = self.agent.invoke(request).await?;
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&collected).into_owned())
    }
}

/// Session id for one on-chain event. Deterministic, so retries and re-scans
/// of the same event land in the same agent session.
fn session_id(event: &RebalanceEvent) -> String {
    format!(
        "rebalance-{:#x}-{}-{}",
        event.portfolio,
        event.event_timestamp,
        event.event_id()
    )
}

/// Natural-language trigger handed to the agent.
fn build_prompt(event: &RebalanceEvent) -> String {
    let percent = event
        .deviation_bps
        .to_string()
        .parse::<f64>()
        .map(|bps| bps / 100.0)
        .unwrap_or(f64::INFINITY);
    format!(
        "Automated trigger: rebalancing required for portfolio {:#x}. \
         Current allocation deviation is {} basis points ({percent:.2}%). \
         The request was emitted in block {} at timestamp {}. \
         Analyze the portfolio and execute the trades needed to restore the target allocation.",
        event.portfolio, event.deviation_bps, event.block_number, event.event_timestamp
    )
}
