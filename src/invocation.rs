// src/invocation.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::event::{EngineEvent, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Done | InvocationStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Queued => "queued",
            InvocationStatus::Running => "running",
            InvocationStatus::Done => "done",
            InvocationStatus::Error => "error",
        }
    }
}

/// One outstanding request to an out-of-process agent worker.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NhaInvocation {
    pub id: String,
    pub post_id: String,
    pub agent: String,
    pub status: InvocationStatus,
    /// Opaque pointer to the produced content; set only when `done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub status: InvocationStatus,
    pub result_ref: Option<String>,
    pub error: Option<String>,
}

/// The external collaborator that actually performs agent work. The
/// subsystem only tracks the invocation record; completion semantics live
/// behind this trait.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    /// Returns an opaque result ref on success.
    async fn handle(&self, agent: &str, payload: Value) -> Result<String, String>;
}

/// In-process demo worker: echoes a result ref immediately. Stands in for a
/// real agent fleet in the CLI and in tests.
pub struct EchoWorker;

#[async_trait]
impl AgentWorker for EchoWorker {
    async fn handle(&self, agent: &str, _payload: Value) -> Result<String, String> {
        Ok(format!("echo/{agent}/{}", Uuid::new_v4()))
    }
}

/// Tracks invocation records and drives the attached worker, one task per
/// invocation. Pollers never mutate status; only the worker driver
/// transitions records, and a terminal record never transitions again.
/// Clones share the same records.
#[derive(Clone)]
pub struct InvocationManager {
    invocations: Arc<DashMap<String, NhaInvocation>>,
    worker: Option<Arc<dyn AgentWorker>>,
    bus: EventBus,
}

impl InvocationManager {
    pub fn new(bus: EventBus) -> Arc<Self> {
        Arc::new(Self { invocations: Arc::new(DashMap::new()), worker: None, bus })
    }

    pub fn with_worker(worker: Arc<dyn AgentWorker>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self { invocations: Arc::new(DashMap::new()), worker: Some(worker), bus })
    }

    /// Enqueue one request. If a worker is attached, a task is spawned to
    /// drive the record through `running` to a terminal state.
    pub fn create(&self, post_id: &str, agent: &str, payload: Value) -> String {
        let id = Uuid::new_v4().to_string();
        let invocation = NhaInvocation {
            id: id.clone(),
            post_id: post_id.to_string(),
            agent: agent.to_string(),
            status: InvocationStatus::Queued,
            result_ref: None,
            error: None,
            created_at: Utc::now(),
            last_polled_at: None,
        };
        self.invocations.insert(id.clone(), invocation);
        info!(invocation = %id, agent, post_id, "invocation created");

        if let Some(worker) = self.worker.clone() {
            let manager = self.clone();
            let invocation_id = id.clone();
            let agent = agent.to_string();
            tokio::spawn(async move {
                manager.mark_running(&invocation_id);
                match worker.handle(&agent, payload).await {
                    Ok(result_ref) => manager.complete(&invocation_id, &result_ref),
                    Err(message) => manager.fail(&invocation_id, &message),
                };
            });
        }
        id
    }

    /// Idempotent read of the last known state; only `last_polled_at` moves.
    pub fn poll(&self, invocation_id: &str) -> Option<PollOutcome> {
        let mut entry = self.invocations.get_mut(invocation_id)?;
        entry.last_polled_at = Some(Utc::now());
        Some(PollOutcome {
            status: entry.status,
            result_ref: entry.result_ref.clone(),
            error: entry.error.clone(),
        })
    }

    pub fn get(&self, invocation_id: &str) -> Option<NhaInvocation> {
        self.invocations.get(invocation_id).map(|e| e.value().clone())
    }

    pub fn for_post(&self, post_id: &str) -> Vec<NhaInvocation> {
        let mut out: Vec<NhaInvocation> = self
            .invocations
            .iter()
            .filter(|e| e.value().post_id == post_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    // Worker-driver surface. Transitions out of a terminal state are
    // refused; the record keeps whatever the worker last reported.

    pub fn mark_running(&self, invocation_id: &str) -> bool {
        self.transition(invocation_id, |inv| {
            if inv.status == InvocationStatus::Queued {
                inv.status = InvocationStatus::Running;
                true
            } else {
                false
            }
        })
    }

    pub fn complete(&self, invocation_id: &str, result_ref: &str) -> bool {
        let done = self.transition(invocation_id, |inv| {
            if inv.status.is_terminal() {
                false
            } else {
                inv.status = InvocationStatus::Done;
                inv.result_ref = Some(result_ref.to_string());
                true
            }
        });
        if done {
            self.bus.publish(EngineEvent::InvocationFinished {
                invocation_id: invocation_id.to_string(),
                status: InvocationStatus::Done,
            });
        }
        done
    }

    pub fn fail(&self, invocation_id: &str, error: &str) -> bool {
        let failed = self.transition(invocation_id, |inv| {
            if inv.status.is_terminal() {
                false
            } else {
                inv.status = InvocationStatus::Error;
                inv.error = Some(error.to_string());
                true
            }
        });
        if failed {
            self.bus.publish(EngineEvent::InvocationFinished {
                invocation_id: invocation_id.to_string(),
                status: InvocationStatus::Error,
            });
        }
        failed
    }

    fn transition(&self, invocation_id: &str, apply: impl FnOnce(&mut NhaInvocation) -> bool) -> bool {
        match self.invocations.get_mut(invocation_id) {
            Some(mut entry) => apply(&mut entry),
            None => false,
        }
    }
}

/// How long a caller is willing to poll before giving up on observing a
/// terminal state.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self { interval: Duration::from_millis(1500), attempts: 20 }
    }
}

#[derive(Debug, Clone)]
pub enum PollResult {
    /// The invocation reached `done` or `error` within budget.
    Terminal(PollOutcome),
    /// Budget exhausted; the invocation stays at its last observed status.
    Exhausted(PollOutcome),
    Cancelled,
    NotFound,
}

/// Bounded poll loop. Callers own their budget; the subsystem never
/// self-cancels an invocation, so exhaustion leaves the record untouched.
pub async fn poll_until_terminal(
    manager: &InvocationManager,
    invocation_id: &str,
    budget: PollBudget,
    cancel: &CancellationToken,
) -> PollResult {
    let mut last: Option<PollOutcome> = None;
    for attempt in 0..budget.attempts {
        let Some(outcome) = manager.poll(invocation_id) else {
            return PollResult::NotFound;
        };
        if outcome.status.is_terminal() {
            return PollResult::Terminal(outcome);
        }
        debug!(invocation = invocation_id, attempt, status = outcome.status.as_str(), "still pending");
        last = Some(outcome);

        if attempt + 1 < budget.attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PollResult::Cancelled,
                _ = sleep(budget.interval) => {}
            }
        }
    }
    match last {
        Some(outcome) => PollResult::Exhausted(outcome),
        None => PollResult::NotFound,
    }
}
