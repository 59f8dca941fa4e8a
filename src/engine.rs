// src/engine.rs

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::bit::{Bit, BitKind, BitRegistry};
use crate::event::{EngineEvent, EventBus};
use crate::flow::{CompiledFlow, MatchPredicate, TRIGGER_ID};
use crate::guard::{GuardScope, GuardStatus};
use crate::invocation::{
    InvocationManager, InvocationStatus, PollBudget, PollResult, poll_until_terminal,
};
use crate::ledger::{BITS_DRY_RUN, MeteringGate};
use crate::template::{lookup_path, render_params};
use crate::wall::PostStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dry,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Skipped,
    Succeeded,
    Failed,
}

/// Errors scoped to a single node. None of these abort sibling branches.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out, last known status={0}")]
    InvocationTimeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why a node was skipped (guard, filter, cancellation, unreachable).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NodeResult {
    pub fn succeeded(output: Value) -> Self {
        Self { status: NodeStatus::Succeeded, output, error: None, reason: None }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            status: NodeStatus::Failed,
            output: Value::Null,
            error: Some(error.to_string()),
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            output: Value::Null,
            error: None,
            reason: Some(reason.into()),
        }
    }
}

/// One execution instance of a flow. Node results are append-only: a node's
/// entry is written exactly once, when it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowRun {
    pub id: String,
    pub flow_id: String,
    pub mode: RunMode,
    pub status: RunStatus,
    pub node_results: BTreeMap<String, NodeResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-run knobs. `cancel` is checked at every suspension point; an
/// idempotency key makes repeated admission replay instead of re-debit.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub cancel: CancellationToken,
}

/// Walks a compiled flow in dependency order: admission first, then a
/// ready-set loop that runs independent branches as concurrent tasks.
/// Only NHA branches suspend, and they hold no engine state while polling.
pub struct Engine {
    registry: Arc<BitRegistry>,
    gate: Arc<MeteringGate>,
    invocations: Arc<InvocationManager>,
    wall: Arc<dyn PostStore>,
    bus: EventBus,
    budget: PollBudget,
}

#[derive(Clone)]
struct NodeEnv {
    invocations: Arc<InvocationManager>,
    wall: Arc<dyn PostStore>,
    bus: EventBus,
    budget: PollBudget,
    cancel: CancellationToken,
}

struct NodeTask {
    run_id: String,
    node_id: String,
    bit: Bit,
    params: Value,
    ctx: Value,
    mode: RunMode,
}

enum NodeOutcome {
    Output(Value),
    Skip(String),
}

impl Engine {
    pub fn new(
        registry: Arc<BitRegistry>,
        gate: Arc<MeteringGate>,
        invocations: Arc<InvocationManager>,
        wall: Arc<dyn PostStore>,
        bus: EventBus,
    ) -> Self {
        Self { registry, gate, invocations, wall, bus, budget: PollBudget::default() }
    }

    pub fn with_poll_budget(mut self, budget: PollBudget) -> Self {
        self.budget = budget;
        self
    }

    #[instrument(skip(self, flow, trigger_payload, opts), fields(flow = %flow.id(), mode = ?mode))]
    pub async fn run(
        &self,
        flow: &CompiledFlow,
        trigger_payload: Value,
        mode: RunMode,
        opts: RunOptions,
    ) -> FlowRun {
        let run_id = opts.run_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = Utc::now();
        self.bus.publish(EngineEvent::RunStarted {
            run_id: run_id.clone(),
            flow_id: flow.id().to_string(),
            mode,
        });

        let mut node_results: BTreeMap<String, NodeResult> = BTreeMap::new();

        // dry runs are metered too, under their own tariff
        let tariff_key = match mode {
            RunMode::Dry => BITS_DRY_RUN,
            RunMode::Live => flow.tariff(),
        };
        let admitted = match self.gate.admit(flow.panel(), tariff_key, opts.idempotency_key.as_deref()).await {
            Ok(admission) if admission.ok => true,
            Ok(admission) => {
                node_results.insert(
                    "admission".to_string(),
                    NodeResult::failed(format!(
                        "insufficient balance: tariff `{tariff_key}` rejected at balance {}",
                        admission.new_balance
                    )),
                );
                false
            }
            Err(e) => {
                node_results.insert("admission".to_string(), NodeResult::failed(e));
                false
            }
        };
        if !admitted {
            return self.finish(flow, run_id, mode, started_at, node_results, RunStatus::Failed);
        }

        let mut running: JoinSet<(String, NodeResult)> = JoinSet::new();
        let mut task_node: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut engine_fault = false;

        loop {
            // schedule every ready node; walking in topological order lets a
            // skip cascade resolve within one pass
            for node_id in flow.order() {
                if node_results.contains_key(node_id) || in_flight.contains(node_id) {
                    continue;
                }
                if !flow.is_reachable(node_id) {
                    self.record(&run_id, node_id, NodeResult::skipped("unreachable from trigger"), &mut node_results);
                    continue;
                }
                if flow.deps(node_id).iter().any(|d| !node_results.contains_key(d)) {
                    continue;
                }
                if opts.cancel.is_cancelled() {
                    self.record(&run_id, node_id, NodeResult::skipped("cancelled"), &mut node_results);
                    continue;
                }
                let guard_passed = match flow.guard(node_id) {
                    Some(guard) => guard.eval(&ResultsScope { results: &node_results }),
                    None => true,
                };
                if !guard_passed {
                    self.record(&run_id, node_id, NodeResult::skipped("guard not satisfied"), &mut node_results);
                    continue;
                }

                let Some(spec) = flow.node(node_id) else {
                    self.record(&run_id, node_id, NodeResult::failed(NodeError::Internal("node missing from document".into())), &mut node_results);
                    engine_fault = true;
                    continue;
                };
                let Some(bit) = self.registry.get(&spec.bit) else {
                    self.record(&run_id, node_id, NodeResult::failed(NodeError::Internal(format!("bit `{}` vanished from registry", spec.bit))), &mut node_results);
                    engine_fault = true;
                    continue;
                };

                let task = NodeTask {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    bit,
                    params: spec.params.clone(),
                    ctx: template_context(&trigger_payload, &node_results),
                    mode,
                };
                let env = NodeEnv {
                    invocations: self.invocations.clone(),
                    wall: self.wall.clone(),
                    bus: self.bus.clone(),
                    budget: self.budget,
                    cancel: opts.cancel.clone(),
                };
                in_flight.insert(node_id.clone());
                let owned_id = node_id.clone();
                let handle = running.spawn(async move {
                    let result = execute_node(task, env).await;
                    (owned_id, result)
                });
                task_node.insert(handle.id(), node_id.clone());
            }

            match running.join_next_with_id().await {
                Some(Ok((task_id, (node_id, result)))) => {
                    task_node.remove(&task_id);
                    in_flight.remove(&node_id);
                    self.record(&run_id, &node_id, result, &mut node_results);
                }
                Some(Err(join_err)) => {
                    // a panicking handler is an engine fault, never swallowed
                    let node_id = task_node.remove(&join_err.id()).unwrap_or_default();
                    error!(run = %run_id, node = %node_id, "node task failed: {join_err}");
                    in_flight.remove(&node_id);
                    self.record(
                        &run_id,
                        &node_id,
                        NodeResult::failed(NodeError::Internal(join_err.to_string())),
                        &mut node_results,
                    );
                    engine_fault = true;
                }
                None => break,
            }
        }

        let mut any_failed = false;
        for node_id in flow.order() {
            if !flow.is_reachable(node_id) {
                continue;
            }
            if let Some(result) = node_results.get(node_id) {
                if result.status == NodeStatus::Failed {
                    any_failed = true;
                }
            }
        }
        let status = if engine_fault {
            RunStatus::Failed
        } else if any_failed {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        };

        self.finish(flow, run_id, mode, started_at, node_results, status)
    }

    fn record(
        &self,
        run_id: &str,
        node_id: &str,
        result: NodeResult,
        node_results: &mut BTreeMap<String, NodeResult>,
    ) {
        self.bus.publish(EngineEvent::NodeFinished {
            run_id: run_id.to_string(),
            node_id: node_id.to_string(),
            status: result.status,
        });
        node_results.insert(node_id.to_string(), result);
    }

    fn finish(
        &self,
        flow: &CompiledFlow,
        run_id: String,
        mode: RunMode,
        started_at: DateTime<Utc>,
        node_results: BTreeMap<String, NodeResult>,
        status: RunStatus,
    ) -> FlowRun {
        info!(run = %run_id, flow = %flow.id(), ?status, "run finished");
        self.bus.publish(EngineEvent::RunFinished {
            run_id: run_id.clone(),
            flow_id: flow.id().to_string(),
            status,
        });
        FlowRun {
            id: run_id,
            flow_id: flow.id().to_string(),
            mode,
            status,
            node_results,
            started_at,
            finished_at: Some(Utc::now()),
        }
    }
}

struct ResultsScope<'a> {
    results: &'a BTreeMap<String, NodeResult>,
}

impl GuardScope for ResultsScope<'_> {
    fn status(&self, node: &str) -> GuardStatus {
        if node == TRIGGER_ID {
            return GuardStatus::Succeeded;
        }
        match self.results.get(node).map(|r| r.status) {
            Some(NodeStatus::Succeeded) => GuardStatus::Succeeded,
            Some(NodeStatus::Failed) => GuardStatus::Failed,
            Some(NodeStatus::Skipped) => GuardStatus::Skipped,
            None => GuardStatus::Unknown,
        }
    }

    fn branch(&self, node: &str) -> Option<String> {
        self.results
            .get(node)?
            .output
            .get("branch")?
            .as_str()
            .map(str::to_string)
    }
}

fn template_context(trigger: &Value, results: &BTreeMap<String, NodeResult>) -> Value {
    let mut nodes = Map::new();
    for (id, result) in results {
        nodes.insert(
            id.clone(),
            json!({ "output": result.output, "status": result.status }),
        );
    }
    json!({ "trigger": trigger, "nodes": nodes })
}

async fn execute_node(task: NodeTask, env: NodeEnv) -> NodeResult {
    let params = match render_params(&task.params, &task.ctx) {
        Ok(params) => params,
        Err(e) => return NodeResult::failed(NodeError::InvalidInput(e.to_string())),
    };

    let outcome = match task.bit.kind {
        BitKind::Filter => run_filter(&params, &task.ctx),
        BitKind::Enrich => run_enrich(&params),
        BitKind::Delay => run_delay(&params, task.mode, &env).await,
        BitKind::Route => run_route(&params, &task.ctx),
        BitKind::Emit => run_emit(&task, &params, &env),
        BitKind::Action => run_action(&task, &params, &env).await,
        BitKind::Trigger => Err(NodeError::Internal("trigger bit executed as a node".into())),
    };

    match outcome {
        Ok(NodeOutcome::Output(output)) => NodeResult::succeeded(output),
        Ok(NodeOutcome::Skip(reason)) => NodeResult::skipped(reason),
        Err(e) => NodeResult::failed(e),
    }
}

fn run_filter(params: &Value, ctx: &Value) -> Result<NodeOutcome, NodeError> {
    let raw = params
        .get("match")
        .cloned()
        .ok_or_else(|| NodeError::InvalidInput("filter needs a `match` object".into()))?;
    let predicate: MatchPredicate = serde_json::from_value(raw)
        .map_err(|e| NodeError::InvalidInput(format!("bad match predicate: {e}")))?;
    if predicate.matches(ctx) {
        Ok(NodeOutcome::Output(json!({ "matched": true })))
    } else {
        Ok(NodeOutcome::Skip("filter did not match".into()))
    }
}

fn run_enrich(params: &Value) -> Result<NodeOutcome, NodeError> {
    match params.get("with") {
        Some(with @ Value::Object(_)) => Ok(NodeOutcome::Output(with.clone())),
        _ => Err(NodeError::InvalidInput("enrich needs a `with` object".into())),
    }
}

async fn run_delay(params: &Value, mode: RunMode, env: &NodeEnv) -> Result<NodeOutcome, NodeError> {
    let ms = params
        .get("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| NodeError::InvalidInput("delay needs integer `ms`".into()))?;
    if mode == RunMode::Dry {
        return Ok(NodeOutcome::Output(json!({ "ms": ms, "simulated": true })));
    }
    tokio::select! {
        _ = env.cancel.cancelled() => Err(NodeError::Cancelled),
        _ = sleep(Duration::from_millis(ms)) => Ok(NodeOutcome::Output(json!({ "ms": ms }))),
    }
}

fn run_route(params: &Value, ctx: &Value) -> Result<NodeOutcome, NodeError> {
    let field = params
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::InvalidInput("route needs a `field` path".into()))?;
    let routes = params
        .get("routes")
        .and_then(Value::as_object)
        .ok_or_else(|| NodeError::InvalidInput("route needs a `routes` object".into()))?;

    let value = lookup_path(ctx, field).cloned().unwrap_or(Value::Null);
    let key = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let label = routes
        .get(&key)
        .and_then(Value::as_str)
        .or_else(|| params.get("default").and_then(Value::as_str))
        .ok_or_else(|| NodeError::ExecutionFailed(format!("no route for `{key}` and no default")))?;
    Ok(NodeOutcome::Output(json!({ "branch": label, "value": value })))
}

fn run_emit(task: &NodeTask, params: &Value, env: &NodeEnv) -> Result<NodeOutcome, NodeError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::InvalidInput("emit needs a `name`".into()))?;
    env.bus.publish(EngineEvent::Emitted {
        run_id: task.run_id.clone(),
        node_id: task.node_id.clone(),
        name: name.to_string(),
        payload: params.get("payload").cloned().unwrap_or(Value::Null),
    });
    Ok(NodeOutcome::Output(json!({ "emitted": name })))
}

async fn run_action(task: &NodeTask, params: &Value, env: &NodeEnv) -> Result<NodeOutcome, NodeError> {
    match task.bit.id.as_str() {
        "Action.NHA.Invoke" => run_nha_invoke(task, params, env).await,
        "Action.PostComment" => run_post_comment(task, params, env).await,
        other => Err(NodeError::ExecutionFailed(format!("no handler for action bit `{other}`"))),
    }
}

async fn run_nha_invoke(task: &NodeTask, params: &Value, env: &NodeEnv) -> Result<NodeOutcome, NodeError> {
    let agent = params
        .get("agent")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::InvalidInput("invoke needs an `agent`".into()))?;

    // simulation path: no invocation is created, nothing is billed downstream
    if task.mode == RunMode::Dry {
        return Ok(NodeOutcome::Output(json!({ "simulated": true, "agent": agent })));
    }

    let payload = params
        .get("payload")
        .cloned()
        .unwrap_or_else(|| json!({ "text": params.get("text").cloned().unwrap_or(Value::Null) }));
    let post_id = lookup_path(&task.ctx, "trigger.post.id")
        .and_then(Value::as_str)
        .unwrap_or(&task.run_id)
        .to_string();

    let invocation_id = env.invocations.create(&post_id, agent, payload);
    // this suspends only the current branch; siblings keep executing
    match poll_until_terminal(&env.invocations, &invocation_id, env.budget, &env.cancel).await {
        PollResult::Terminal(outcome) if outcome.status == InvocationStatus::Done => {
            Ok(NodeOutcome::Output(json!({
                "invocation_id": invocation_id,
                "status": "done",
                "result_ref": outcome.result_ref,
            })))
        }
        PollResult::Terminal(outcome) => Err(NodeError::ExecutionFailed(format!(
            "invocation failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".into())
        ))),
        PollResult::Exhausted(outcome) => {
            Err(NodeError::InvocationTimeout(outcome.status.as_str().to_string()))
        }
        PollResult::Cancelled => Err(NodeError::Cancelled),
        PollResult::NotFound => {
            Err(NodeError::Internal(format!("invocation `{invocation_id}` vanished")))
        }
    }
}

async fn run_post_comment(task: &NodeTask, params: &Value, env: &NodeEnv) -> Result<NodeOutcome, NodeError> {
    let post_id = params
        .get("post_id")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::InvalidInput("post-comment needs a `post_id`".into()))?;
    let text = params
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // the real post path must never run in dry mode
    if task.mode == RunMode::Dry {
        return Ok(NodeOutcome::Output(json!({ "simulated": true, "post_id": post_id })));
    }

    let comment = env
        .wall
        .append_comment(post_id, "flow", text)
        .await
        .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
    Ok(NodeOutcome::Output(json!({ "comment_id": comment.id, "post_id": post_id })))
}
