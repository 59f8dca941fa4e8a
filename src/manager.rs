// src/manager.rs

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::bit::BitRegistry;
use crate::engine::{Engine, FlowRun, RunMode, RunOptions, RunStatus};
use crate::event::{EngineEvent, EventBus};
use crate::flow::{CompiledFlow, FlowError, compile_json};
use crate::invocation::InvocationManager;
use crate::ledger::{MeteringGate, NHA_INVOCATION, WALL_POST};
use crate::wall::{Post, PostStore, WallError, mentions};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("flow `{0}` not found")]
    FlowNotFound(String),
    #[error("run `{0}` not found")]
    RunNotFound(String),
    #[error("insufficient balance for `{tariff}` (balance {balance})")]
    Insufficient { tariff: String, balance: i64 },
    #[error(transparent)]
    Admission(#[from] crate::ledger::AdmissionError),
    #[error(transparent)]
    Wall(#[from] WallError),
}

/// Holds compiled flows and run records, matches trigger events against
/// registered flows, and launches runs on the engine. Clones share the
/// same flow and run stores.
#[derive(Clone)]
pub struct FlowManager {
    registry: Arc<BitRegistry>,
    engine: Arc<Engine>,
    gate: Arc<MeteringGate>,
    invocations: Arc<InvocationManager>,
    wall: Arc<dyn PostStore>,
    bus: EventBus,
    flows: Arc<DashMap<String, CompiledFlow>>,
    runs: Arc<DashMap<String, FlowRun>>,
}

impl FlowManager {
    pub fn new(
        registry: Arc<BitRegistry>,
        engine: Arc<Engine>,
        gate: Arc<MeteringGate>,
        invocations: Arc<InvocationManager>,
        wall: Arc<dyn PostStore>,
        bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            gate,
            invocations,
            wall,
            bus,
            flows: Arc::new(DashMap::new()),
            runs: Arc::new(DashMap::new()),
        })
    }

    pub fn registry(&self) -> &BitRegistry {
        &self.registry
    }

    pub fn invocations(&self) -> &Arc<InvocationManager> {
        &self.invocations
    }

    /// Validate and register a flow document. Returns the flow id plus any
    /// compile warnings (unreachable nodes).
    pub fn register_flow(&self, doc: &Value) -> Result<(String, Vec<String>), FlowError> {
        let flow = compile_json(doc, &self.registry)?;
        let id = flow.id().to_string();
        let warnings = flow.warnings().to_vec();
        self.flows.insert(id.clone(), flow);
        info!(flow = %id, "registered flow");
        Ok((id, warnings))
    }

    pub fn get_flow(&self, flow_id: &str) -> Option<CompiledFlow> {
        self.flows.get(flow_id).map(|e| e.value().clone())
    }

    pub fn remove_flow(&self, flow_id: &str) {
        self.flows.remove(flow_id);
        info!(flow = %flow_id, "removed flow");
    }

    /// Launch a run asynchronously; the returned id is immediately pollable
    /// via `run_record` while the run proceeds in the background.
    pub fn start_run(
        &self,
        flow_id: &str,
        input: Value,
        mode: RunMode,
        idempotency_key: Option<String>,
    ) -> Result<String, ManagerError> {
        let flow = self
            .get_flow(flow_id)
            .ok_or_else(|| ManagerError::FlowNotFound(flow_id.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        self.runs.insert(
            run_id.clone(),
            FlowRun {
                id: run_id.clone(),
                flow_id: flow_id.to_string(),
                mode,
                status: RunStatus::Running,
                node_results: Default::default(),
                started_at: chrono::Utc::now(),
                finished_at: None,
            },
        );

        let manager = self.clone();
        let opts = RunOptions { run_id: Some(run_id.clone()), idempotency_key, ..Default::default() };
        tokio::spawn(async move {
            let run = manager.engine.run(&flow, input, mode, opts).await;
            manager.runs.insert(run.id.clone(), run);
        });
        Ok(run_id)
    }

    pub fn run_record(&self, run_id: &str) -> Option<FlowRun> {
        self.runs.get(run_id).map(|e| e.value().clone())
    }

    /// The wall contract: meter the post, store it, publish the typed event
    /// and create one NHA invocation per `@agent:` mention. Mentions share
    /// the same invocation subsystem the engine uses.
    #[instrument(skip(self, text))]
    pub async fn create_post(
        &self,
        panel: &str,
        author: &str,
        text: &str,
    ) -> Result<Post, ManagerError> {
        let admission = self.gate.admit(panel, WALL_POST, None).await?;
        if !admission.ok {
            return Err(ManagerError::Insufficient {
                tariff: WALL_POST.to_string(),
                balance: admission.new_balance,
            });
        }

        let post = self.wall.append_post(panel, author, text).await;
        self.bus.publish(EngineEvent::PostCreated {
            post_id: post.id.clone(),
            panel: panel.to_string(),
            author: author.to_string(),
        });

        for agent in mentions(text) {
            let admission = self.gate.admit(panel, NHA_INVOCATION, None).await?;
            if !admission.ok {
                info!(panel, agent, "mention not invoked: balance exhausted");
                continue;
            }
            self.invocations
                .create(&post.id, &agent, json!({ "text": text }));
        }
        Ok(post)
    }

    /// Match a stored post against every registered flow's trigger and
    /// launch the ones that fire.
    pub async fn dispatch_post(&self, post_id: &str) {
        let Some(post) = self.wall.get(post_id).await else {
            return;
        };
        let post_json = serde_json::to_value(&post).unwrap_or(Value::Null);

        let candidates: Vec<String> = self
            .flows
            .iter()
            .filter(|entry| {
                let trigger = entry.value().trigger();
                trigger.bit == "Trigger.NewPost" && trigger.match_on.matches(&post_json)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for flow_id in candidates {
            let input = json!({ "post": post_json });
            match self.start_run(&flow_id, input, RunMode::Live, None) {
                Ok(run_id) => info!(flow = %flow_id, run = %run_id, post = post_id, "trigger fired"),
                Err(e) => error!(flow = %flow_id, post = post_id, "trigger dispatch failed: {e}"),
            }
        }
    }

    /// Background loop turning `PostCreated` events into flow runs.
    pub fn spawn_trigger_loop(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let EngineEvent::PostCreated { post_id, .. } = event {
                    manager.dispatch_post(&post_id).await;
                }
            }
        })
    }
}
