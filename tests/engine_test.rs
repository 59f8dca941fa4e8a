// tests/engine_test.rs

use std::sync::Arc;

use async_trait::async_trait;
use panelflow::bit::BitRegistry;
use panelflow::engine::{Engine, FlowRun, NodeStatus, RunMode, RunOptions, RunStatus};
use panelflow::event::EventBus;
use panelflow::flow::{CompiledFlow, compile_json};
use panelflow::invocation::{AgentWorker, EchoWorker, InvocationManager};
use panelflow::ledger::{MeteringGate, Tariffs, WALL_POST};
use panelflow::wall::{InMemoryWall, PostStore};
use serde_json::{Value, json};

/// Worker whose invocations never leave `running`.
struct StallingWorker;

#[async_trait]
impl AgentWorker for StallingWorker {
    async fn handle(&self, _agent: &str, _payload: Value) -> Result<String, String> {
        std::future::pending().await
    }
}

/// Worker that always reports an agent-side error.
struct FailingWorker;

#[async_trait]
impl AgentWorker for FailingWorker {
    async fn handle(&self, _agent: &str, _payload: Value) -> Result<String, String> {
        Err("agent exploded".to_string())
    }
}

struct Harness {
    engine: Engine,
    wall: Arc<InMemoryWall>,
    gate: Arc<MeteringGate>,
    registry: Arc<BitRegistry>,
}

fn harness(balance: i64, worker: Arc<dyn AgentWorker>) -> Harness {
    let registry = Arc::new(BitRegistry::with_builtins());
    let gate = MeteringGate::new(Tariffs::builtin(), balance);
    let bus = EventBus::new();
    let wall = InMemoryWall::new();
    let invocations = InvocationManager::with_worker(worker, bus.clone());
    let engine = Engine::new(registry.clone(), gate.clone(), invocations, wall.clone(), bus);
    Harness { engine, wall, gate, registry }
}

fn sentiment_flow(h: &Harness) -> CompiledFlow {
    let doc = json!({
        "id": "flow_x", "panel": "user", "version": 1,
        "trigger": { "type": "Trigger.NewPost", "match": { "panel": "user" } },
        "nodes": [
            { "id": "n1", "type": "Action.NHA.Invoke",
              "params": { "agent": "sentiment", "text": "{{trigger.post.text}}" } },
            { "id": "n2", "type": "Action.PostComment",
              "params": { "post_id": "{{trigger.post.id}}", "text": "analysed: {{nodes.n1.output.result_ref}}" },
              "if": "n1.succeeded" }
        ],
        "edges": [ { "from": "n1", "to": "n2" } ]
    });
    compile_json(&doc, &h.registry).unwrap()
}

async fn run_live(h: &Harness, flow: &CompiledFlow, trigger: Value) -> FlowRun {
    h.engine.run(flow, trigger, RunMode::Live, RunOptions::default()).await
}

#[tokio::test(start_paused = true)]
async fn end_to_end_success_comments_on_the_post() {
    let h = harness(1000, Arc::new(EchoWorker));
    let post = h.wall.append_post("user", "ada", "what a day").await;
    let flow = sentiment_flow(&h);

    let run = run_live(&h, &flow, json!({ "post": { "id": post.id, "text": post.text } })).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.node_results["n1"].status, NodeStatus::Succeeded);
    assert_eq!(run.node_results["n2"].status, NodeStatus::Succeeded);

    // the invocation's result ref flowed into the real comment
    let stored = h.wall.get(&post.id).await.unwrap();
    assert_eq!(stored.comments.len(), 1);
    assert!(stored.comments[0].text.starts_with("analysed: echo/sentiment/"));
}

#[tokio::test(start_paused = true)]
async fn end_to_end_agent_error_yields_partial_run() {
    let h = harness(1000, Arc::new(FailingWorker));
    let post = h.wall.append_post("user", "ada", "what a day").await;
    let flow = sentiment_flow(&h);

    let run = run_live(&h, &flow, json!({ "post": { "id": post.id, "text": post.text } })).await;

    assert_eq!(run.status, RunStatus::Partial);
    let n1 = &run.node_results["n1"];
    assert_eq!(n1.status, NodeStatus::Failed);
    assert!(n1.error.as_ref().unwrap().contains("agent exploded"));
    assert_eq!(run.node_results["n2"].status, NodeStatus::Skipped);
    assert_eq!(h.wall.comment_count(&post.id).await, 0);
}

#[tokio::test(start_paused = true)]
async fn stalled_invocation_times_out_while_siblings_succeed() {
    let h = harness(1000, Arc::new(StallingWorker));
    let doc = json!({
        "id": "f", "panel": "user",
        "trigger": { "type": "Trigger.Manual" },
        "nodes": [
            { "id": "slow", "type": "Action.NHA.Invoke", "params": { "agent": "stuck" } },
            { "id": "fast", "type": "Enrich.Merge", "params": { "with": { "done": true } } }
        ],
        "edges": []
    });
    let flow = compile_json(&doc, &h.registry).unwrap();

    let run = run_live(&h, &flow, json!({})).await;

    let slow = &run.node_results["slow"];
    assert_eq!(slow.status, NodeStatus::Failed);
    assert!(
        slow.error.as_ref().unwrap().contains("timed out, last known status=running"),
        "unexpected error: {:?}",
        slow.error
    );
    assert_eq!(run.node_results["fast"].status, NodeStatus::Succeeded);
    assert_eq!(run.status, RunStatus::Partial);
}

#[tokio::test(start_paused = true)]
async fn dry_run_simulates_and_is_metered_under_its_own_tariff() {
    let h = harness(1000, Arc::new(EchoWorker));
    let post = h.wall.append_post("user", "ada", "what a day").await;
    let flow = sentiment_flow(&h);

    let run = h
        .engine
        .run(
            &flow,
            json!({ "post": { "id": post.id, "text": post.text } }),
            RunMode::Dry,
            RunOptions::default(),
        )
        .await;

    assert_eq!(run.status, RunStatus::Succeeded);
    for node in ["n1", "n2"] {
        let result = &run.node_results[node];
        assert_eq!(result.status, NodeStatus::Succeeded);
        assert_eq!(result.output["simulated"], true, "{node} must be simulated");
    }
    // no real side effects...
    assert_eq!(h.wall.comment_count(&post.id).await, 0);
    // ...but the dry-run tariff was still debited
    assert_eq!(h.gate.balance("user").await, 1000 - 5);
}

#[tokio::test(start_paused = true)]
async fn idempotency_key_prevents_double_debit() {
    let h = harness(1000, Arc::new(EchoWorker));
    let doc = json!({
        "id": "f", "panel": "user",
        "trigger": { "type": "Trigger.Manual" },
        "nodes": [
            { "id": "n1", "type": "Enrich.Merge", "params": { "with": { "ok": true } } }
        ],
        "edges": []
    });
    let flow = compile_json(&doc, &h.registry).unwrap();

    let opts = || RunOptions {
        idempotency_key: Some("request-7".to_string()),
        ..Default::default()
    };
    let first = h.engine.run(&flow, json!({}), RunMode::Live, opts()).await;
    let second = h.engine.run(&flow, json!({}), RunMode::Live, opts()).await;

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    // one WALL_POST debit, not two
    assert_eq!(h.gate.balance("user").await, 1000 - 25);
    assert_eq!(h.gate.entries("user").await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_share_the_ledger_without_drift() {
    let h = harness(3 * 25, Arc::new(EchoWorker));
    let doc = json!({
        "id": "f", "panel": "user",
        "trigger": { "type": "Trigger.Manual" },
        "nodes": [
            { "id": "n1", "type": "Enrich.Merge", "params": { "with": { "ok": true } } }
        ],
        "edges": []
    });
    let flow = Arc::new(compile_json(&doc, &h.registry).unwrap());
    let engine = Arc::new(h.engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let flow = flow.clone();
        handles.push(tokio::spawn(async move {
            engine.run(&flow, json!({}), RunMode::Live, RunOptions::default()).await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        let run = handle.await.unwrap();
        match run.status {
            RunStatus::Succeeded => succeeded += 1,
            RunStatus::Failed => {
                assert!(
                    run.node_results["admission"]
                        .error
                        .as_ref()
                        .unwrap()
                        .contains("insufficient balance")
                );
                rejected += 1;
            }
            other => panic!("unexpected status {:?}", other),
        }
    }

    // balance covered exactly three WALL_POST admissions
    assert_eq!(succeeded, 3);
    assert_eq!(rejected, 5);
    assert_eq!(h.gate.balance("user").await, 0);
}

#[tokio::test(start_paused = true)]
async fn tariff_overrides_change_admission_outcomes() {
    let registry = Arc::new(BitRegistry::with_builtins());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tariffs.json");
    std::fs::write(&path, format!(r#"{{ "{WALL_POST}": -500 }}"#)).unwrap();

    let gate = MeteringGate::new(Tariffs::from_file(&path).unwrap(), 100);
    let bus = EventBus::new();
    let wall = InMemoryWall::new();
    let invocations = InvocationManager::with_worker(Arc::new(EchoWorker), bus.clone());
    let engine = Engine::new(registry.clone(), gate, invocations, wall, bus);

    let doc = json!({
        "id": "f", "panel": "user",
        "trigger": { "type": "Trigger.Manual" },
        "nodes": [
            { "id": "n1", "type": "Enrich.Merge", "params": { "with": { "ok": true } } }
        ],
        "edges": []
    });
    let flow = compile_json(&doc, &registry).unwrap();
    let run = engine.run(&flow, json!({}), RunMode::Live, RunOptions::default()).await;
    assert_eq!(run.status, RunStatus::Failed);
}
