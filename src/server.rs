// src/server.rs

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine::{FlowRun, RunMode};
use crate::flow::FlowError;
use crate::invocation::NhaInvocation;
use crate::manager::{FlowManager, ManagerError};
use crate::wall::Post;

pub fn router(manager: Arc<FlowManager>) -> Router {
    Router::new()
        .route("/flows", post(create_flow))
        .route("/flows/{id}/run", post(start_run))
        .route("/flows/{id}/runs/{run_id}", get(get_run))
        .route("/invocations", get(list_invocations))
        .route("/posts", post(create_post))
        .with_state(manager)
}

pub async fn serve(manager: Arc<FlowManager>, addr: &str) -> anyhow::Result<()> {
    let app = router(manager);
    let listener = TcpListener::bind(addr).await?;
    info!("panelflow API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    edge: Option<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    members: Option<Vec<String>>,
}

impl ErrorBody {
    fn message(error: impl ToString) -> Self {
        Self { error: error.to_string(), kind: None, node: None, edge: None, members: None }
    }

    fn validation(error: &FlowError) -> Self {
        let mut body = Self::message(error);
        body.kind = Some(error.kind());
        match error {
            FlowError::UnknownBit { node, .. }
            | FlowError::Params { node, .. }
            | FlowError::Guard { node, .. } => body.node = Some(node.clone()),
            FlowError::DanglingEdge { from, to } => body.edge = Some((from.clone(), to.clone())),
            FlowError::Cycle { members } => body.members = Some(members.clone()),
            FlowError::Parse(_) => {}
        }
        body
    }
}

#[derive(Serialize)]
struct FlowCreated {
    id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

async fn create_flow(
    State(manager): State<Arc<FlowManager>>,
    Json(doc): Json<Value>,
) -> Result<(StatusCode, Json<FlowCreated>), (StatusCode, Json<ErrorBody>)> {
    match manager.register_flow(&doc) {
        Ok((id, warnings)) => Ok((StatusCode::CREATED, Json(FlowCreated { id, warnings }))),
        Err(e) => Err((StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorBody::validation(&e)))),
    }
}

#[derive(Deserialize)]
struct RunRequest {
    #[serde(default)]
    input: Value,
    mode: RunMode,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Serialize)]
struct RunAccepted {
    run_id: String,
}

async fn start_run(
    State(manager): State<Arc<FlowManager>>,
    Path(flow_id): Path<String>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunAccepted>), (StatusCode, Json<ErrorBody>)> {
    match manager.start_run(&flow_id, request.input, request.mode, request.idempotency_key) {
        Ok(run_id) => Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id }))),
        Err(e @ ManagerError::FlowNotFound(_)) => {
            Err((StatusCode::NOT_FOUND, Json(ErrorBody::message(e))))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::message(e)))),
    }
}

async fn get_run(
    State(manager): State<Arc<FlowManager>>,
    Path((flow_id, run_id)): Path<(String, String)>,
) -> Result<Json<FlowRun>, (StatusCode, Json<ErrorBody>)> {
    match manager.run_record(&run_id) {
        Some(run) if run.flow_id == flow_id => Ok(Json(run)),
        _ => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody::message(format!("run `{run_id}` not found for flow `{flow_id}`"))),
        )),
    }
}

#[derive(Deserialize)]
struct InvocationQuery {
    post_id: String,
}

async fn list_invocations(
    State(manager): State<Arc<FlowManager>>,
    Query(query): Query<InvocationQuery>,
) -> Json<Vec<NhaInvocation>> {
    Json(manager.invocations().for_post(&query.post_id))
}

#[derive(Deserialize)]
struct PostRequest {
    panel: String,
    author: String,
    text: String,
}

async fn create_post(
    State(manager): State<Arc<FlowManager>>,
    Json(request): Json<PostRequest>,
) -> Result<(StatusCode, Json<Post>), (StatusCode, Json<ErrorBody>)> {
    match manager.create_post(&request.panel, &request.author, &request.text).await {
        Ok(post) => Ok((StatusCode::CREATED, Json(post))),
        Err(e @ ManagerError::Insufficient { .. }) => {
            Err((StatusCode::PAYMENT_REQUIRED, Json(ErrorBody::message(e))))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::message(e)))),
    }
}
