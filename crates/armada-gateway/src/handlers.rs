use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
    Json,
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use armada_cluster::{AddNodeOptions, BuildOptions};
use armada_common::{ArmadaError, DeployOptions, SchedulerMode};

use crate::state::AppState;

fn error_response(e: ArmadaError) -> Response {
    let status = match &e {
        ArmadaError::NotFound { .. } => StatusCode::NOT_FOUND,
        ArmadaError::BadMemory(_)
        | ArmadaError::BadCount(_)
        | ArmadaError::NoNodes
        | ArmadaError::InsufficientRes(_)
        | ArmadaError::InsufficientCpu(_)
        | ArmadaError::BuildFailed(_) => StatusCode::BAD_REQUEST,
        ArmadaError::LockTimeout(_) => StatusCode::CONFLICT,
        ArmadaError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Wrap an orchestrator result stream as server-sent events, one JSON
/// message per event. The stream carries its own terminal messages; the
/// connection closes when it does.
fn sse_events<S, T>(stream: S) -> Response
where
    S: Stream<Item = T> + Send + 'static,
    T: serde::Serialize,
{
    let events = stream.map(|msg| {
        let data = serde_json::to_string(&msg).unwrap_or_else(|_| "{}".to_string());
        Ok::<Event, Infallible>(Event::default().data(data))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// -- pods --

#[derive(Debug, Deserialize)]
pub struct AddPodRequest {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub scheduler: SchedulerMode,
}

pub async fn add_pod(State(st): State<AppState>, Json(req): Json<AddPodRequest>) -> Response {
    match st.cluster.add_pod(&req.name, &req.desc, req.scheduler).await {
        Ok(pod) => (StatusCode::CREATED, Json(pod)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_pods(State(st): State<AppState>) -> Response {
    match st.cluster.list_pods().await {
        Ok(pods) => Json(pods).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_pod(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.cluster.get_pod(&name).await {
        Ok(pod) => Json(pod).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn remove_pod(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.cluster.remove_pod(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn pod_resource(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.cluster.pod_resource(&name).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

// -- nodes --

#[derive(Debug, Deserialize)]
pub struct NodesQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn add_node(State(st): State<AppState>, Json(req): Json<AddNodeOptions>) -> Response {
    match st.cluster.add_node(req).await {
        Ok(node) => (StatusCode::CREATED, Json(node)).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_pod_nodes(
    State(st): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<NodesQuery>,
) -> Response {
    match st.cluster.list_pod_nodes(&name, q.all).await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_node(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.cluster.get_node(&name).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn remove_node(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    match st.cluster.remove_node(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
}

pub async fn set_node_availability(
    State(st): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<AvailabilityRequest>,
) -> Response {
    match st.cluster.set_node_availability(&name, req.available).await {
        Ok(node) => Json(node).into_response(),
        Err(e) => error_response(e),
    }
}

// -- containers --

#[derive(Debug, Deserialize)]
pub struct ListContainersQuery {
    pub appname: Option<String>,
    pub entrypoint: Option<String>,
    pub nodename: Option<String>,
}

pub async fn get_container(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    match st.cluster.get_container(&id).await {
        Ok(container) => Json(container).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn list_containers(
    State(st): State<AppState>,
    Query(q): Query<ListContainersQuery>,
) -> Response {
    match st
        .cluster
        .list_containers(q.appname.as_deref(), q.entrypoint.as_deref(), q.nodename.as_deref())
        .await
    {
        Ok(containers) => Json(containers).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub workdir: String,
}

pub async fn execute_container(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Response {
    match st
        .cluster
        .execute_container(&id, &req.cmd, &req.envs, &req.workdir)
        .await
    {
        Ok(output) => Json(json!({ "output": output })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
}

pub async fn container_logs(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    match st.cluster.container_logs(&id, q.follow).await {
        Ok(stream) => sse_events(stream.map(|line| json!({ "line": line }))),
        Err(e) => error_response(e),
    }
}

pub async fn watch_status(
    State(st): State<AppState>,
    Path((appname, entrypoint)): Path<(String, String)>,
) -> Response {
    match st.cluster.watch_container_status(&appname, &entrypoint).await {
        Ok(stream) => sse_events(stream.map(|ev| json!({ "id": ev.id, "status": ev.status }))),
        Err(e) => error_response(e),
    }
}

// -- streaming operations --

pub async fn deploy(State(st): State<AppState>, Json(opts): Json<DeployOptions>) -> Response {
    match st.cluster.create_container(opts).await {
        Ok(stream) => sse_events(stream),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplaceRequest {
    pub ids: Vec<String>,
    pub image: String,
}

pub async fn replace(State(st): State<AppState>, Json(req): Json<ReplaceRequest>) -> Response {
    match st.cluster.replace_container(req.ids, req.image).await {
        Ok(stream) => sse_events(stream),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RemoveRequest {
    pub ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(State(st): State<AppState>, Json(req): Json<RemoveRequest>) -> Response {
    match st.cluster.remove_container(req.ids, req.force).await {
        Ok(stream) => sse_events(stream),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BuildRequest {
    pub name: String,
    pub tag: String,
    pub base: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub user: String,
    pub uid: u32,
}

pub async fn build(State(st): State<AppState>, Json(req): Json<BuildRequest>) -> Response {
    let opts = BuildOptions {
        name: req.name,
        tag: req.tag,
        base: req.base,
        repo: req.repo,
        version: req.version,
        artifacts: req.artifacts,
        commands: req.commands,
        user: req.user,
        uid: req.uid,
    };
    match st.cluster.build_image(opts).await {
        Ok(stream) => sse_events(stream),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub ids: Vec<String>,
    /// path → file content
    pub data: BTreeMap<String, String>,
}

pub async fn send(State(st): State<AppState>, Json(req): Json<SendRequest>) -> Response {
    let data: BTreeMap<String, Vec<u8>> = req
        .data
        .into_iter()
        .map(|(path, content)| (path, content.into_bytes()))
        .collect();
    match st.cluster.send_file(req.ids, data).await {
        Ok(stream) => sse_events(stream),
        Err(e) => error_response(e),
    }
}
