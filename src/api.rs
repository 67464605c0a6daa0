//! HTTP control plane consumed by simulators.
//!
//! Every response body is text: either the primitive result (an id, an IP
//! address, an enode URL) or a JSON document for structured replies.
//! Client mistakes come back as 4xx with a plain-text message, backend
//! failures as 5xx after any partial state has been rolled back.

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::container::{BackendError, FileMount};
use crate::manager::{HiveError, TestManager};
use crate::types::{ClientDefinition, SuiteID, TestID, TestResult};

/// Chain fixtures can be large; the axum default of 2 MiB is far too small.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Multipart header marking a part as a tar archive to extract at the
/// container root.
const FILETYPE_HEADER: &str = "x-hive-filetype";

pub fn router(manager: Arc<TestManager>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/clients", get(list_clients))
        .route("/testsuite", post(start_suite))
        .route("/testsuite/:sid", delete(end_suite))
        .route("/testsuite/:sid/test", post(start_test))
        .route("/testsuite/:sid/test/:tid", post(end_test))
        .route("/testsuite/:sid/test/:tid/node", post(start_client))
        .route(
            "/testsuite/:sid/test/:tid/node/:nid",
            get(node_enode).delete(stop_client),
        )
        .route("/testsuite/:sid/test/:tid/node/:nid/exec", post(run_program))
        .route(
            "/testsuite/:sid/network/:name",
            post(create_network).delete(remove_network),
        )
        .route(
            "/testsuite/:sid/network/:name/:cid",
            get(network_ip).post(connect_container).delete(disconnect_container),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(manager)
}

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<T, ApiError>;

fn http_err(err: HiveError) -> ApiError {
    let status = match &err {
        HiveError::NoSuchSuite
        | HiveError::NoSuchTest
        | HiveError::NoSuchNode
        | HiveError::NoSuchNetwork => StatusCode::NOT_FOUND,
        HiveError::MissingClientType
        | HiveError::UnknownClientType(_)
        | HiveError::ReservedNetworkName(_)
        | HiveError::DuplicateNetwork(_)
        | HiveError::NoSimulator => StatusCode::BAD_REQUEST,
        HiveError::Backend(BackendError::NotAttached(..)) => StatusCode::BAD_REQUEST,
        HiveError::EnodeFailure(_) | HiveError::Backend(_) | HiveError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.into())
}

// === Host ===

async fn health(State(manager): State<Arc<TestManager>>) -> String {
    format!("hive {}", manager.instance())
}

async fn list_clients(State(manager): State<Arc<TestManager>>) -> Json<Vec<ClientDefinition>> {
    Json(manager.client_definitions())
}

// === Suites ===

async fn start_suite(
    State(manager): State<Arc<TestManager>>,
    Form(form): Form<HashMap<String, String>>,
) -> String {
    let name = form.get("name").cloned().unwrap_or_default();
    let description = form.get("description").cloned().unwrap_or_default();
    let sim_log = form.get("simlog").cloned().unwrap_or_default();
    manager.start_suite(name, description, sim_log).to_string()
}

async fn end_suite(
    State(manager): State<Arc<TestManager>>,
    Path(sid): Path<SuiteID>,
) -> ApiResult<String> {
    manager.end_suite(sid).await.map_err(http_err)?;
    Ok(String::new())
}

// === Tests ===

async fn start_test(
    State(manager): State<Arc<TestManager>>,
    Path(sid): Path<SuiteID>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult<String> {
    let name = form.get("name").cloned().unwrap_or_default();
    let description = form.get("description").cloned().unwrap_or_default();
    let tid = manager
        .start_test(sid, name, description)
        .map_err(http_err)?;
    Ok(tid.to_string())
}

async fn end_test(
    State(manager): State<Arc<TestManager>>,
    Path((sid, tid)): Path<(SuiteID, TestID)>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult<String> {
    let raw = form
        .get("summaryresult")
        .ok_or_else(|| bad_request("missing summaryresult form field"))?;
    let result: TestResult = serde_json::from_str(raw)
        .map_err(|err| bad_request(format!("invalid summaryresult: {}", err)))?;
    manager.end_test(sid, tid, result).await.map_err(http_err)?;
    Ok(String::new())
}

// === Nodes ===

async fn start_client(
    State(manager): State<Arc<TestManager>>,
    Path((sid, tid)): Path<(SuiteID, TestID)>,
    mut multipart: Multipart,
) -> ApiResult<String> {
    let mut params = HashMap::new();
    let mut files = Vec::new();
    let mut tar_archives = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("invalid multipart body: {}", err)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let is_tar = field
            .headers()
            .get(FILETYPE_HEADER)
            .map(|v| v.as_bytes().eq_ignore_ascii_case(b"tar"))
            .unwrap_or(false);

        if is_tar {
            let data = field
                .bytes()
                .await
                .map_err(|err| bad_request(format!("bad upload {:?}: {}", name, err)))?;
            tar_archives.push(data);
        } else if field.file_name().is_some() {
            // The field name is the destination path inside the container.
            let data = field
                .bytes()
                .await
                .map_err(|err| bad_request(format!("bad upload {:?}: {}", name, err)))?;
            files.push(FileMount {
                container_path: name,
                contents: data.to_vec(),
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| bad_request(format!("bad form field {:?}: {}", name, err)))?;
            params.insert(name, value);
        }
    }

    let (container, ip) = manager
        .start_client(sid, tid, params, files, tar_archives)
        .await
        .map_err(http_err)?;
    Ok(format!("{}@{}", container, ip))
}

async fn stop_client(
    State(manager): State<Arc<TestManager>>,
    Path((sid, tid, nid)): Path<(SuiteID, TestID, String)>,
) -> ApiResult<String> {
    manager.stop_client(sid, tid, &nid).await.map_err(http_err)?;
    Ok(String::new())
}

async fn node_enode(
    State(manager): State<Arc<TestManager>>,
    Path((sid, tid, nid)): Path<(SuiteID, TestID, String)>,
) -> ApiResult<String> {
    manager.enode_url(sid, tid, &nid).await.map_err(http_err)
}

#[derive(Debug, Serialize, Deserialize)]
struct ExecResult {
    out: String,
    err: String,
    code: i64,
}

async fn run_program(
    State(manager): State<Arc<TestManager>>,
    Path((sid, tid, nid)): Path<(SuiteID, TestID, String)>,
    Query(query): Query<Vec<(String, String)>>,
) -> ApiResult<Json<ExecResult>> {
    let mut cmd = Vec::new();
    let mut user = None;
    let mut privileged = false;
    for (key, value) in query {
        match key.as_str() {
            "cmd" => cmd.push(value),
            "user" if !value.is_empty() => user = Some(value),
            "privileged" => privileged = matches!(value.as_str(), "true" | "1"),
            _ => {}
        }
    }
    if cmd.is_empty() {
        return Err(bad_request("missing cmd query parameter"));
    }

    let output = manager
        .run_program(sid, tid, &nid, cmd, user, privileged)
        .await
        .map_err(http_err)?;
    Ok(Json(ExecResult {
        out: output.stdout,
        err: output.stderr,
        code: output.exit_code,
    }))
}

// === Networks ===

async fn create_network(
    State(manager): State<Arc<TestManager>>,
    Path((sid, name)): Path<(SuiteID, String)>,
) -> ApiResult<String> {
    manager.create_network(sid, &name).await.map_err(http_err)?;
    Ok(String::new())
}

async fn remove_network(
    State(manager): State<Arc<TestManager>>,
    Path((sid, name)): Path<(SuiteID, String)>,
) -> ApiResult<String> {
    manager.remove_network(sid, &name).await.map_err(http_err)?;
    Ok(String::new())
}

async fn connect_container(
    State(manager): State<Arc<TestManager>>,
    Path((sid, name, cid)): Path<(SuiteID, String, String)>,
) -> ApiResult<String> {
    manager
        .connect_container(sid, &name, &cid)
        .await
        .map_err(http_err)?;
    Ok(String::new())
}

async fn disconnect_container(
    State(manager): State<Arc<TestManager>>,
    Path((sid, name, cid)): Path<(SuiteID, String, String)>,
) -> ApiResult<String> {
    manager
        .disconnect_container(sid, &name, &cid)
        .await
        .map_err(http_err)?;
    Ok(String::new())
}

async fn network_ip(
    State(manager): State<Arc<TestManager>>,
    Path((sid, name, cid)): Path<(SuiteID, String, String)>,
) -> ApiResult<String> {
    let ip = manager
        .container_ip(sid, &name, &cid)
        .await
        .map_err(http_err)?;
    Ok(ip.to_string())
}
