use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{middleware, Json, Router};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::executor::{CloneSpec, InFlight, Operation, ServiceSpec};
use crate::domain::types::*;
use crate::domain::Services;
use crate::error::Error;

use super::auth::{basic_auth_middleware, Credentials};

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub started_at: Instant,
}

/// Domain error rendered as `{"error": ...}` with a matching status code.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Duplicate { .. } | Error::InFlight { .. } => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Remote { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Routes under `/api` require Basic credentials; `/health` does not.
pub fn router(state: AppState, credentials: Arc<Credentials>) -> Router {
    let api = Router::new()
        .route("/api/status", get(status))
        .route("/api/operations", get(operations))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/{name}", get(get_node))
        .route("/api/nodes/{name}/{action}", post(node_action))
        .route("/api/resources", get(list_resources))
        .route("/api/resources/{vmid}", get(get_resource).delete(delete_resource))
        .route("/api/resources/{vmid}/services", get(installed_services))
        .route("/api/resources/{vmid}/clone", post(clone_resource))
        .route("/api/resources/{vmid}/deploy", post(deploy_resource))
        .route("/api/resources/{vmid}/{action}", post(resource_action))
        .route("/api/containers/next-vmid", get(next_vmid))
        .route("/api/containers/clone", post(clone_container))
        .route("/api/containers/deploy-node", post(deploy_container))
        .route("/api/containers/{vmid}", delete(delete_resource))
        .route("/api/containers/{vmid}/services", get(installed_services))
        .route("/api/whitelist", get(list_whitelist).post(add_whitelist))
        .route(
            "/api/whitelist/{id}",
            patch(update_whitelist)
                .put(update_whitelist)
                .delete(remove_whitelist),
        )
        .route("/api/logs", get(query_logs))
        .route("/api/logs/{id}", get(get_log))
        .route_layer(middleware::from_fn_with_state(
            credentials,
            basic_auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn status(State(state): State<AppState>) -> ApiResult<SystemStatus> {
    Ok(Json(state.services.status.status(Utc::now())?))
}

async fn operations(State(state): State<AppState>) -> Json<Vec<InFlight>> {
    Json(state.services.executor.in_flight())
}

// ── Inventory ──────────────────────────────────────────────

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Vec<Node>> {
    Ok(Json(state.services.registry.list_nodes()?))
}

async fn get_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Node> {
    Ok(Json(state.services.registry.get_node(&name)?))
}

#[derive(Debug, Default, Deserialize)]
struct NodeQuery {
    node: Option<String>,
}

async fn list_resources(State(state): State<AppState>) -> ApiResult<Vec<Resource>> {
    Ok(Json(state.services.registry.list_resources()?))
}

async fn get_resource(
    State(state): State<AppState>,
    Path(vmid): Path<String>,
    Query(q): Query<NodeQuery>,
) -> ApiResult<Resource> {
    let vmid = parse_vmid(&vmid)?;
    Ok(Json(
        state
            .services
            .registry
            .find_resource(vmid, q.node.as_deref())?,
    ))
}

async fn installed_services(
    State(state): State<AppState>,
    Path(vmid): Path<String>,
    Query(q): Query<NodeQuery>,
) -> ApiResult<Vec<InstalledService>> {
    let vmid = parse_vmid(&vmid)?;
    Ok(Json(
        state
            .services
            .registry
            .services_for(vmid, q.node.as_deref())?,
    ))
}

async fn next_vmid(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    let vmid = state.services.registry.suggest_vmid()?;
    Ok(Json(json!({ "suggested_vmid": vmid })))
}

// ── Lifecycle ──────────────────────────────────────────────

const DEFAULT_ACTOR: &str = "dashboard";

/// Optional body of manual lifecycle requests.
#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    triggered_by: Option<String>,
}

fn actor(triggered_by: Option<String>) -> String {
    triggered_by
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

fn power_operation(action: &str, target: Target) -> Result<Operation, Error> {
    match action {
        "start" => Ok(Operation::Start(target)),
        "stop" => Ok(Operation::Stop(target)),
        "restart" | "reboot" => Ok(Operation::Restart(target)),
        other => Err(Error::Validation(format!("unknown action: {}", other))),
    }
}

async fn dispatch(
    state: &AppState,
    op: Operation,
    triggered_by: Option<String>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let entry = state
        .services
        .executor
        .execute(op, &actor(triggered_by), TriggerType::Manual)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(entry)))
}

async fn node_action(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
    body: Option<Json<ActionBody>>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let op = power_operation(&action, Target::node(&name))?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    dispatch(&state, op, body.triggered_by).await
}

async fn resource_action(
    State(state): State<AppState>,
    Path((vmid, action)): Path<(String, String)>,
    Query(q): Query<NodeQuery>,
    body: Option<Json<ActionBody>>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let vmid = parse_vmid(&vmid)?;
    let resource = state
        .services
        .registry
        .find_resource(vmid, q.node.as_deref())?;
    let op = power_operation(&action, Target::resource(vmid, &resource.node))?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    dispatch(&state, op, body.triggered_by).await
}

async fn delete_resource(
    State(state): State<AppState>,
    Path(vmid): Path<String>,
    Query(q): Query<NodeQuery>,
    body: Option<Json<ActionBody>>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let vmid = parse_vmid(&vmid)?;
    let resource = state
        .services
        .registry
        .find_resource(vmid, q.node.as_deref())?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    dispatch(
        &state,
        Operation::Delete(resource.reference()),
        body.triggered_by,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct CloneBody {
    new_vmid: u32,
    target_node: String,
    hostname: Option<String>,
    /// Disambiguates the source when its vmid exists on several nodes.
    source_node: Option<String>,
    triggered_by: Option<String>,
    #[serde(default)]
    commands: Vec<String>,
    service_name: Option<String>,
    service_type: Option<String>,
}

impl CloneBody {
    fn spec(&self, source_vmid: u32) -> CloneSpec {
        CloneSpec {
            source_vmid,
            source_node: self.source_node.clone(),
            new_vmid: self.new_vmid,
            target_node: self.target_node.clone(),
            hostname: self.hostname.clone(),
        }
    }

    fn deploy(&self, source_vmid: u32) -> Operation {
        Operation::Deploy {
            clone: self.spec(source_vmid),
            commands: self.commands.clone(),
            service: ServiceSpec {
                name: self.service_name.clone(),
                service_type: self.service_type.clone(),
            },
        }
    }
}

/// Container-form body: the source travels in the body instead of the path.
#[derive(Debug, Deserialize)]
struct SourcedCloneBody {
    source_vmid: u32,
    #[serde(flatten)]
    body: CloneBody,
}

async fn clone_resource(
    State(state): State<AppState>,
    Path(vmid): Path<String>,
    Json(body): Json<CloneBody>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let op = Operation::Clone(body.spec(parse_vmid(&vmid)?));
    dispatch(&state, op, body.triggered_by).await
}

async fn deploy_resource(
    State(state): State<AppState>,
    Path(vmid): Path<String>,
    Json(body): Json<CloneBody>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let op = body.deploy(parse_vmid(&vmid)?);
    dispatch(&state, op, body.triggered_by).await
}

async fn clone_container(
    State(state): State<AppState>,
    Json(SourcedCloneBody { source_vmid, body }): Json<SourcedCloneBody>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let op = Operation::Clone(body.spec(source_vmid));
    dispatch(&state, op, body.triggered_by).await
}

async fn deploy_container(
    State(state): State<AppState>,
    Json(SourcedCloneBody { source_vmid, body }): Json<SourcedCloneBody>,
) -> Result<(StatusCode, Json<RestartLogEntry>), ApiError> {
    let op = body.deploy(source_vmid);
    dispatch(&state, op, body.triggered_by).await
}

// ── Whitelist ──────────────────────────────────────────────

async fn list_whitelist(State(state): State<AppState>) -> ApiResult<Vec<WhitelistEntry>> {
    Ok(Json(state.services.whitelist.list()?))
}

/// Either `{vmid, node}` (resource) or `{node_name}` (node).
#[derive(Debug, Deserialize, Serialize)]
pub struct AddWhitelistBody {
    pub vmid: Option<u32>,
    pub node: Option<String>,
    pub node_name: Option<String>,
    pub created_by: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub interval_hours: Option<u32>,
}

impl AddWhitelistBody {
    fn target(&self) -> Result<Target, Error> {
        match (self.vmid, &self.node, &self.node_name) {
            (Some(vmid), Some(node), None) => Ok(Target::resource(vmid, node)),
            (None, None, Some(name)) => Ok(Target::node(name)),
            _ => Err(Error::Validation(
                "expected either vmid and node, or node_name".to_string(),
            )),
        }
    }
}

async fn add_whitelist(
    State(state): State<AppState>,
    Json(body): Json<AddWhitelistBody>,
) -> Result<(StatusCode, Json<WhitelistEntry>), ApiError> {
    let entry = state.services.whitelist.add(
        body.target()?,
        &actor(body.created_by.clone()),
        &body.notes,
        body.interval_hours,
    )?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpdateWhitelistBody {
    pub enabled: Option<bool>,
    pub notes: Option<String>,
}

async fn update_whitelist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateWhitelistBody>,
) -> ApiResult<WhitelistEntry> {
    Ok(Json(state.services.whitelist.update(
        id,
        body.enabled,
        body.notes.as_deref(),
    )?))
}

async fn remove_whitelist(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.services.whitelist.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Logs ───────────────────────────────────────────────────

/// Raw log query parameters; parsed by hand so bad input is a 400 with
/// the usual error body.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LogsQuery {
    pub vmid: Option<String>,
    pub resource_name: Option<String>,
    pub node: Option<String>,
    pub action: Option<String>,
    pub trigger_type: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
}

impl LogsQuery {
    pub fn into_filter(self) -> Result<LogFilter, Error> {
        Ok(LogFilter {
            vmid: non_empty(self.vmid).map(|v| parse_vmid(&v)).transpose()?,
            resource_name: non_empty(self.resource_name),
            node: non_empty(self.node),
            action: non_empty(self.action).map(|s| s.parse()).transpose()?,
            trigger_type: non_empty(self.trigger_type).map(|s| s.parse()).transpose()?,
            status: non_empty(self.status).map(|s| s.parse()).transpose()?,
            start_date: non_empty(self.start_date)
                .map(|s| parse_date(&s, false))
                .transpose()?,
            end_date: non_empty(self.end_date)
                .map(|s| parse_date(&s, true))
                .transpose()?,
            limit: non_empty(self.limit)
                .map(|s| parse_number(&s, "limit"))
                .transpose()?,
            offset: non_empty(self.offset)
                .map(|s| parse_number(&s, "offset"))
                .transpose()?,
        })
    }
}

async fn query_logs(
    State(state): State<AppState>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Vec<RestartLogEntry>> {
    let filter = q.into_filter()?;
    Ok(Json(state.services.audit.query(&filter)?))
}

async fn get_log(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<RestartLogEntry> {
    Ok(Json(state.services.audit.get(id)?))
}

// ── Parsing helpers ────────────────────────────────────────

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_vmid(s: &str) -> Result<u32, Error> {
    s.trim()
        .parse()
        .map_err(|_| Error::Validation(format!("vmid must be numeric, got {:?}", s)))
}

fn parse_number(s: &str, field: &str) -> Result<u32, Error> {
    s.parse()
        .map_err(|_| Error::Validation(format!("{} must be a non-negative integer", field)))
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` date. A bare end date covers
/// the whole day.
pub fn parse_date(s: &str, end_of_day: bool) -> Result<DateTime<Utc>, Error> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Error::Validation(format!("invalid date: {}", s)))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| Error::Internal("invalid time of day".to_string()))?;
    Ok(date.and_time(time).and_utc())
}
