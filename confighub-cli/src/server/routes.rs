use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use confighub_lib::{
    AccessKey, Capability, Change, Document, DocumentKey, Error, FileType, GrayRule, Release,
    Version,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::auth::Caller;
use super::metrics::metrics;
use super::state::AppState;
use super::watch::{long_poll, WatchOutcome, WatchTarget};

// ── Errors ───────────────────────────────────────────────────

/// Maps engine errors onto HTTP statuses with a `{code, message}` body.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Internal(msg) => {
                error!(error = %msg, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Helpers ──────────────────────────────────────────────────

fn authorize(caller: &Caller, capability: Capability) -> ApiResult<()> {
    caller.authorize(capability, Utc::now()).map_err(ApiError)
}

/// A document visible to the caller's project.
async fn owned_document(state: &AppState, caller: &Caller, id: u64) -> ApiResult<Document> {
    let document = state.versions.document(id).await?;
    if !caller.owns(&document.key.project) {
        return Err(Error::NotFound(format!("document {}", id)).into());
    }
    Ok(document)
}

async fn owned_release(state: &AppState, caller: &Caller, id: u64) -> ApiResult<Release> {
    let release = state.releases.get(id).await?;
    owned_document(state, caller, release.document_id)
        .await
        .map_err(|_| ApiError(Error::NotFound(format!("release {}", id))))?;
    Ok(release)
}

fn document_key(caller: &Caller, namespace: &str, environment: &str, name: &str) -> DocumentKey {
    DocumentKey::new(&caller.key.project, namespace, environment, name)
}

// ── GET /api/v1/config ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConfigQuery {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub env: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub name: String,
    pub namespace: String,
    pub environment: String,
    pub version: u64,
    pub commit_hash: String,
    pub content: String,
}

impl ConfigResponse {
    fn new(document: &Document, version: &Version) -> Self {
        Self {
            name: document.key.name.clone(),
            namespace: document.key.namespace.clone(),
            environment: document.key.environment.clone(),
            version: version.version,
            commit_hash: version.commit_hash().to_string(),
            content: version.content.clone(),
        }
    }
}

pub async fn handle_get_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Json<ConfigResponse>> {
    authorize(&caller, Capability::Read)?;
    let key = document_key(&caller, &query.namespace, &query.env, &query.name);

    let document = match state.versions.find(&key).await {
        Ok(document) => document,
        Err(e) => {
            metrics().config_reads.with_label_values(&["miss"]).inc();
            return Err(e.into());
        }
    };
    let number = state
        .gray
        .resolve(
            document.id,
            &document.key.environment,
            &caller.client_id,
            caller.ip.as_deref(),
        )
        .await?;
    let version = state.versions.get_by_version(document.id, number).await?;
    metrics().config_reads.with_label_values(&["hit"]).inc();
    Ok(Json(ConfigResponse::new(&document, &version)))
}

// ── PUT /api/v1/config ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub env: String,
    pub content: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct VersionCreated {
    pub version: u64,
    pub commit_hash: String,
}

impl From<Version> for VersionCreated {
    fn from(v: Version) -> Self {
        Self {
            commit_hash: v.commit_hash().to_string(),
            version: v.version,
        }
    }
}

pub async fn handle_put_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<UpdateConfigRequest>,
) -> ApiResult<Json<VersionCreated>> {
    authorize(&caller, Capability::Write)?;
    let key = document_key(&caller, &body.namespace, &body.env, &body.name);
    let document = state.versions.find(&key).await?;
    let version = state
        .versions
        .append(document.id, &body.content, &body.message, caller.author())
        .await?;
    Ok(Json(version.into()))
}

// ── POST /api/v1/config ──────────────────────────────────────

fn default_file_type() -> FileType {
    FileType::Json
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, alias = "env")]
    pub environment: String,
    #[serde(default = "default_file_type")]
    pub file_type: FileType,
    pub content: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedConfig {
    pub id: u64,
    pub name: String,
    pub namespace: String,
    pub environment: String,
    pub version: u64,
}

pub async fn handle_create_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateConfigRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    authorize(&caller, Capability::Write)?;
    let key = document_key(&caller, &body.namespace, &body.environment, &body.name);
    let (document, version) = state
        .versions
        .create(&key, body.file_type, &body.content, &body.message, caller.author())
        .await?;
    let created = CreatedConfig {
        id: document.id,
        name: document.key.name,
        namespace: document.key.namespace,
        environment: document.key.environment,
        version: version.version,
    };
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "config": created })),
    ))
}

// ── GET /api/v1/config/watch ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub version: u64,
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct WatchResponse {
    pub changed: bool,
    #[serde(flatten)]
    pub config: ConfigResponse,
}

pub async fn handle_watch_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<WatchQuery>,
) -> ApiResult<Response> {
    authorize(&caller, Capability::Read)?;
    let key = document_key(&caller, &query.namespace, &query.env, &query.name);
    let document = state.versions.find(&key).await?;
    let wait = state.watch.timeout_for(query.timeout);

    let target = WatchTarget {
        document_id: document.id,
        environment: &document.key.environment,
        caller_id: &caller.client_id,
        caller_ip: caller.ip.as_deref(),
        known_version: query.version,
    };
    match long_poll(&state.hub, &state.gray, target, wait).await? {
        WatchOutcome::Changed(number) => {
            let version = state.versions.get_by_version(document.id, number).await?;
            let body = WatchResponse {
                changed: true,
                config: ConfigResponse::new(&document, &version),
            };
            Ok(Json(body).into_response())
        }
        WatchOutcome::Unchanged => Ok(StatusCode::NOT_MODIFIED.into_response()),
    }
}

// ── /api/v1/configs/{id} ─────────────────────────────────────

pub async fn handle_get_document(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Document>> {
    authorize(&caller, Capability::Read)?;
    Ok(Json(owned_document(&state, &caller, id).await?))
}

pub async fn handle_delete_document(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<StatusCode> {
    authorize(&caller, Capability::Delete)?;
    owned_document(&state, &caller, id).await?;
    state.versions.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_list_versions(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<Version>>> {
    authorize(&caller, Capability::Read)?;
    owned_document(&state, &caller, id).await?;
    Ok(Json(state.versions.list(id).await?))
}

pub async fn handle_get_version(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((id, number)): Path<(u64, u64)>,
) -> ApiResult<Json<Version>> {
    authorize(&caller, Capability::Read)?;
    owned_document(&state, &caller, id).await?;
    Ok(Json(state.versions.get_by_version(id, number).await?))
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub from: u64,
    pub to: u64,
    pub changes: Vec<Change>,
}

pub async fn handle_diff(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<DiffResponse>> {
    authorize(&caller, Capability::Read)?;
    owned_document(&state, &caller, id).await?;
    let changes = state.versions.diff(id, query.from, query.to).await?;
    Ok(Json(DiffResponse {
        from: query.from,
        to: query.to,
        changes,
    }))
}

pub async fn handle_rollback(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((id, target)): Path<(u64, u64)>,
) -> ApiResult<Json<VersionCreated>> {
    authorize(&caller, Capability::Write)?;
    owned_document(&state, &caller, id).await?;
    let version = state.versions.rollback(id, target, caller.author()).await?;
    Ok(Json(version.into()))
}

// ── Releases ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReleaseRequest {
    pub environment: Option<String>,
    pub version: Option<u64>,
}

pub async fn handle_release(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    body: Option<Json<ReleaseRequest>>,
) -> ApiResult<(StatusCode, Json<Release>)> {
    authorize(&caller, Capability::Release)?;
    owned_document(&state, &caller, id).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let release = state
        .releases
        .release(id, body.environment.as_deref(), body.version, caller.author())
        .await?;
    Ok((StatusCode::CREATED, Json(release)))
}

pub async fn handle_list_releases(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<Release>>> {
    authorize(&caller, Capability::Read)?;
    owned_document(&state, &caller, id).await?;
    Ok(Json(state.releases.list(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct GrayReleaseRequest {
    pub environment: Option<String>,
    pub version: Option<u64>,
    pub rule: GrayRule,
}

pub async fn handle_gray_release(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(body): Json<GrayReleaseRequest>,
) -> ApiResult<(StatusCode, Json<Release>)> {
    authorize(&caller, Capability::Release)?;
    owned_document(&state, &caller, id).await?;
    let release = state
        .gray
        .create_gray(
            id,
            body.environment.as_deref(),
            body.version,
            body.rule,
            caller.author(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(release)))
}

pub async fn handle_promote(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Release>> {
    authorize(&caller, Capability::Release)?;
    owned_release(&state, &caller, id).await?;
    Ok(Json(state.gray.promote(id, caller.author()).await?))
}

pub async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Release>> {
    authorize(&caller, Capability::Release)?;
    owned_release(&state, &caller, id).await?;
    Ok(Json(state.gray.cancel(id).await?))
}

pub async fn handle_rollback_release(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Release>> {
    authorize(&caller, Capability::Release)?;
    owned_release(&state, &caller, id).await?;
    Ok(Json(
        state.releases.rollback_release(id, caller.author()).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct PercentageRequest {
    pub percentage: u32,
}

pub async fn handle_update_percentage(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<u64>,
    Json(body): Json<PercentageRequest>,
) -> ApiResult<Json<Release>> {
    authorize(&caller, Capability::Release)?;
    owned_release(&state, &caller, id).await?;
    Ok(Json(
        state.gray.update_percentage(id, body.percentage).await?,
    ))
}

// ── POST /api/v1/keys ────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct KeyRegistered {
    pub access_key: String,
    pub name: String,
    pub project: String,
}

pub async fn handle_register_key(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(key): Json<AccessKey>,
) -> ApiResult<(StatusCode, Json<KeyRegistered>)> {
    authorize(&caller, Capability::Admin)?;
    if key.access_key.trim().is_empty() || key.secret.is_empty() {
        return Err(Error::Validation("access_key and secret are required".into()).into());
    }
    if key.project.trim().is_empty() {
        return Err(Error::Validation("project is required".into()).into());
    }
    if !caller.owns(&key.project) {
        return Err(Error::Forbidden(format!(
            "cannot register keys for project {}",
            key.project
        ))
        .into());
    }
    if let Some(existing) = state.store.get_access_key(&key.access_key).await? {
        if !caller.owns(&existing.project) {
            return Err(Error::Conflict(format!(
                "access key {} belongs to another project",
                key.access_key
            ))
            .into());
        }
    }
    let registered = KeyRegistered {
        access_key: key.access_key.clone(),
        name: key.name.clone(),
        project: key.project.clone(),
    };
    state.store.put_access_key(key).await?;
    info!(
        access_key = %registered.access_key,
        project = %registered.project,
        by = caller.author(),
        "access key registered"
    );
    Ok((StatusCode::CREATED, Json(registered)))
}
