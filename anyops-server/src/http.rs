//! Control-plane HTTP API.
//!
//! One axum router under /api/v1 with a bearer-token middleware in
//! front of everything except login and the agent heartbeat sink. The
//! resolved user rides in request extensions so handlers can attribute
//! audit entries.

use crate::auth::{bearer_token, CurrentUser, LoginRequest, Sessions, LOGIN_FAILED_MSG, UNAUTHORIZED_MSG};
use crate::bootstrap::Bootstrapper;
use crate::calculator::{self, CalculateRequest};
use crate::containers::{self, ContainerActionRequest};
use crate::deploy;
use crate::keys::IdentityStore;
use crate::models::{now_rfc3339, BackupRecord, DeploymentConfig, DeploymentNode, ImportTask, User};
use crate::probe::{self, ProbeRequest};
use crate::registry::NodeRegistry;
use crate::store::{next_id, Store};
use crate::uploads::{FinalizeRequest, InitRequest, UploadError, UploadManager};
use anyops_common::{Heartbeat, HEARTBEAT_PATH};
use axum::extract::multipart::Multipart;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub store: Store,
    pub ids: IdentityStore,
    pub sessions: Sessions,
    pub audit: crate::audit::AuditLog,
    pub uploads: UploadManager,
    pub bootstrapper: Bootstrapper,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/v1/login", post(login))
        .route("/api/v1/logout", post(logout))
        .route(HEARTBEAT_PATH, post(receive_heartbeat))
        .route("/api/v1/health", get(|| async { "ok" }))
        .route("/api/v1/system/stats", get(system_stats))
        .route("/api/v1/dashboard/stats", get(dashboard_stats))
        .route("/api/v1/container/control", post(control_container))
        .route("/api/v1/deploy/status", get(agent_status))
        .route("/api/v1/deploy/generate", post(generate_deployment))
        .route("/api/v1/deploy/nodes", get(get_nodes).post(save_nodes))
        .route("/api/v1/deploy/ssh-key", get(ssh_public_key))
        .route("/api/v1/deploy/public-key", get(encryption_public_key))
        .route("/api/v1/deploy/verify-ssh", post(verify_ssh))
        .route("/api/v1/deploy/test-connection", post(test_connection))
        .route("/api/v1/deploy/vllm-models", post(vllm_models))
        .route("/api/v1/deploy/calculate", post(calculate_vllm_config))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/{name}", delete(delete_model))
        .route("/api/v1/models/upload/init", post(upload_init))
        // The dashboard streams models in 5 MB chunks; axum's default
        // 2 MB body cap would refuse every one of them.
        .route(
            "/api/v1/models/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(64 * 1024 * 1024)),
        )
        .route("/api/v1/models/upload/finalize", post(upload_finalize))
        .route("/api/v1/users", get(list_users).post(create_user))
        .route("/api/v1/users/{id}", put(update_user).delete(delete_user))
        .route("/api/v1/import-tasks", get(list_import_tasks).post(create_import_task))
        .route("/api/v1/backups", get(list_backups).post(create_backup))
        .route("/api/v1/logs", get(recent_logs))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state)
}

/// Every route except login and the heartbeat sink requires a session
/// token. Agents authenticate by network placement, not by token.
async fn require_auth(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = req.uri().path();
    if path == "/api/v1/login" || path == HEARTBEAT_PATH {
        return Ok(next.run(req).await);
    }

    let user = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .and_then(|t| app.sessions.resolve(t));

    match user {
        Some(user) => {
            req.extensions_mut().insert(user);
            Ok(next.run(req).await)
        }
        None => Err(unauthorized()),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": UNAUTHORIZED_MSG})),
    )
        .into_response()
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!(%err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"message": err.to_string()})),
    )
}

// POST /api/v1/login
async fn login(
    State(app): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match app.sessions.login(&app.store, &app.ids, &req) {
        Some((token, user)) => {
            app.audit
                .record(&user.username, "登录", "用户登录成功", crate::audit::Level::Info);
            Ok(Json(json!({
                "token": token,
                "username": user.username,
                "role": user.role,
            })))
        }
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": LOGIN_FAILED_MSG})),
        )),
    }
}

// POST /api/v1/logout
async fn logout(
    State(app): State<AppState>,
    req: Request,
) -> Json<Value> {
    if let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
    {
        app.sessions.revoke(token);
    }
    Json(json!({"message": "ok"}))
}

// POST /api/v1/agent/heartbeat
async fn receive_heartbeat(
    State(app): State<AppState>,
    Json(hb): Json<Heartbeat>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Keep the persisted node record's hostname in sync, but only
    // touch the disk when it actually changed.
    let changed = app.store.read(|d| {
        d.deployment_nodes
            .iter()
            .any(|n| n.node_ip == hb.node_ip && n.hostname != hb.hostname)
    });
    if changed {
        let ip = hb.node_ip.clone();
        let hostname = hb.hostname.clone();
        app.store
            .write(
                move |d| {
                    if let Some(node) = d.deployment_nodes.iter_mut().find(|n| n.node_ip == ip) {
                        node.hostname = hostname;
                    }
                },
                true,
            )
            .map_err(internal)?;
    }
    app.registry.record(hb);
    Ok(Json(json!({"success": true})))
}

// GET /api/v1/system/stats
async fn system_stats(State(app): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "data": app.registry.all()}))
}

// GET /api/v1/dashboard/stats
async fn dashboard_stats(State(app): State<AppState>) -> Json<Value> {
    let nodes = app.registry.all();
    let services: Vec<Value> = nodes
        .iter()
        .flat_map(|n| {
            n.services.iter().map(|s| {
                json!({
                    "node_ip": n.node_ip,
                    "name": s.name,
                    "image": s.image,
                    "status": s.status,
                    "state": s.state,
                })
            })
        })
        .collect();
    Json(json!({
        "system": {
            "total_nodes": app.registry.len(),
            "online_nodes": app.registry.online_count(),
        },
        "services": services,
        "logs": app.audit.recent(50),
    }))
}

// GET /api/v1/logs
async fn recent_logs(State(app): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "data": app.audit.recent(200)}))
}

// POST /api/v1/container/control
async fn control_container(
    State(app): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<ContainerActionRequest>,
) -> Json<Value> {
    containers::dispatch(&app.audit, &user.username, req);
    Json(json!({"success": true, "message": "Action triggered in background"}))
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    ip: String,
}

// GET /api/v1/deploy/status?ip=...
async fn agent_status(
    State(app): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match deploy::agent_status(&app.registry, &app.store, &params.ip) {
        Some(data) => Ok(Json(json!({"success": true, "data": data}))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "message": format!("node {} has never reported", params.ip)})),
        )),
    }
}

// POST /api/v1/deploy/generate
async fn generate_deployment(
    State(app): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<DeploymentConfig>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let configs = deploy::apply_wizard(&app.store, &app.registry, &req).map_err(internal)?;
    deploy::spawn_bootstraps(&app.bootstrapper, &app.audit, &user.username, &req);
    Ok(Json(json!({
        "message": "Deployment Started",
        "container_id": "pending",
        "artifacts": deploy::wizard_artifacts(&configs[0]),
    })))
}

// GET /api/v1/deploy/nodes
async fn get_nodes(State(app): State<AppState>) -> Json<Value> {
    let nodes = app.store.read(|d| d.deployment_nodes.clone());
    Json(json!({"success": true, "data": nodes}))
}

// POST /api/v1/deploy/nodes (full replace)
async fn save_nodes(
    State(app): State<AppState>,
    Json(nodes): Json<Vec<DeploymentNode>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    app.store
        .write(|d| d.deployment_nodes = nodes, true)
        .map_err(internal)?;
    Ok(Json(json!({"success": true})))
}

// GET /api/v1/deploy/ssh-key — the authorized_keys line for the fleet.
async fn ssh_public_key(
    State(app): State<AppState>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let line = app.ids.public_key_openssh().map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], line).into_response())
}

// GET /api/v1/deploy/public-key — PKIX PEM for browser-side encryption.
async fn encryption_public_key(
    State(app): State<AppState>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let pem = app.ids.public_key_pkix_pem().map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], pem).into_response())
}

#[derive(Debug, Deserialize)]
struct VerifySshRequest {
    hosts: String,
}

// POST /api/v1/deploy/verify-ssh — full SSH round-trip per node.
async fn verify_ssh(
    State(app): State<AppState>,
    Json(req): Json<VerifySshRequest>,
) -> Json<deploy::SshVerifyOutcome> {
    Json(deploy::verify_ssh(&app.ids, &req.hosts).await)
}

// POST /api/v1/deploy/test-connection
async fn test_connection(Json(req): Json<ProbeRequest>) -> Json<probe::ProbeResult> {
    Json(probe::probe(&req).await)
}

#[derive(Debug, Deserialize)]
struct VllmModelsRequest {
    host: String,
    #[serde(default)]
    port: String,
}

// POST /api/v1/deploy/vllm-models — proxy the engine's model list.
async fn vllm_models(
    Json(req): Json<VllmModelsRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match deploy::fetch_vllm_models(&req.host, &req.port).await {
        Ok((status, body)) => {
            let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
            Ok((
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
                Json(value),
            ))
        }
        Err(message) => Err((StatusCode::BAD_GATEWAY, Json(json!({"message": message})))),
    }
}

// POST /api/v1/deploy/calculate
async fn calculate_vllm_config(
    State(app): State<AppState>,
    Json(mut req): Json<CalculateRequest>,
) -> Json<Value> {
    if req.gpu_memory_gb <= 0.0 {
        req.gpu_memory_gb = app
            .registry
            .get(&req.node_ip)
            .map(|v| deploy::parse_gpu_memory(&v.gpu_status))
            .unwrap_or(24.0);
    }
    let model_path = app.store.read(|d| {
        d.deployment_nodes
            .iter()
            .filter(|n| req.node_ip.is_empty() || n.node_ip == req.node_ip)
            .flat_map(|n| n.inference_cfgs.iter())
            .find(|c| c.model_name == req.model_name || c.model_path == req.model_name)
            .map(|c| c.model_path.clone())
    });
    let (config, shape) = calculator::calculate(&req);
    Json(json!({
        "vllm_config": config,
        "model_config": shape,
        "model_path": model_path,
        "gpu_memory": req.gpu_memory_gb,
        "node_ip": req.node_ip,
    }))
}

fn upload_error(err: UploadError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        UploadError::SessionNotFound => StatusCode::NOT_FOUND,
        UploadError::InvalidName | UploadError::ChecksumMismatch { .. } => StatusCode::BAD_REQUEST,
        UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"message": err.to_string()})))
}

// GET /api/v1/models
async fn list_models(
    State(app): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let models = app.uploads.list().map_err(upload_error)?;
    Ok(Json(json!({"success": true, "data": models})))
}

// DELETE /api/v1/models/{name}
async fn delete_model(
    State(app): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    app.uploads.delete(&name).map_err(upload_error)?;
    app.audit.record(
        &user.username,
        "模型管理",
        &format!("删除了模型 {name}"),
        crate::audit::Level::Warn,
    );
    Ok(Json(json!({"success": true})))
}

// POST /api/v1/models/upload/init
async fn upload_init(
    State(app): State<AppState>,
    Json(req): Json<InitRequest>,
) -> Result<Json<crate::uploads::InitResponse>, (StatusCode, Json<Value>)> {
    app.uploads.init(&req).map(Json).map_err(upload_error)
}

// POST /api/v1/models/upload/chunk — multipart: upload_id + chunk.
async fn upload_chunk(
    State(app): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut upload_id = None;
    let mut chunk = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({"message": e.to_string()}))))?
    {
        match field.name() {
            Some("upload_id") => {
                upload_id = Some(field.text().await.map_err(internal)?);
            }
            Some("chunk") => {
                chunk = Some(field.bytes().await.map_err(internal)?);
            }
            _ => {}
        }
    }
    let (upload_id, chunk) = match (upload_id, chunk) {
        (Some(id), Some(c)) => (id, c),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"message": "upload_id and chunk fields are required"})),
            ))
        }
    };
    let offset = app
        .uploads
        .append_chunk(&upload_id, &chunk)
        .map_err(upload_error)?;
    Ok(Json(json!({"success": true, "offset": offset})))
}

// POST /api/v1/models/upload/finalize
async fn upload_finalize(
    State(app): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let model_name = req.model_name.clone();
    let dest = app.uploads.finalize(&req).map_err(upload_error)?;
    app.audit.record(
        &user.username,
        "模型管理",
        &format!("上传了模型 {model_name}"),
        crate::audit::Level::Info,
    );
    Ok(Json(json!({
        "success": true,
        "path": dest.to_string_lossy(),
    })))
}

fn masked(mut user: User) -> User {
    user.password = String::new();
    user
}

// GET /api/v1/users
async fn list_users(State(app): State<AppState>) -> Json<Value> {
    let users: Vec<User> = app
        .store
        .read(|d| d.users.clone())
        .into_iter()
        .map(masked)
        .collect();
    Json(json!({"success": true, "data": users}))
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    username: String,
    #[serde(default)]
    password: String,
    role: String,
}

// POST /api/v1/users
async fn create_user(
    State(app): State<AppState>,
    Extension(operator): Extension<CurrentUser>,
    Json(req): Json<UserRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let exists = app
        .store
        .read(|d| d.users.iter().any(|u| u.username == req.username));
    if exists {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"message": "用户名已存在"})),
        ));
    }
    let password = app
        .ids
        .encrypt_password(&app.ids.resolve_password(&req.password))
        .map_err(internal)?;
    let user = app
        .store
        .write(
            |d| {
                let user = User {
                    id: next_id(d.users.iter().map(|u| u.id)),
                    created_at: now_rfc3339(),
                    username: req.username.clone(),
                    password,
                    role: req.role.clone(),
                };
                d.users.push(user.clone());
                user
            },
            true,
        )
        .map_err(internal)?;
    app.audit.record(
        &operator.username,
        "用户管理",
        &format!("创建了用户 {}", user.username),
        crate::audit::Level::Info,
    );
    Ok(Json(json!({"success": true, "data": masked(user)})))
}

// PUT /api/v1/users/{id}
async fn update_user(
    State(app): State<AppState>,
    Extension(operator): Extension<CurrentUser>,
    Path(id): Path<u64>,
    Json(req): Json<UserRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let password = if req.password.is_empty() {
        None
    } else {
        Some(
            app.ids
                .encrypt_password(&app.ids.resolve_password(&req.password))
                .map_err(internal)?,
        )
    };
    let updated = app
        .store
        .write(
            |d| {
                let user = d.users.iter_mut().find(|u| u.id == id)?;
                user.username = req.username.clone();
                user.role = req.role.clone();
                if let Some(p) = password {
                    user.password = p;
                }
                Some(user.clone())
            },
            true,
        )
        .map_err(internal)?;
    match updated {
        Some(user) => {
            app.audit.record(
                &operator.username,
                "用户管理",
                &format!("更新了用户 {}", user.username),
                crate::audit::Level::Info,
            );
            Ok(Json(json!({"success": true, "data": masked(user)})))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"message": "用户不存在"})),
        )),
    }
}

// DELETE /api/v1/users/{id}
async fn delete_user(
    State(app): State<AppState>,
    Extension(operator): Extension<CurrentUser>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let removed = app
        .store
        .write(
            |d| {
                let before = d.users.len();
                d.users.retain(|u| u.id != id);
                d.users.len() < before
            },
            true,
        )
        .map_err(internal)?;
    if !removed {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"message": "用户不存在"})),
        ));
    }
    app.audit.record(
        &operator.username,
        "用户管理",
        &format!("删除了用户 #{id}"),
        crate::audit::Level::Warn,
    );
    Ok(Json(json!({"success": true})))
}

// GET /api/v1/import-tasks
async fn list_import_tasks(State(app): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "data": app.store.read(|d| d.import_tasks.clone())}))
}

// POST /api/v1/import-tasks
async fn create_import_task(
    State(app): State<AppState>,
    Json(mut task): Json<ImportTask>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = app
        .store
        .write(
            |d| {
                task.id = next_id(d.import_tasks.iter().map(|t| t.id));
                task.created_at = now_rfc3339();
                d.import_tasks.push(task.clone());
                task
            },
            true,
        )
        .map_err(internal)?;
    Ok(Json(json!({"success": true, "data": task})))
}

// GET /api/v1/backups
async fn list_backups(State(app): State<AppState>) -> Json<Value> {
    Json(json!({"success": true, "data": app.store.read(|d| d.backup_records.clone())}))
}

// POST /api/v1/backups
async fn create_backup(
    State(app): State<AppState>,
    Json(mut record): Json<BackupRecord>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let record = app
        .store
        .write(
            |d| {
                record.id = next_id(d.backup_records.iter().map(|r| r.id));
                record.created_at = now_rfc3339();
                d.backup_records.push(record.clone());
                record
            },
            true,
        )
        .map_err(internal)?;
    Ok(Json(json!({"success": true, "data": record})))
}
