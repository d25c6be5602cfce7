//! HTTP surface: a thin axum layer over the catalog and the provisioning
//! coordinator.
//!
//! Requests authenticate with an `X-API-Key` header; the key is hashed and
//! looked up in the catalog, binding a user to the request. Handlers do as
//! little as possible — validation and orchestration live in the
//! coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth;
use crate::catalog::{Catalog, User, VmRecord};
use crate::config::{self, Config};
use crate::error::ForgeError;
use crate::hypervisor::{DomainState, Hypervisor};
use crate::provision::{CreateParams, Provisioner};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub hypervisor: Arc<Hypervisor>,
    pub provisioner: Provisioner,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/images", get(list_images))
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/{id}", get(get_vm).delete(delete_vm))
        .with_state(state)
}

// ── errors ──────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        let status = match &err {
            ForgeError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ForgeError::Validation { .. } | ForgeError::DuplicateKey { .. } => {
                StatusCode::BAD_REQUEST
            }
            ForgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::from(ForgeError::Unauthorized {
            message: "missing X-API-Key header".into(),
        }))?;

    state
        .catalog
        .find_user_by_api_key_hash(&auth::hash_api_key(key))?
        .ok_or_else(|| {
            ApiError::from(ForgeError::Unauthorized {
                message: "invalid API key".into(),
            })
        })
}

// ── DTOs ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub ssh_key: String,
    #[serde(default = "default_image_type")]
    pub image_type: String,
    pub memory_mb: Option<u32>,
    pub vcpus: Option<u32>,
}

fn default_image_type() -> String {
    "debian-12".to_string()
}

#[derive(Debug, Serialize)]
pub struct SshConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub command: String,
}

#[derive(Debug, Serialize)]
pub struct VmSpecs {
    pub memory_mb: u32,
    pub vcpus: u32,
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct VmResponse {
    pub id: String,
    pub name: String,
    pub status: String,
    pub ssh_connection: SshConnection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specs: Option<VmSpecs>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct VmSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub port: u16,
    pub created_at: String,
}

fn vm_response(
    config: &Config,
    vm: &VmRecord,
    status: &str,
    specs: Option<VmSpecs>,
) -> VmResponse {
    let username = config::lookup_image(&vm.image_type)
        .map(|img| img.username)
        .unwrap_or("root")
        .to_string();
    let host = config.server_public_ip.clone();
    VmResponse {
        id: vm.id.clone(),
        name: vm.name.clone(),
        status: status.to_string(),
        ssh_connection: SshConnection {
            command: format!("ssh -p {} {username}@{host}", vm.host_port),
            host,
            port: vm.host_port,
            username,
        },
        specs,
        created_at: vm.created_at.clone(),
    }
}

/// Live domain state for a record, degrading to "unknown" when the
/// hypervisor cannot answer (e.g. the domain vanished out-of-band).
fn live_status(hypervisor: &Hypervisor, vm_id: &str) -> String {
    hypervisor
        .state(vm_id)
        .map(DomainState::as_str)
        .unwrap_or("unknown")
        .to_string()
}

// ── handlers ────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct ImageInfo {
    name: &'static str,
    username: &'static str,
}

async fn list_images() -> Json<BTreeMap<&'static str, ImageInfo>> {
    let images = config::IMAGES
        .iter()
        .map(|img| {
            (
                img.tag,
                ImageInfo {
                    name: img.name,
                    username: img.username,
                },
            )
        })
        .collect();
    Json(images)
}

#[derive(Debug, Deserialize)]
struct SignupRequest {
    name: String,
    password: String,
}

async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.name.is_empty() || req.password.is_empty() {
        return Err(ForgeError::Validation {
            message: "name and password must not be empty".into(),
        }
        .into());
    }

    // The plaintext key is returned exactly once; only its hash is stored.
    let api_key = auth::generate_api_key();
    let user = state.catalog.add_user(
        &req.name,
        &auth::hash_password(&req.password),
        &auth::hash_api_key(&api_key),
    )?;

    Ok(Json(json!({
        "message": "User created successfully",
        "api_key": api_key,
        "user_id": user.id,
    })))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    name: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invalid = || {
        ApiError::from(ForgeError::Unauthorized {
            message: "invalid username or password".into(),
        })
    };

    let user = state
        .catalog
        .find_user_by_name(&req.name)?
        .ok_or_else(invalid)?;
    if !auth::verify_password(&req.password, &user.hashed_password) {
        return Err(invalid());
    }

    // Only the key hash survives signup, so login rotates: issue a fresh
    // key and store its hash.
    let api_key = auth::generate_api_key();
    state
        .catalog
        .rotate_api_key(&user.id, &auth::hash_api_key(&api_key))?;

    Ok(Json(json!({
        "message": "Login successful",
        "api_key": api_key,
        "user_id": user.id,
        "name": user.name,
    })))
}

async fn create_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateVmRequest>,
) -> Result<Json<VmResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;

    let memory_mb = req.memory_mb.unwrap_or(state.config.default_memory_mb);
    let vcpus = req.vcpus.unwrap_or(state.config.default_vcpus);
    let params = CreateParams {
        name: req.name,
        ssh_key: req.ssh_key,
        image_type: req.image_type,
        memory_mb,
        vcpus,
    };

    let record = state.provisioner.create(&user.id, params).await?;

    let specs = VmSpecs {
        memory_mb: state.config.clamp_memory(memory_mb),
        vcpus: state.config.clamp_vcpus(vcpus),
        image: config::lookup_image(&record.image_type)
            .map(|img| img.name.to_string())
            .unwrap_or_else(|| record.image_type.clone()),
    };
    Ok(Json(vm_response(
        &state.config,
        &record,
        record.status.as_str(),
        Some(specs),
    )))
}

async fn list_vms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let records = state.catalog.list_vms(&user.id)?;

    // Overlay live hypervisor state onto the stored records off the async
    // worker; one blocking hop covers the whole list.
    let summaries = {
        let hypervisor = Arc::clone(&state.hypervisor);
        tokio::task::spawn_blocking(move || {
            records
                .into_iter()
                .map(|vm| VmSummary {
                    status: live_status(&hypervisor, &vm.id),
                    id: vm.id,
                    name: vm.name,
                    ip: vm.ip,
                    port: vm.host_port,
                    created_at: vm.created_at,
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| {
            ApiError::from(ForgeError::Internal {
                message: format!("state query task failed: {e}"),
            })
        })?
    };

    Ok(Json(json!({ "vms": summaries })))
}

async fn get_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Result<Json<VmResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let vm = state
        .catalog
        .get_vm(&vm_id, &user.id)?
        .ok_or_else(|| {
            ApiError::from(ForgeError::NotFound {
                what: format!("VM {vm_id}"),
            })
        })?;

    let status = {
        let hypervisor = Arc::clone(&state.hypervisor);
        let id = vm.id.clone();
        tokio::task::spawn_blocking(move || live_status(&hypervisor, &id))
            .await
            .map_err(|e| {
                ApiError::from(ForgeError::Internal {
                    message: format!("state query task failed: {e}"),
                })
            })?
    };

    Ok(Json(vm_response(&state.config, &vm, &status, None)))
}

async fn delete_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(vm_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authenticate(&state, &headers)?;
    state.provisioner.delete(&user.id, &vm_id).await?;
    Ok(Json(json!({ "deleted": true, "id": vm_id })))
}
