//! HTTP surface of the registry.
//!
//! | Method | Path           | Auth  | Body → Response          |
//! |--------|----------------|-------|--------------------------|
//! | GET    | `/health`      | No    | → liveness JSON          |
//! | POST   | `/rpc/init`    | `jwt` | `Device` → `Devices`     |
//! | POST   | `/rpc/refresh` | `jwt` | `Device` → `Device`      |
//! | POST   | `/rpc/list`    | `jwt` | `{}` → `Devices`         |
//! | POST   | `/rpc/status`  | `jwt` | `{}` → `Device`          |
//! | POST   | `/rpc/fetch`   | `jwt` | `FileRef` → `FetchResponse` |

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::Registry;
use crate::auth::{self, AuthGate};
use crate::error::{AuthError, RegistryError};
use crate::model::{Device, DeviceMsg, DevicesMsg, FetchResponse, FileRef, Void};

pub const INIT_PATH: &str = "/rpc/init";
pub const REFRESH_PATH: &str = "/rpc/refresh";
pub const LIST_PATH: &str = "/rpc/list";
pub const STATUS_PATH: &str = "/rpc/status";
pub const FETCH_PATH: &str = "/rpc/fetch";

/// Build the registry router. All `/rpc/*` routes sit behind
/// [`auth::require_token`].
pub fn router(registry: Arc<Registry>, gate: AuthGate) -> Router {
    let rpc = Router::new()
        .route(INIT_PATH, post(init))
        .route(REFRESH_PATH, post(refresh))
        .route(LIST_PATH, post(list))
        .route(STATUS_PATH, post(status))
        .route(FETCH_PATH, post(fetch))
        .layer(middleware::from_fn(auth::require_token));

    Router::new()
        .route("/health", get(health))
        .merge(rpc)
        .layer(Extension(gate))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            RegistryError::Auth(AuthError::Unauthenticated) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED")
            }
            RegistryError::Auth(AuthError::PermissionDenied) => {
                (StatusCode::FORBIDDEN, "PERMISSION_DENIED")
            }
            RegistryError::NotMaster => (StatusCode::CONFLICT, "NOT_MASTER"),
            RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        let mut body = json!({"error": self.to_string(), "code": code});
        if let RegistryError::NotFound(identity) = &self {
            body["identity"] = json!(identity);
        }
        (status, Json(body)).into_response()
    }
}

async fn health(State(registry): State<Arc<Registry>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "role": registry.role().as_str(),
        "devices": registry.list().await.len(),
    }))
}

async fn init(
    State(registry): State<Arc<Registry>>,
    Json(device): Json<DeviceMsg>,
) -> Result<Json<DevicesMsg>, RegistryError> {
    let snapshot = registry.init(Device::from(device)).await?;
    Ok(Json(DevicesMsg::from(snapshot.as_slice())))
}

async fn refresh(
    State(registry): State<Arc<Registry>>,
    Json(device): Json<DeviceMsg>,
) -> Result<Json<DeviceMsg>, RegistryError> {
    let updated = registry.refresh(Device::from(device)).await?;
    Ok(Json(DeviceMsg::from(&updated)))
}

async fn list(State(registry): State<Arc<Registry>>, Json(_): Json<Void>) -> Json<DevicesMsg> {
    Json(DevicesMsg::from(registry.list().await.as_slice()))
}

async fn status(State(registry): State<Arc<Registry>>, Json(_): Json<Void>) -> Json<DeviceMsg> {
    Json(DeviceMsg::from(&registry.status().await))
}

async fn fetch(
    State(registry): State<Arc<Registry>>,
    Json(file): Json<FileRef>,
) -> Json<FetchResponse> {
    Json(registry.fetch(&file.hash).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticKeyProvider, TOKEN_HEADER};
    use crate::registry::Role;
    use axum::body::Body;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn gate() -> AuthGate {
        AuthGate::new(&StaticKeyProvider(b"routes-secret".to_vec())).unwrap()
    }

    async fn app(role: Role) -> (Router, AuthGate) {
        let local = Arc::new(RwLock::new(Device::new("self", "self", "10.0.0.1", 1, 2)));
        let registry = Arc::new(Registry::new(role, local).await);
        let g = gate();
        (router(registry, g.clone()), g)
    }

    async fn post_json(router: Router, path: &str, token: &str, body: &Value) -> (StatusCode, Value) {
        let req = axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .header(TOKEN_HEADER, token)
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn joiner() -> Value {
        json!({
            "identityHash": "p1", "name": "peer", "ip": "10.0.0.2",
            "rpcPort": 9090, "transferPort": 9091, "active": true,
            "files": [{"name": "a", "hash": "h", "ext": "", "mimeType": "", "size": 1}]
        })
    }

    #[tokio::test]
    async fn test_init_over_http() {
        let (router, g) = app(Role::Master).await;
        let (status, body) = post_json(router, INIT_PATH, &g.issue_token().unwrap(), &joiner()).await;
        assert_eq!(status, StatusCode::OK);
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1]["identityHash"], "p1");
    }

    #[tokio::test]
    async fn test_init_on_peer_maps_to_conflict() {
        let (router, g) = app(Role::Peer).await;
        let (status, body) = post_json(router, INIT_PATH, &g.issue_token().unwrap(), &joiner()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NOT_MASTER");
    }

    #[tokio::test]
    async fn test_refresh_unknown_maps_to_not_found() {
        let (router, g) = app(Role::Master).await;
        let (status, body) =
            post_json(router, REFRESH_PATH, &g.issue_token().unwrap(), &joiner()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rpc_requires_token() {
        let (router, _) = app(Role::Master).await;
        let (status, body) = post_json(router, LIST_PATH, "", &json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "token empty");
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (router, _) = app(Role::Master).await;
        let req = axum::http::Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
