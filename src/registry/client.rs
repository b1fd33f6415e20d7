//! Client side of the registry channel.
//!
//! Each call issues a fresh token, opens its own connection (no pooling),
//! applies a fixed deadline, and converts the wire response back into
//! [`Device`] values. Non-2xx responses are mapped back onto
//! [`RegistryError`] using the `code` field of the JSON error body.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::routes::{FETCH_PATH, INIT_PATH, LIST_PATH, REFRESH_PATH, STATUS_PATH};
use crate::auth::{AuthGate, TOKEN_HEADER};
use crate::error::{AuthError, RegistryError};
use crate::model::{Device, DeviceMsg, DevicesMsg, FetchResponse, FileRef, Void};

/// Deadline applied to every registry call.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry caller. Cheap to clone.
#[derive(Clone, Debug)]
pub struct RegistryClient {
    gate: AuthGate,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(gate: AuthGate) -> Self {
        Self::with_timeout(gate, CALL_TIMEOUT)
    }

    pub(crate) fn with_timeout(gate: AuthGate, timeout: Duration) -> Self {
        Self { gate, timeout }
    }

    /// Join the master at `addr` (`host:port`). Returns the master's directory.
    pub async fn init(&self, addr: &str, device: &Device) -> Result<Vec<Device>, RegistryError> {
        let resp: DevicesMsg = self.call(addr, INIT_PATH, &DeviceMsg::from(device)).await?;
        Ok(resp.into())
    }

    /// Push `device`'s files and active flag to the master at `addr`.
    pub async fn refresh(&self, addr: &str, device: &Device) -> Result<Device, RegistryError> {
        let resp: DeviceMsg = self
            .call(addr, REFRESH_PATH, &DeviceMsg::from(device))
            .await?;
        Ok(resp.into())
    }

    pub async fn list(&self, addr: &str) -> Result<Vec<Device>, RegistryError> {
        let resp: DevicesMsg = self.call(addr, LIST_PATH, &Void {}).await?;
        Ok(resp.into())
    }

    /// The node at `addr` describes itself.
    pub async fn status(&self, addr: &str) -> Result<Device, RegistryError> {
        let resp: DeviceMsg = self.call(addr, STATUS_PATH, &Void {}).await?;
        Ok(resp.into())
    }

    /// Ask the node at `addr` whether it offers `hash`.
    pub async fn fetch(&self, addr: &str, hash: &str) -> Result<FetchResponse, RegistryError> {
        self.call(
            addr,
            FETCH_PATH,
            &FileRef {
                hash: hash.to_string(),
            },
        )
        .await
    }

    async fn call<B, R>(&self, addr: &str, path: &str, body: &B) -> Result<R, RegistryError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let token = self.gate.issue_token()?;
        // One connection per call.
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        let url = format!("http://{addr}{path}");
        debug!(%url, "registry call");
        let resp = http
            .post(&url)
            .header(TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<R>().await?);
        }

        let text = resp.text().await.unwrap_or_default();
        Err(decode_error(status, text))
    }
}

/// Map a non-2xx response back onto [`RegistryError`] by its `code` field.
fn decode_error(status: StatusCode, text: String) -> RegistryError {
    let parsed: Option<Value> = serde_json::from_str(&text).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v["code"].as_str())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|v| v["error"].as_str())
        .map_or(text, ToString::to_string);

    match code {
        "UNAUTHENTICATED" => RegistryError::Auth(AuthError::Unauthenticated),
        "PERMISSION_DENIED" => RegistryError::Auth(AuthError::PermissionDenied),
        "NOT_MASTER" => RegistryError::NotMaster,
        "NOT_FOUND" => RegistryError::NotFound(
            parsed
                .as_ref()
                .and_then(|v| v["identity"].as_str())
                .map_or(message, ToString::to_string),
        ),
        _ => RegistryError::Remote {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use tokio::sync::RwLock;

    use crate::auth::StaticKeyProvider;
    use crate::registry::{routes, Registry, Role};

    fn gate() -> AuthGate {
        AuthGate::new(&StaticKeyProvider(b"client-secret".to_vec())).unwrap()
    }

    async fn serve_registry() -> String {
        let local = Arc::new(RwLock::new(Device::new("m", "m", "127.0.0.1", 0, 0)));
        let registry = Arc::new(Registry::new(Role::Master, local).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, routes::router(registry, gate()))
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_refused_dial_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RegistryClient::new(gate()).list(&addr).await.unwrap_err();
        assert!(matches!(err, RegistryError::Connection(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_silent_server_hits_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let client = RegistryClient::with_timeout(gate(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = client.status(&addr).await.unwrap_err();
        assert!(matches!(err, RegistryError::Connection(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_token_decodes_as_unauthenticated() {
        let addr = serve_registry().await;
        let resp = reqwest::Client::new()
            .post(format!("http://{addr}{LIST_PATH}"))
            .json(&Void {})
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let err = decode_error(status, resp.text().await.unwrap());
        assert!(
            matches!(err, RegistryError::Auth(AuthError::Unauthenticated)),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn test_list_round_trip() {
        let addr = serve_registry().await;
        let devices = RegistryClient::new(gate()).list(&addr).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].identity_hash, "m");
    }

    #[test]
    fn test_unknown_body_is_remote() {
        let err = decode_error(StatusCode::BAD_GATEWAY, "upstream down".to_string());
        assert!(matches!(
            err,
            RegistryError::Remote { status: 502, ref message } if message == "upstream down"
        ));
    }
}
