//! The authenticated request gateway.
//!
//! Every outbound call goes through [`Gateway::send`]. The gateway injects the
//! current bearer token, unwraps the `{code, msg, data}` envelope and recovers
//! from an expired access token with a single-flight refresh: one caller runs
//! the refresh while every other caller that fails in the meantime waits in
//! the [`RefreshCoordinator`] queue and is replayed with the new token.

mod error;
pub mod refresh;
pub mod transport;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub use error::GatewayError;
pub use refresh::{RefreshCoordinator, RefreshState};
pub use transport::{
    ApiRequest, PendingRequest, RawResponse, ReqwestTransport, Transport, TransportConfig,
};

use crate::session::{Credentials, TokenStore};
use refresh::{Admission, Resumption};

pub const DEFAULT_SUCCESS_CODE: i64 = 200;
pub const DEFAULT_AUTH_EXPIRED_CODE: i64 = 401;
pub const DEFAULT_REFRESH_PATH: &str = "/users/refresh-token";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub success_code: i64,
    pub auth_expired_code: i64,
    pub refresh_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            success_code: DEFAULT_SUCCESS_CODE,
            auth_expired_code: DEFAULT_AUTH_EXPIRED_CODE,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

/// Token pair as the backend spells it.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
pub struct AuthTokens {
    #[serde(rename = "access-token")]
    pub access_token: String,
    #[serde(rename = "refresh-token")]
    pub refresh_token: String,
}

impl AuthTokens {
    pub fn into_credentials(self) -> Result<Credentials, GatewayError> {
        Credentials::new(self.access_token, self.refresh_token)
            .map_err(|err| GatewayError::Decode(err.to_string()))
    }
}

pub struct Gateway {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    refresh: RefreshCoordinator,
    cfg: GatewayConfig,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenStore>, cfg: GatewayConfig) -> Self {
        Self {
            transport,
            tokens,
            refresh: RefreshCoordinator::new(),
            cfg,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.refresh.state()
    }

    /// Sends `request` and returns the envelope payload.
    pub async fn send(&self, request: ApiRequest) -> Result<Value, GatewayError> {
        if request.public {
            return self.dispatch(&request, None).await;
        }

        let used = self.tokens.access_token();
        match self.dispatch(&request, used.as_deref()).await {
            Err(GatewayError::AuthExpired) => self.recover(request, used).await,
            other => other,
        }
    }

    /// Sends `request` and decodes the payload into `T`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, GatewayError> {
        let data = self.send(request).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn dispatch(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<Value, GatewayError> {
        debug!(method = %request.method, path = %request.path, "gateway: dispatch");
        let response = self.transport.execute(request, bearer).await?;
        self.unwrap_envelope(request, response)
    }

    fn unwrap_envelope(&self, request: &ApiRequest, response: RawResponse) -> Result<Value, GatewayError> {
        let status = response.status;
        let envelope = match serde_json::from_str::<Envelope>(&response.body) {
            Ok(envelope) => Some(envelope),
            Err(err) if (200..300).contains(&status) => {
                return Err(GatewayError::Decode(format!("response envelope: {}", err)));
            }
            Err(_) => None,
        };

        let auth_failure = status == 401
            || envelope
                .as_ref()
                .is_some_and(|env| env.code == self.cfg.auth_expired_code);
        if auth_failure && !request.public {
            return Err(GatewayError::AuthExpired);
        }

        match envelope {
            Some(env) if env.code == self.cfg.success_code && (200..300).contains(&status) => {
                Ok(env.data)
            }
            Some(env) => Err(GatewayError::Business {
                code: env.code,
                message: if env.msg.is_empty() {
                    "Error".to_string()
                } else {
                    env.msg
                },
            }),
            None => Err(GatewayError::Business {
                code: i64::from(status),
                message: if response.body.trim().is_empty() {
                    format!("HTTP {}", status)
                } else {
                    response.body
                },
            }),
        }
    }

    async fn recover(&self, request: ApiRequest, used: Option<String>) -> Result<Value, GatewayError> {
        warn!(path = %request.path, "gateway: authorization expired");

        // Someone else already rotated the token while this call was in flight.
        if let Some(current) = self.tokens.access_token() {
            if used.as_deref() != Some(current.as_str()) {
                debug!(path = %request.path, "gateway: replaying with newer token");
                return self.replay(&request, &current).await;
            }
        }

        match self.refresh.admit(request) {
            Admission::Leader(ticket, request) => match self.refresh_credentials().await {
                Ok(token) => {
                    let resumed = ticket.settle(Ok(token.clone()));
                    info!(resumed, "gateway: credentials refreshed");
                    self.replay(&request, &token).await
                }
                Err(err) => {
                    self.tokens.clear();
                    let failed = ticket.settle(Err(err.clone()));
                    error!(error = %err, failed, "gateway: refresh failed, session ended");
                    Err(err)
                }
            },
            Admission::Queued(rx) => {
                let Resumption { request, outcome } = rx.await.map_err(|_| {
                    GatewayError::refresh_failed(GatewayError::Network(
                        "refresh abandoned".into(),
                    ))
                })?;
                let token = outcome?;
                self.replay(&request, &token).await
            }
        }
    }

    /// Reissues a parked request. A second authorization failure goes back to
    /// the caller rather than starting another refresh.
    async fn replay(&self, request: &ApiRequest, token: &str) -> Result<Value, GatewayError> {
        self.dispatch(request, Some(token)).await
    }

    async fn refresh_credentials(&self) -> Result<String, GatewayError> {
        let refresh_token = self
            .tokens
            .refresh_token()
            .ok_or_else(|| GatewayError::refresh_failed(GatewayError::AuthExpired))?;

        let request = ApiRequest::post(self.cfg.refresh_path.clone())
            .json(&serde_json::json!({ "refresh-token": refresh_token }))?
            .public();
        let data = self
            .dispatch(&request, None)
            .await
            .map_err(GatewayError::refresh_failed)?;
        let tokens: AuthTokens = serde_json::from_value(data)
            .map_err(|err| GatewayError::refresh_failed(err.into()))?;
        let credentials = tokens
            .into_credentials()
            .map_err(GatewayError::refresh_failed)?;
        let access = credentials.access_token().to_string();
        self.tokens
            .replace(credentials)
            .map_err(|err| GatewayError::refresh_failed(GatewayError::Decode(err.to_string())))?;
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::Notify;

    type Handler = dyn Fn(&ApiRequest, Option<&str>) -> Result<RawResponse, GatewayError> + Send + Sync;

    /// Answers from a closure and holds refresh calls until `release` fires.
    struct ScriptedTransport {
        handler: Box<Handler>,
        gate_refresh: bool,
        release: Notify,
        log: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedTransport {
        fn new(gate_refresh: bool, handler: Box<Handler>) -> Arc<Self> {
            Arc::new(Self {
                handler,
                gate_refresh,
                release: Notify::new(),
                log: Mutex::new(Vec::new()),
            })
        }

        fn calls_to(&self, path: &str) -> usize {
            self.log.lock().iter().filter(|(p, _)| p == path).count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(
            &self,
            request: &ApiRequest,
            bearer: Option<&str>,
        ) -> Result<RawResponse, GatewayError> {
            self.log
                .lock()
                .push((request.path.clone(), bearer.map(str::to_string)));
            if self.gate_refresh && request.path == DEFAULT_REFRESH_PATH {
                self.release.notified().await;
            }
            (self.handler)(request, bearer)
        }
    }

    fn ok(data: Value) -> Result<RawResponse, GatewayError> {
        Ok(RawResponse::new(200, json!({"code": 200, "msg": "ok", "data": data}).to_string()))
    }

    fn expired() -> Result<RawResponse, GatewayError> {
        Ok(RawResponse::new(200, json!({"code": 401, "msg": "token expired"}).to_string()))
    }

    fn logged_in() -> Arc<TokenStore> {
        Arc::new(TokenStore::with_credentials(
            Credentials::new("stale", "refresh-1").unwrap(),
        ))
    }

    fn rotating_backend(refresh_ok: bool) -> Box<Handler> {
        Box::new(move |req: &ApiRequest, bearer: Option<&str>| match req.path.as_str() {
            DEFAULT_REFRESH_PATH => {
                if refresh_ok {
                    ok(json!({"access-token": "fresh", "refresh-token": "refresh-2"}))
                } else {
                    Ok(RawResponse::new(200, json!({"code": 403, "msg": "refresh token revoked"}).to_string()))
                }
            }
            path => match bearer {
                Some("fresh") => ok(json!({ "path": path })),
                _ => expired(),
            },
        })
    }

    #[tokio::test]
    async fn unwraps_success_payload_with_bearer() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, bearer: Option<&str>| {
            assert_eq!(bearer, Some("stale"));
            ok(json!({"id": 7}))
        }));
        let gateway = Gateway::new(transport, logged_in(), GatewayConfig::default());
        let data = gateway.send(ApiRequest::get("/confessions/7")).await.unwrap();
        assert_eq!(data["id"], 7);
    }

    #[tokio::test]
    async fn business_error_carries_server_message() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, _: Option<&str>| {
            Ok(RawResponse::new(200, json!({"code": 400, "msg": "title too long"}).to_string()))
        }));
        let gateway = Gateway::new(transport.clone(), logged_in(), GatewayConfig::default());
        let err = gateway.send(ApiRequest::post("/confessions")).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Business {
                code: 400,
                message: "title too long".into()
            }
        );
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn network_error_is_not_retried() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, _: Option<&str>| {
            Err(GatewayError::Network("connection refused".into()))
        }));
        let gateway = Gateway::new(transport.clone(), logged_in(), GatewayConfig::default());
        let err = gateway.send(ApiRequest::get("/confessions")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert_eq!(transport.log.lock().len(), 1);
    }

    #[tokio::test]
    async fn http_401_triggers_refresh_and_replay() {
        let transport = ScriptedTransport::new(false, Box::new(|req: &ApiRequest, bearer: Option<&str>| {
            match (req.path.as_str(), bearer) {
                (DEFAULT_REFRESH_PATH, None) => {
                    assert_eq!(req.body.as_ref().unwrap()["refresh-token"], "refresh-1");
                    ok(json!({"access-token": "fresh", "refresh-token": "refresh-2"}))
                }
                (_, Some("fresh")) => ok(json!("done")),
                _ => Ok(RawResponse::new(401, "")),
            }
        }));
        let tokens = logged_in();
        let gateway = Gateway::new(transport.clone(), tokens.clone(), GatewayConfig::default());

        let data = gateway.send(ApiRequest::get("/users/me")).await.unwrap();
        assert_eq!(data, json!("done"));
        assert_eq!(tokens.refresh_token().as_deref(), Some("refresh-2"));
        assert_eq!(gateway.refresh_state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn concurrent_failures_share_one_refresh() {
        let transport = ScriptedTransport::new(true, rotating_backend(true));
        let gateway = Gateway::new(transport.clone(), logged_in(), GatewayConfig::default());

        let release = async {
            tokio::task::yield_now().await;
            assert_eq!(gateway.refresh_state(), RefreshState::Refreshing);
            transport.release.notify_one();
        };
        let (a, b, c, d, ()) = tokio::join!(
            gateway.send(ApiRequest::get("/a")),
            gateway.send(ApiRequest::get("/b")),
            gateway.send(ApiRequest::get("/c")),
            gateway.send(ApiRequest::get("/d")),
            release,
        );

        for (result, path) in [(a, "/a"), (b, "/b"), (c, "/c"), (d, "/d")] {
            assert_eq!(result.unwrap()["path"], path);
        }
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 1);
        assert_eq!(gateway.refresh_state(), RefreshState::Idle);

        // Every request went out exactly twice: once stale, once replayed.
        let mut replays: Vec<String> = transport
            .log
            .lock()
            .iter()
            .filter(|(_, bearer)| bearer.as_deref() == Some("fresh"))
            .map(|(path, _)| path.clone())
            .collect();
        replays.sort();
        assert_eq!(replays, vec!["/a", "/b", "/c", "/d"]);
    }

    #[tokio::test]
    async fn refresh_failure_fails_everyone_and_logs_out() {
        let transport = ScriptedTransport::new(true, rotating_backend(false));
        let tokens = logged_in();
        let gateway = Gateway::new(transport.clone(), tokens.clone(), GatewayConfig::default());

        let release = async {
            tokio::task::yield_now().await;
            transport.release.notify_one();
        };
        let (a, b, c, ()) = tokio::join!(
            gateway.send(ApiRequest::get("/a")),
            gateway.send(ApiRequest::get("/b")),
            gateway.send(ApiRequest::get("/c")),
            release,
        );

        for result in [a, b, c] {
            let err = result.unwrap_err();
            assert!(err.is_session_lost(), "unexpected error: {err:?}");
        }
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 1);
        assert!(!tokens.is_logged_in());
        assert_eq!(gateway.refresh_state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn missing_refresh_token_ends_session_without_network_call() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, _: Option<&str>| expired()));
        let gateway = Gateway::new(
            transport.clone(),
            Arc::new(TokenStore::in_memory()),
            GatewayConfig::default(),
        );
        let err = gateway.send(ApiRequest::get("/users/me")).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::RefreshFailed(Box::new(GatewayError::AuthExpired))
        );
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn replay_rejected_again_is_returned_not_refreshed_twice() {
        let transport = ScriptedTransport::new(false, Box::new(|req: &ApiRequest, _: Option<&str>| {
            if req.path == DEFAULT_REFRESH_PATH {
                ok(json!({"access-token": "fresh", "refresh-token": "refresh-2"}))
            } else {
                expired()
            }
        }));
        let gateway = Gateway::new(transport.clone(), logged_in(), GatewayConfig::default());
        let err = gateway.send(ApiRequest::get("/users/me")).await.unwrap_err();
        assert_eq!(err, GatewayError::AuthExpired);
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 1);
    }

    #[tokio::test]
    async fn stale_failure_after_rotation_replays_without_refresh() {
        let transport = ScriptedTransport::new(false, rotating_backend(true));
        let tokens = logged_in();
        let gateway = Gateway::new(transport.clone(), tokens.clone(), GatewayConfig::default());

        // Simulates a refresh that completed while this call was in flight.
        tokens
            .replace(Credentials::new("fresh", "refresh-2").unwrap())
            .unwrap();
        let data = gateway
            .recover(ApiRequest::get("/late"), Some("stale".into()))
            .await
            .unwrap();
        assert_eq!(data["path"], "/late");
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn public_requests_skip_credentials_and_refresh() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, bearer: Option<&str>| {
            assert!(bearer.is_none());
            Ok(RawResponse::new(401, json!({"code": 401, "msg": "bad password"}).to_string()))
        }));
        let gateway = Gateway::new(transport.clone(), logged_in(), GatewayConfig::default());
        let err = gateway
            .send(ApiRequest::post("/users/login").public())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Business {
                code: 401,
                message: "bad password".into()
            }
        );
        assert_eq!(transport.calls_to(DEFAULT_REFRESH_PATH), 0);
    }

    #[tokio::test]
    async fn non_envelope_error_bodies_become_business_errors() {
        let transport = ScriptedTransport::new(false, Box::new(|_: &ApiRequest, _: Option<&str>| {
            Ok(RawResponse::new(502, "upstream down"))
        }));
        let gateway = Gateway::new(transport, logged_in(), GatewayConfig::default());
        let err = gateway.send(ApiRequest::get("/confessions")).await.unwrap_err();
        assert_eq!(
            err,
            GatewayError::Business {
                code: 502,
                message: "upstream down".into()
            }
        );
    }
}
