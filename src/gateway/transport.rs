use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client as HttpClient, Method};
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::GatewayError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A replayable description of one API call.
///
/// Requests are plain data so the gateway can park a rejected call and issue
/// it again after the credentials were refreshed.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Sent without credentials and never routed through the refresh flow.
    pub public: bool,
}

/// A call parked while a refresh is in flight.
pub type PendingRequest = ApiRequest;

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            public: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, GatewayError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }
}

/// What came back over the wire, before envelope handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Moves one request over the network.
///
/// Implementations must report "no response at all" as
/// [`GatewayError::Network`] and hand every response back untouched,
/// whatever its status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<RawResponse, GatewayError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub http_client: Option<HttpClient>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: format!("confession-board/{}", crate::VERSION),
            timeout: DEFAULT_TIMEOUT,
            http_client: None,
        }
    }
}

pub struct ReqwestTransport {
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, GatewayError> {
        if config.user_agent.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "transport user agent required".into(),
            ));
        }
        let base_url = parse_base_url(&config.base_url)?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder().timeout(config.timeout).build()?,
        };

        Ok(Self {
            http,
            user_agent: config.user_agent,
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, GatewayError> {
        let mut url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|err| {
                GatewayError::InvalidRequest(format!("bad path {:?}: {}", request.path, err))
            })?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &request.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<RawResponse, GatewayError> {
        let url = self.url_for(request)?;
        let mut req = self
            .http
            .request(request.method.clone(), url)
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(token) = bearer {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }
}

// `Url::join` drops the last segment of a base without a trailing slash.
fn parse_base_url(raw: &str) -> Result<Url, GatewayError> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&normalized)
        .map_err(|err| GatewayError::InvalidRequest(format!("bad base url {:?}: {}", raw, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(base: &str) -> ReqwestTransport {
        ReqwestTransport::new(TransportConfig {
            base_url: base.to_string(),
            ..TransportConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn joins_paths_under_base_prefix() {
        let t = transport("http://localhost:8080/api");
        let req = ApiRequest::get("/confessions/hot").query("page", 1).query("size", 5);
        let url = t.url_for(&req).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/confessions/hot?page=1&size=5"
        );
    }

    #[test]
    fn rejects_empty_user_agent() {
        let err = ReqwestTransport::new(TransportConfig {
            user_agent: "  ".into(),
            ..TransportConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn builder_captures_body_and_flags() {
        let req = ApiRequest::post("/users/login")
            .json(&serde_json::json!({"username": "amy"}))
            .unwrap()
            .public();
        assert!(req.public);
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body.unwrap()["username"], "amy");
    }
}
