use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The authorization query derived from a matched rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub token: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Token introspection result (RFC 7662 subset).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub ext: Map<String, Value>,
}

/// Authorization decision as returned by the policy service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub allowed: bool,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub ext: Map<String, Value>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("Policy service is not configured: {0}")]
    #[diagnostic(code(portcullis::policy::not_configured))]
    NotConfigured(&'static str),

    #[error("Policy service unreachable: {0}")]
    #[diagnostic(code(portcullis::policy::transport))]
    Transport(String),

    #[error("Policy service answered with status {0}")]
    #[diagnostic(code(portcullis::policy::status))]
    Status(u16),

    #[error("Policy service response could not be decoded: {0}")]
    #[diagnostic(code(portcullis::policy::decode))]
    Decode(String),
}

/// The external introspection and authorization service.
#[async_trait]
pub trait PolicyClient: Send + Sync {
    /// Is `token` active, and as whom.
    async fn introspect(&self, token: &str) -> Result<Introspection, PolicyError>;

    /// May the token holder perform the request.
    async fn authorize(&self, request: &AccessRequest) -> Result<Authorization, PolicyError>;
}

/// Talks to the policy service over HTTP: form-encoded introspection
/// (RFC 7662) and a JSON authorization endpoint.
#[derive(Debug, Clone)]
pub struct HttpPolicyClient {
    client: reqwest::Client,
    introspection_url: Option<String>,
    authorization_url: Option<String>,
    service_token: Option<String>,
}

impl HttpPolicyClient {
    pub fn new(
        introspection_url: Option<String>,
        authorization_url: Option<String>,
        service_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            introspection_url,
            authorization_url,
            service_token,
        })
    }

    pub fn from_settings(cfg: &crate::settings::Policy) -> Result<Self, reqwest::Error> {
        Self::new(
            cfg.introspection_url.clone(),
            cfg.authorization_url.clone(),
            cfg.service_token.clone(),
            cfg.timeout(),
        )
    }

    fn authenticated(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

async fn decode<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T, PolicyError> {
    if res.status() != StatusCode::OK {
        return Err(PolicyError::Status(res.status().as_u16()));
    }
    res.json::<T>()
        .await
        .map_err(|e| PolicyError::Decode(e.to_string()))
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn introspect(&self, token: &str) -> Result<Introspection, PolicyError> {
        let url = self
            .introspection_url
            .as_deref()
            .ok_or(PolicyError::NotConfigured("policy.introspection_url"))?;
        let res = self
            .authenticated(self.client.post(url).form(&[("token", token)]))
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;
        decode(res).await
    }

    async fn authorize(&self, request: &AccessRequest) -> Result<Authorization, PolicyError> {
        let url = self
            .authorization_url
            .as_deref()
            .ok_or(PolicyError::NotConfigured("policy.authorization_url"))?;
        let res = self
            .authenticated(self.client.post(url).json(request))
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;
        decode(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Form;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str, service_token: Option<&str>) -> HttpPolicyClient {
        HttpPolicyClient::new(
            Some(format!("{base}/introspect")),
            Some(format!("{base}/authorize")),
            service_token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_introspect_sends_form_token() {
        let app = Router::new().route(
            "/introspect",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                let active = form.get("token").map(String::as_str) == Some("good");
                Json(Introspection {
                    active,
                    sub: "alice".into(),
                    ..Default::default()
                })
            }),
        );
        let base = spawn(app).await;
        let client = client(&base, None);

        let res = client.introspect("good").await.unwrap();
        assert!(res.active);
        assert_eq!(res.sub, "alice");
        assert!(!client.introspect("bad").await.unwrap().active);
    }

    #[tokio::test]
    async fn test_authorize_posts_access_request() {
        let app = Router::new().route(
            "/authorize",
            post(|headers: HeaderMap, Json(req): Json<AccessRequest>| async move {
                let authed = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer svc");
                Json(Authorization {
                    allowed: authed && req.action == "get:1" && req.resource == "users:1",
                    subject: "alice".into(),
                    ..Default::default()
                })
            }),
        );
        let base = spawn(app).await;
        let client = client(&base, Some("svc"));

        let request = AccessRequest {
            action: "get:1".into(),
            resource: "users:1".into(),
            scopes: vec![],
            token: "t".into(),
            context: Map::new(),
        };
        let res = client.authorize(&request).await.unwrap();
        assert!(res.allowed);
        assert_eq!(res.subject, "alice");
    }

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let base = spawn(Router::new()).await;
        let client = client(&base, None);
        assert!(matches!(
            client.introspect("t").await.unwrap_err(),
            PolicyError::Status(404)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint() {
        let client = HttpPolicyClient::new(None, None, None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            client.introspect("t").await.unwrap_err(),
            PolicyError::NotConfigured(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(&format!("http://{addr}"), None);
        assert!(matches!(
            client.introspect("t").await.unwrap_err(),
            PolicyError::Transport(_)
        ));
    }
}
