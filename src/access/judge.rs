use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::access::credentials::CredentialsIssuer;
use crate::access::errors::AccessError;
use crate::access::evaluator::{Evaluator, REMOTE_IP_CONTEXT_KEY};
use crate::access::request::{raw_authority, real_ip, InboundRequest};
use crate::access::session::Session;

/// Body of `POST /judge`: a request somebody else already received.
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Answers access questions without proxying anything.
#[derive(Clone)]
pub struct Judge {
    evaluator: Evaluator,
    issuer: CredentialsIssuer,
}

impl Judge {
    pub fn new(evaluator: Evaluator, issuer: CredentialsIssuer) -> Self {
        Self { evaluator, issuer }
    }

    async fn decide(&self, req: &InboundRequest) -> Result<(Session, Option<String>), AccessError> {
        let session = self.evaluator.evaluate(req).await?;
        let credential = self.issuer.issue(&session).await?;
        Ok((session, credential))
    }

    /// 200 plus the minted Authorization header on allow, the mapped error
    /// status otherwise.
    pub async fn verdict(&self, req: &InboundRequest) -> Response {
        match self.decide(req).await {
            Ok((session, credential)) => {
                let mut headers = HeaderMap::new();
                if let Some(token) = credential {
                    match HeaderValue::from_str(&format!("Bearer {token}")) {
                        Ok(value) => {
                            headers.insert(AUTHORIZATION, value);
                        }
                        Err(e) => return AccessError::Signing(e.to_string()).into_response(),
                    }
                }
                let body = json!({
                    "subject": session.subject,
                    "anonymous": session.anonymous,
                });
                (headers, Json(body)).into_response()
            }
            Err(e) => e.into_response(),
        }
    }
}

const JUDGE_PATH: &str = "/judge";

pub fn router(judge: Arc<Judge>) -> Router {
    Router::new()
        .route("/judge", post(judge_handler))
        .route("/judge/{*path}", any(mirror_handler))
        .with_state(judge)
}

fn peer(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

async fn judge_handler(
    State(judge): State<Arc<Judge>>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(body): Json<JudgeRequest>,
) -> Response {
    let method = match Method::from_bytes(body.method.to_ascii_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            return AccessError::InvalidRequest(format!("invalid method `{}`", body.method))
                .into_response()
        }
    };
    let url = match Url::parse(&body.url) {
        Ok(u) => u,
        Err(e) => {
            return AccessError::InvalidRequest(format!("invalid url `{}`: {e}", body.url))
                .into_response()
        }
    };

    let mut req = InboundRequest::new(method, url);
    if let Some(authority) = raw_authority(&body.url) {
        req = req.with_authority(authority);
    }
    if let Some(token) = body.token {
        req = req.with_token(token);
    }
    let remote_ip = body
        .context
        .get(REMOTE_IP_CONTEXT_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| real_ip(&headers, peer(&extensions)));
    req.remote_ip = remote_ip;
    req.context = body.context;

    judge.verdict(&req).await
}

/// `ANY /judge/<path>`: judge the call itself as if it had hit `/<path>`.
/// The path is taken as sent, still percent-encoded, so it matches the URL
/// the proxy listener would see.
async fn mirror_handler(
    State(judge): State<Arc<Judge>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let req = mirrored_uri(&uri).and_then(|target| {
        InboundRequest::from_http(&method, &target, &headers, peer(&extensions))
    });
    match req {
        Ok(req) => judge.verdict(&req).await,
        Err(e) => e.into_response(),
    }
}

/// `/judge/a%20b?x=1` becomes `/a%20b?x=1`.
fn mirrored_uri(uri: &Uri) -> Result<Uri, AccessError> {
    let path = uri.path().strip_prefix(JUDGE_PATH).unwrap_or(uri.path());
    let path = if path.starts_with('/') { path } else { "/" };
    let target = match uri.query() {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    target
        .parse::<Uri>()
        .map_err(|e| AccessError::InvalidRequest(e.to_string()))
}
