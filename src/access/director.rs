//! Reverse proxy glue. `Director::direct` decides and rewrites the request,
//! `Transport::round_trip` forwards it or answers the deny. The decision
//! travels between the two as a [`Verdict`] in the request extensions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{AUTHORIZATION, CONNECTION, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Uri};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};
use url::Url;

use crate::access::credentials::CredentialsIssuer;
use crate::access::errors::AccessError;
use crate::access::evaluator::Evaluator;
use crate::access::request::InboundRequest;

/// Maximum buffered request body (10 MB)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The access decision for one in-flight request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// `credential` replaces the inbound Authorization header when set
    Allowed { credential: Option<String> },
    Denied(AccessError),
}

#[derive(Clone)]
pub struct Director {
    evaluator: Evaluator,
    issuer: CredentialsIssuer,
    backend: Url,
}

impl Director {
    pub fn new(evaluator: Evaluator, issuer: CredentialsIssuer, backend: Url) -> Self {
        Self {
            evaluator,
            issuer,
            backend,
        }
    }

    /// Evaluate `req` and stamp exactly one verdict on it. Allowed requests
    /// are retargeted at the backend.
    pub async fn direct(&self, req: &mut Request<Body>) {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let inbound = InboundRequest::from_http(req.method(), req.uri(), req.headers(), peer);

        let verdict = match self.decide(inbound).await {
            Ok(credential) => match backend_uri(&self.backend, req.uri()) {
                Ok(uri) => {
                    *req.uri_mut() = uri;
                    Verdict::Allowed { credential }
                }
                Err(e) => Verdict::Denied(e),
            },
            Err(e) => Verdict::Denied(e),
        };
        req.extensions_mut().insert(verdict);
    }

    async fn decide(
        &self,
        inbound: Result<InboundRequest, AccessError>,
    ) -> Result<Option<String>, AccessError> {
        let session = self.evaluator.evaluate(&inbound?).await?;
        self.issuer.issue(&session).await
    }
}

/// Keep the path and query of `original`, take scheme, authority and path
/// prefix from `backend`.
pub fn backend_uri(backend: &Url, original: &Uri) -> Result<Uri, AccessError> {
    let path_and_query = original.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let base = backend.as_str().trim_end_matches('/');
    format!("{base}{path_and_query}")
        .parse::<Uri>()
        .map_err(|e| AccessError::InvalidRequest(format!("unable to build backend url: {e}")))
}

#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// A proxy client never follows redirects on behalf of the caller.
    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self::new(client))
    }

    pub async fn round_trip(&self, req: Request<Body>) -> Response {
        let verdict = req.extensions().get::<Verdict>().cloned();
        match verdict {
            Some(Verdict::Allowed { credential }) => match self.forward(req, credential).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            },
            Some(Verdict::Denied(e)) => e.into_response(),
            None => {
                error!(uri = %req.uri(), "Transport reached without an access decision");
                AccessError::InvariantViolation.into_response()
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Body>,
        credential: Option<String>,
    ) -> Result<Response, AccessError> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        if let Some(token) = credential {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| AccessError::Signing(e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(peer) = peer {
            append_forwarded_for(&mut headers, &peer.ip().to_string());
        }

        let body = to_bytes(body, MAX_BODY_SIZE)
            .await
            .map_err(|e| AccessError::InvalidRequest(format!("unable to read request body: {e}")))?;

        let upstream = self
            .client
            .request(parts.method.clone(), parts.uri.to_string())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!(method = %parts.method, uri = %parts.uri, error = %e, "Upstream round trip failed");
                AccessError::UpstreamTransport(e.to_string())
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        if status.is_server_error() {
            warn!(uri = %parts.uri, status = status.as_u16(), "Backend answered with an error");
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Remove connection-scoped headers, including any the Connection header
/// itself names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{prior}, {ip}"),
        _ => ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Director and Transport run back to back on the same request value.
#[derive(Clone)]
pub struct ReverseProxy {
    pub director: Director,
    pub transport: Transport,
}

impl ReverseProxy {
    pub fn new(director: Director, transport: Transport) -> Self {
        Self {
            director,
            transport,
        }
    }

    pub async fn handle(&self, mut req: Request<Body>) -> Response {
        self.director.direct(&mut req).await;
        self.transport.round_trip(req).await
    }
}

/// Fallback handler of the proxy listener.
pub async fn proxy_handler(State(proxy): State<Arc<ReverseProxy>>, req: Request<Body>) -> Response {
    proxy.handle(req).await
}
