//! Listeners. The proxy listener forwards everything through the access
//! pipeline; the API listener serves the judge, key and health endpoints.
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use miette::IntoDiagnostic;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use url::Url;

use crate::access::credentials::CredentialsIssuer;
use crate::access::director::{proxy_handler, Director, ReverseProxy, Transport};
use crate::access::errors::AccessError;
use crate::access::evaluator::Evaluator;
use crate::access::judge::{self, Judge};
use crate::access::matcher::RuleMatcher;
use crate::access::policy::{HttpPolicyClient, PolicyClient};
use crate::access::store::{FileRuleStore, HttpRuleStore, MemoryRuleStore, RuleStore};
use crate::errors::GateError;
use crate::health::{self, EventManager, RuleReadinessChecker};
use crate::keys::KeyManager;
use crate::refresh;
use crate::settings::{Cors, RuleStoreKind, Settings};

/// Everything the listeners and background loops share.
#[derive(Clone)]
pub struct Gate {
    pub settings: Arc<Settings>,
    pub matcher: Arc<RuleMatcher>,
    pub keys: Arc<KeyManager>,
    pub events: Arc<EventManager>,
    pub proxy: Arc<ReverseProxy>,
    pub judge: Arc<Judge>,
}

impl Gate {
    pub fn from_settings(settings: Settings) -> Result<Self, GateError> {
        let store = rule_store(&settings)?;
        let policy: Arc<dyn PolicyClient> =
            Arc::new(HttpPolicyClient::from_settings(&settings.policy)?);
        let keys = Arc::new(KeyManager::from_settings(&settings.keys)?);
        Self::assemble(settings, store, policy, keys)
    }

    /// Wire the pieces together around externally built collaborators.
    pub fn assemble(
        settings: Settings,
        store: Arc<dyn RuleStore>,
        policy: Arc<dyn PolicyClient>,
        keys: Arc<KeyManager>,
    ) -> Result<Self, GateError> {
        let backend = Url::parse(&settings.backend.url).map_err(|e| {
            GateError::InvalidConfig(format!("backend.url `{}`: {e}", settings.backend.url))
        })?;

        let matcher = Arc::new(RuleMatcher::new(store));
        let evaluator = Evaluator::new(matcher.clone(), policy);
        let issuer = CredentialsIssuer::from_settings(keys.clone(), &settings.credentials);

        let mut events = EventManager::new();
        events
            .add_listener(Arc::new(RuleReadinessChecker::new()))
            .map_err(|e| GateError::Other(e.to_string()))?;

        let proxy = ReverseProxy::new(
            Director::new(evaluator.clone(), issuer.clone(), backend),
            Transport::with_defaults()?,
        );

        Ok(Self {
            settings: Arc::new(settings),
            matcher,
            keys,
            events: Arc::new(events),
            proxy: Arc::new(proxy),
            judge: Arc::new(Judge::new(evaluator, issuer)),
        })
    }

    /// Start the event watcher and both refresh loops.
    pub fn start_background(&self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.events.watch(token.clone()),
            refresh::spawn_rule_refresh(
                self.matcher.clone(),
                self.events.clone(),
                self.settings.rules.refresh_interval(),
                token.clone(),
            ),
            refresh::spawn_key_refresh(
                self.keys.clone(),
                self.settings.keys.refresh_interval(),
                token.clone(),
            ),
        ]
    }
}

fn rule_store(settings: &Settings) -> Result<Arc<dyn RuleStore>, GateError> {
    let rules = &settings.rules;
    Ok(match rules.store {
        RuleStoreKind::Memory => Arc::new(MemoryRuleStore::default()),
        RuleStoreKind::File => {
            let path = rules.path.clone().ok_or_else(|| {
                GateError::InvalidConfig("rules.path is required for the file store".into())
            })?;
            Arc::new(FileRuleStore::new(path))
        }
        RuleStoreKind::Http => {
            let url = rules.url.clone().ok_or_else(|| {
                GateError::InvalidConfig("rules.url is required for the http store".into())
            })?;
            Arc::new(HttpRuleStore::new(url, settings.policy.timeout())?)
        }
    })
}

pub fn cors_layer(cfg: &Cors) -> Result<CorsLayer, GateError> {
    let wildcard = cfg.allowed_origins.iter().any(|o| o == "*");
    if wildcard && cfg.allow_credentials {
        return Err(GateError::InvalidConfig(
            "cors.allow_credentials cannot be combined with a wildcard origin".into(),
        ));
    }

    let origins = if wildcard || cfg.allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let list = cfg
            .allowed_origins
            .iter()
            .map(|o| HeaderValue::from_str(o))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GateError::InvalidConfig(format!("cors.allowed_origins: {e}")))?;
        AllowOrigin::list(list)
    };

    let methods = if cfg.allowed_methods.is_empty() {
        vec![Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE]
    } else {
        cfg.allowed_methods
            .iter()
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| GateError::InvalidConfig(format!("cors.allowed_methods: {e}")))?
    };

    let headers = cfg
        .allowed_headers
        .iter()
        .map(|h| HeaderName::from_bytes(h.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GateError::InvalidConfig(format!("cors.allowed_headers: {e}")))?;

    let mut layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(cfg.allow_credentials);
    if let Some(secs) = cfg.max_age_secs {
        layer = layer.max_age(Duration::from_secs(secs));
    }
    Ok(layer)
}

pub fn proxy_router(gate: &Gate) -> Result<Router, GateError> {
    let mut router = Router::new()
        .fallback(proxy_handler)
        .with_state(gate.proxy.clone());
    if gate.settings.cors.enabled {
        router = router.layer(cors_layer(&gate.settings.cors)?);
    }
    Ok(router.layer(TraceLayer::new_for_http()))
}

pub fn api_router(gate: &Gate) -> Router {
    let keys = Router::new()
        .route("/.well-known/jwks.json", get(jwks_handler))
        .with_state(gate.keys.clone());

    Router::new()
        .merge(judge::router(gate.judge.clone()))
        .merge(health::router(gate.events.clone()))
        .merge(keys)
        .layer(TraceLayer::new_for_http())
}

async fn jwks_handler(State(keys): State<Arc<KeyManager>>) -> Response {
    match keys.jwks().await {
        Ok(jwks) => Json(jwks).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Unable to publish signing keys");
            AccessError::Signing(e.to_string()).into_response()
        }
    }
}

async fn bind(addr: &str) -> miette::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| miette::miette!("bad listen addr `{addr}`: {e}"))?;
    tokio::net::TcpListener::bind(addr).await.into_diagnostic()
}

/// Serve on already bound listeners until `token` is cancelled.
pub async fn serve_on(
    gate: &Gate,
    proxy_listener: tokio::net::TcpListener,
    api_listener: tokio::net::TcpListener,
    token: CancellationToken,
) -> miette::Result<()> {
    let proxy_app = proxy_router(gate)?;
    let api_app = api_router(gate);

    let proxy_token = token.clone();
    let proxy = axum::serve(
        proxy_listener,
        proxy_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { proxy_token.cancelled().await });

    let api_token = token.clone();
    let api = axum::serve(
        api_listener,
        api_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { api_token.cancelled().await });

    let (proxy_result, api_result) = tokio::join!(proxy.into_future(), api.into_future());
    proxy_result.into_diagnostic()?;
    api_result.into_diagnostic()?;
    Ok(())
}

pub async fn serve(gate: &Gate, token: CancellationToken) -> miette::Result<()> {
    let proxy_addr = gate.settings.proxy_addr();
    let api_addr = gate.settings.api_addr();
    let proxy_listener = bind(&proxy_addr).await?;
    let api_listener = bind(&api_addr).await?;

    tracing::info!(%proxy_addr, backend = %gate.settings.backend.url, "Proxy listening");
    tracing::info!(%api_addr, "API listening");

    serve_on(gate, proxy_listener, api_listener, token).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_rejects_credentials_with_wildcard() {
        let cfg = Cors {
            enabled: true,
            allowed_origins: vec!["*".into()],
            allow_credentials: true,
            ..Default::default()
        };
        assert!(matches!(cors_layer(&cfg), Err(GateError::InvalidConfig(_))));
    }

    #[test]
    fn test_cors_rejects_bad_method() {
        let cfg = Cors {
            enabled: true,
            allowed_methods: vec!["NOT A METHOD".into()],
            ..Default::default()
        };
        assert!(matches!(cors_layer(&cfg), Err(GateError::InvalidConfig(_))));
    }

    #[test]
    fn test_cors_with_origin_list() {
        let cfg = Cors {
            enabled: true,
            allowed_origins: vec!["https://app.example.com".into()],
            allowed_headers: vec!["authorization".into()],
            allow_credentials: true,
            max_age_secs: Some(600),
            ..Default::default()
        };
        assert!(cors_layer(&cfg).is_ok());
    }

    #[test]
    fn test_rule_store_requires_location() {
        let mut settings = Settings::default();
        settings.rules.store = RuleStoreKind::Http;
        settings.rules.url = None;
        assert!(matches!(rule_store(&settings), Err(GateError::InvalidConfig(_))));

        settings.rules.store = RuleStoreKind::File;
        settings.rules.path = None;
        assert!(matches!(rule_store(&settings), Err(GateError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_backend_url() {
        let mut settings = Settings::default();
        settings.backend.url = "not a url".into();
        let keys = Arc::new(KeyManager::shared_secret(b"0123456789abcdef0123456789abcdef").unwrap());
        let result = Gate::assemble(
            settings,
            Arc::new(MemoryRuleStore::default()),
            Arc::new(HttpPolicyClient::new(None, None, None, Duration::from_secs(1)).unwrap()),
            keys,
        );
        assert!(matches!(result, Err(GateError::InvalidConfig(_))));
    }
}
