use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::Form;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use portcullis::access::policy::{AccessRequest, Authorization, Introspection, PolicyClient};
use portcullis::access::store::RuleStore;
use portcullis::keys::KeyManager;
use portcullis::settings::Settings;
use portcullis::web::{self, Gate};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Serve `app` on an ephemeral local port
pub async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("No local address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });
    addr
}

/// Backend that echoes what it received as JSON
pub async fn mock_backend() -> String {
    let app = Router::new().fallback(|req: Request<Body>| async move {
        let (parts, body) = req.into_parts();
        let authorization = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(body, 1 << 20).await.unwrap_or_default();
        Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path_and_query().map(|p| p.as_str()),
            "authorization": authorization,
            "body": String::from_utf8_lossy(&body),
        }))
    });
    format!("http://{}", spawn(app).await)
}

/// Policy service double.
///
/// Introspection: `good` is active as alice. Authorization: `good` may touch
/// `users:*`, `expired` is rejected with 401, `broken` with 500.
pub async fn mock_policy() -> String {
    let app = Router::new()
        .route(
            "/introspect",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                let active = form.get("token").map(String::as_str) == Some("good");
                Json(Introspection {
                    active,
                    sub: if active { "alice".into() } else { String::new() },
                    client_id: "web".into(),
                    ..Default::default()
                })
            }),
        )
        .route(
            "/authorize",
            post(|Json(req): Json<AccessRequest>| async move {
                match req.token.as_str() {
                    "expired" => StatusCode::UNAUTHORIZED.into_response(),
                    "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    token => Json(Authorization {
                        allowed: token == "good" && req.resource.starts_with("users:"),
                        subject: "alice".into(),
                        client_id: "web".into(),
                        ..Default::default()
                    })
                    .into_response(),
                }
            }),
        );
    format!("http://{}", spawn(app).await)
}

/// A running gate: proxy listener, API listener and background loops.
pub struct TestGate {
    pub gate: Gate,
    pub proxy_url: String,
    pub api_url: String,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestGate {
    pub async fn start(
        mut settings: Settings,
        backend_url: &str,
        store: Arc<dyn RuleStore>,
        policy: Arc<dyn PolicyClient>,
        keys: Arc<KeyManager>,
    ) -> Self {
        settings.backend.url = backend_url.to_string();
        let gate = Gate::assemble(settings, store, policy, keys).expect("Failed to assemble gate");
        Self::run(gate).await
    }

    pub async fn run(gate: Gate) -> Self {
        let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_url = format!("http://{}", proxy_listener.local_addr().unwrap());
        let api_url = format!("http://{}", api_listener.local_addr().unwrap());

        let token = CancellationToken::new();
        let mut tasks = gate.start_background(&token);
        let serving = gate.clone();
        let serve_token = token.clone();
        tasks.push(tokio::spawn(async move {
            web::serve_on(&serving, proxy_listener, api_listener, serve_token)
                .await
                .expect("Gate failed");
        }));

        Self {
            gate,
            proxy_url,
            api_url,
            token,
            tasks,
        }
    }

    /// Wait until the readiness endpoint reports ready
    pub async fn wait_ready(&self) {
        let client = reqwest::Client::new();
        for _ in 0..200 {
            if let Ok(res) = client.get(format!("{}/health/ready", self.api_url)).send().await {
                if res.status() == StatusCode::OK {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("Gate did not become ready");
    }

    /// Cancel everything and wait for it to stop
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            task.await.expect("Task panicked");
        }
    }
}

impl Drop for TestGate {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
