//! Readiness probes fed by an in-process event bus.
//!
//! Probes register for the event types they care about at startup. Components
//! such as the rule refresh loop dispatch events without knowing who listens.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RULES_LOADED_EVENT: &str = "rules-loaded";
pub const RULE_FIRST_LOAD_PROBE: &str = "rule-first-load";

#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum HealthError {
    #[error("Event type `{0}` already has a registered listener")]
    #[diagnostic(
        code(portcullis::health::event_type_already_registered),
        help("Each event type is owned by exactly one readiness probe")
    )]
    EventTypeAlreadyRegistered(String),

    #[error("Rules have not been loaded yet")]
    #[diagnostic(code(portcullis::health::rules_not_yet_loaded))]
    RulesNotYetLoaded,
}

pub trait ReadinessEvent: Debug + Send + Sync {
    fn event_type(&self) -> &'static str;
}

/// A named check. Listens to the events it declares.
pub trait ReadinessProbe: Send + Sync {
    fn id(&self) -> &str;

    fn validate(&self) -> Result<(), HealthError>;

    fn event_types(&self) -> Vec<&'static str>;

    fn receive(&self, event: &dyn ReadinessEvent);
}

/// Single buffered event bus with a closed listener registry.
pub struct EventManager {
    listeners: HashMap<&'static str, Arc<dyn ReadinessProbe>>,
    probes: Vec<Arc<dyn ReadinessProbe>>,
    tx: mpsc::Sender<Arc<dyn ReadinessEvent>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<dyn ReadinessEvent>>>>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            listeners: HashMap::new(),
            probes: Vec::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Claim every event type `probe` declares. Fails without registering
    /// anything if one of them is already claimed or listed twice.
    pub fn add_listener(&mut self, probe: Arc<dyn ReadinessProbe>) -> Result<(), HealthError> {
        let types = probe.event_types();
        let mut seen = HashSet::new();
        if let Some(taken) = types
            .iter()
            .find(|t| self.listeners.contains_key(*t) || !seen.insert(**t))
        {
            return Err(HealthError::EventTypeAlreadyRegistered(taken.to_string()));
        }
        for event_type in types {
            self.listeners.insert(event_type, probe.clone());
        }
        self.probes.push(probe);
        Ok(())
    }

    pub fn probes(&self) -> &[Arc<dyn ReadinessProbe>] {
        &self.probes
    }

    /// Never blocks the caller. Must be called from within the runtime.
    pub fn dispatch(&self, event: Arc<dyn ReadinessEvent>) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::debug!(event_type = event.event_type(), "Event bus closed, dropping event");
            }
        }
    }

    /// Start routing events to listeners until `token` is cancelled. Only the
    /// first call consumes the channel.
    pub fn watch(&self, token: CancellationToken) -> JoinHandle<()> {
        let rx = match self.rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let listeners = self.listeners.clone();

        tokio::spawn(async move {
            let Some(mut rx) = rx else {
                tracing::warn!("Event manager is already being watched");
                return;
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => match listeners.get(event.event_type()) {
                            Some(listener) => listener.receive(event.as_ref()),
                            None => tracing::debug!(event_type = event.event_type(), "No listener for event"),
                        },
                        None => break,
                    },
                }
            }
            tracing::debug!("Event watcher stopped");
        })
    }

    /// Every failing probe, keyed by probe id.
    pub fn check_ready(&self) -> Result<(), BTreeMap<String, String>> {
        let errors: BTreeMap<String, String> = self
            .probes
            .iter()
            .filter_map(|probe| {
                probe
                    .validate()
                    .err()
                    .map(|e| (probe.id().to_string(), e.to_string()))
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleLoadedEvent;

impl ReadinessEvent for RuleLoadedEvent {
    fn event_type(&self) -> &'static str {
        RULES_LOADED_EVENT
    }
}

/// Ready once the rule set has loaded at least once.
#[derive(Debug, Default)]
pub struct RuleReadinessChecker {
    loaded: AtomicBool,
}

impl RuleReadinessChecker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReadinessProbe for RuleReadinessChecker {
    fn id(&self) -> &str {
        RULE_FIRST_LOAD_PROBE
    }

    fn validate(&self) -> Result<(), HealthError> {
        if self.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(HealthError::RulesNotYetLoaded)
        }
    }

    fn event_types(&self) -> Vec<&'static str> {
        vec![RULES_LOADED_EVENT]
    }

    fn receive(&self, event: &dyn ReadinessEvent) {
        if event.event_type() == RULES_LOADED_EVENT {
            self.loaded.store(true, Ordering::Release);
        }
    }
}

pub fn router(events: Arc<EventManager>) -> Router {
    Router::new()
        .route("/health/alive", get(alive))
        .route("/health/ready", get(ready))
        .route("/version", get(version))
        .with_state(events)
}

async fn alive() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(events): State<Arc<EventManager>>) -> Response {
    match events.check_ready() {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(errors) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errors": errors })),
        )
            .into_response(),
    }
}

async fn version() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingProbe {
        id: &'static str,
        types: Vec<&'static str>,
        received: AtomicUsize,
    }

    impl ReadinessProbe for CountingProbe {
        fn id(&self) -> &str {
            self.id
        }

        fn validate(&self) -> Result<(), HealthError> {
            Ok(())
        }

        fn event_types(&self) -> Vec<&'static str> {
            self.types.clone()
        }

        fn receive(&self, _event: &dyn ReadinessEvent) {
            self.received.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let first = Arc::new(CountingProbe {
            id: "first",
            types: vec!["a", "b"],
            ..Default::default()
        });
        let second = Arc::new(CountingProbe {
            id: "second",
            types: vec!["c", "b"],
            ..Default::default()
        });

        let mut events = EventManager::new();
        events.add_listener(first).unwrap();
        let err = events.add_listener(second).unwrap_err();
        assert_eq!(err, HealthError::EventTypeAlreadyRegistered("b".into()));

        // Nothing of the rejected probe was registered
        assert_eq!(events.probes().len(), 1);
        assert_eq!(events.listeners["b"].id(), "first");
        assert!(!events.listeners.contains_key("c"));
    }

    #[test]
    fn test_probe_listing_a_type_twice_is_rejected() {
        let probe = Arc::new(CountingProbe {
            id: "twice",
            types: vec!["a", "a"],
            ..Default::default()
        });

        let mut events = EventManager::new();
        let err = events.add_listener(probe).unwrap_err();
        assert_eq!(err, HealthError::EventTypeAlreadyRegistered("a".into()));
        assert!(events.probes().is_empty());
        assert!(events.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_events_routed_to_owner() {
        let rules = Arc::new(RuleReadinessChecker::new());
        let other = Arc::new(CountingProbe {
            id: "other",
            types: vec!["other-event"],
            ..Default::default()
        });

        let mut events = EventManager::new();
        events.add_listener(rules.clone()).unwrap();
        events.add_listener(other.clone()).unwrap();
        assert_eq!(
            rules.validate().unwrap_err(),
            HealthError::RulesNotYetLoaded
        );

        let token = CancellationToken::new();
        let handle = events.watch(token.clone());
        events.dispatch(Arc::new(RuleLoadedEvent));

        eventually(|| rules.validate().is_ok()).await;
        assert_eq!(other.received.load(Ordering::SeqCst), 0);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_before_watch_does_not_block() {
        let rules = Arc::new(RuleReadinessChecker::new());
        let mut events = EventManager::new();
        events.add_listener(rules.clone()).unwrap();

        // More events than the buffer holds
        for _ in 0..5 {
            events.dispatch(Arc::new(RuleLoadedEvent));
        }
        assert!(rules.validate().is_err());

        let token = CancellationToken::new();
        let handle = events.watch(token.clone());
        eventually(|| rules.validate().is_ok()).await;

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_watch_is_inert() {
        let events = EventManager::new();
        let token = CancellationToken::new();
        let first = events.watch(token.clone());
        let second = events.watch(token.clone());
        second.await.unwrap();

        token.cancel();
        first.await.unwrap();
    }

    #[test]
    fn test_check_ready_reports_failing_probes() {
        let mut events = EventManager::new();
        events
            .add_listener(Arc::new(RuleReadinessChecker::new()))
            .unwrap();

        let errors = events.check_ready().unwrap_err();
        assert_eq!(
            errors.get(RULE_FIRST_LOAD_PROBE).map(String::as_str),
            Some("Rules have not been loaded yet")
        );
    }

    #[tokio::test]
    async fn test_ready_endpoint() {
        let rules = Arc::new(RuleReadinessChecker::new());
        let mut events = EventManager::new();
        events.add_listener(rules.clone()).unwrap();
        let events = Arc::new(events);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(events.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::new();
        let res = client
            .get(format!("http://{addr}/health/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 503);
        let body: serde_json::Value = res.json().await.unwrap();
        assert!(body["errors"][RULE_FIRST_LOAD_PROBE].is_string());

        rules.receive(&RuleLoadedEvent);
        let res = client
            .get(format!("http://{addr}/health/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);

        let res = client
            .get(format!("http://{addr}/health/alive"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
    }
}
