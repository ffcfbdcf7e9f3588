use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::access::errors::RuleError;
use crate::access::rule::RuleSpec;

/// Source of truth for the rule list. Polled by the rule refresh loop.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Return the complete, ordered rule list.
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, RuleError>;
}

/// Rules held in process memory.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    rules: RwLock<Vec<RuleSpec>>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<RuleSpec>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the stored list. Takes effect on the next refresh.
    pub fn set(&self, rules: Vec<RuleSpec>) {
        match self.rules.write() {
            Ok(mut guard) => *guard = rules,
            Err(poisoned) => *poisoned.into_inner() = rules,
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, RuleError> {
        let guard = self
            .rules
            .read()
            .map_err(|_| RuleError::RefreshFailed("memory rule store lock poisoned".into()))?;
        Ok(guard.clone())
    }
}

/// A JSON array of rules on disk, re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, RuleError> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RuleError::RefreshFailed(format!("unable to read `{}`: {e}", self.path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            RuleError::RefreshFailed(format!("`{}` is not a rule list: {e}", self.path.display()))
        })
    }
}

/// Rules served by a remote management API at `GET <base>/rules`.
#[derive(Debug, Clone)]
pub struct HttpRuleStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRuleStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn rules_url(&self) -> String {
        format!("{}/rules", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RuleStore for HttpRuleStore {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, RuleError> {
        let url = self.rules_url();
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RuleError::RefreshFailed(format!("GET {url}: {e}")))?;

        if res.status() != StatusCode::OK {
            return Err(RuleError::RefreshFailed(format!(
                "unable to fetch rules from {url}: expected status code 200 but got {}",
                res.status().as_u16()
            )));
        }

        res.json::<Vec<RuleSpec>>()
            .await
            .map_err(|e| RuleError::RefreshFailed(format!("decoding rules from {url}: {e}")))
    }
}
