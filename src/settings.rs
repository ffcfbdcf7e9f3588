use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::GateError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub backend: Backend,
    pub rules: Rules,
    pub policy: Policy,
    pub keys: Keys,
    pub credentials: Credentials,
    #[serde(default)]
    pub cors: Cors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    /// Port of the reverse proxy listener
    pub proxy_port: u16,
    /// Port of the API listener (judge, JWKS, health)
    pub api_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Upstream every allowed request is forwarded to, e.g. http://localhost:8000
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleStoreKind {
    Memory,
    File,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    pub store: RuleStoreKind,
    /// JSON file holding the rule list (store = "file")
    pub path: Option<PathBuf>,
    /// Base URL serving `GET /rules` (store = "http")
    pub url: Option<String>,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// OAuth2 token introspection endpoint (RFC 7662)
    pub introspection_url: Option<String>,
    /// Endpoint answering "is this token allowed to perform {action, resource}"
    pub authorization_url: Option<String>,
    /// Optional bearer credential presented to the policy service
    pub service_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// RSA key pair generated in-process
    Rs256,
    /// RSA key pair issued by a remote key service
    Remote,
    /// Pre-shared HMAC secret
    Hs256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keys {
    pub algorithm: KeyAlgorithm,
    /// RSA modulus size for locally generated keys
    pub key_strength: usize,
    /// Optional explicit key id for locally generated keys
    pub key_id: Option<String>,
    /// Admin URL of the key issuance service (algorithm = "remote")
    pub remote_url: Option<String>,
    /// Name of the key set requested from the key issuance service
    pub set_id: String,
    /// HMAC secret (algorithm = "hs256"), at least 32 bytes
    pub shared_secret: Option<String>,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// `iss` claim of the tokens forwarded upstream
    pub issuer: String,
    pub lifespan_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Cors {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            proxy_port: 4455,
            api_port: 4456,
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_string(),
        }
    }
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            store: RuleStoreKind::File,
            path: Some(PathBuf::from("rules.json")),
            url: None,
            refresh_interval_secs: 30,
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            introspection_url: None,
            authorization_url: None,
            service_token: None,
            timeout_secs: 5,
        }
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::Rs256,
            key_strength: 4096,
            key_id: None,
            remote_url: None,
            set_id: "portcullis:id-token".to_string(),
            shared_secret: None,
            refresh_interval_secs: 300,
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            issuer: "http://127.0.0.1:4455".to_string(),
            lifespan_secs: 3600,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, GateError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)?
            .set_default("server.proxy_port", Server::default().proxy_port)?
            .set_default("server.api_port", Server::default().api_port)?
            .set_default("backend.url", Backend::default().url)?
            .set_default("rules.store", "file")?
            .set_default("rules.path", "rules.json")?
            .set_default(
                "rules.refresh_interval_secs",
                Rules::default().refresh_interval_secs,
            )?
            .set_default("policy.timeout_secs", Policy::default().timeout_secs)?
            .set_default("keys.algorithm", "rs256")?
            .set_default("keys.key_strength", Keys::default().key_strength as u64)?
            .set_default("keys.set_id", Keys::default().set_id)?
            .set_default(
                "keys.refresh_interval_secs",
                Keys::default().refresh_interval_secs,
            )?
            .set_default("credentials.issuer", Credentials::default().issuer)?
            .set_default(
                "credentials.lifespan_secs",
                Credentials::default().lifespan_secs,
            )?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: PORTCULLIS__SERVER__PROXY_PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("PORTCULLIS").separator("__"));

        let cfg = builder.build()?;
        let mut s: Settings = cfg.try_deserialize()?;

        // Normalize the rules file path to be relative to current dir
        if let Some(rules_path) = &s.rules.path {
            if rules_path.is_relative() {
                s.rules.path = Some(std::env::current_dir()?.join(rules_path));
            }
        }

        Ok(s)
    }

    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.proxy_port)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.api_port)
    }
}

impl Rules {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Keys {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl Policy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
