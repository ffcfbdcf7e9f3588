use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use base64ct::Encoding;
use josekit::jwk::Jwk;
use josekit::jws::{JwsHeader, JwsSigner, HS256, RS256};
use josekit::jwt::{self, JwtPayload};
use miette::Diagnostic;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::errors::GateError;
use crate::settings::{KeyAlgorithm, Keys};

pub const DEFAULT_LOCAL_KEY_ID: &str = "id-token:public";
const MIN_RSA_BITS: usize = 2048;
const MIN_SECRET_LEN: usize = 32;
const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, Diagnostic)]
pub enum KeyError {
    #[error("Refreshing signing keys failed: {0}")]
    #[diagnostic(
        code(portcullis::keys::refresh_failed),
        help("The previously loaded key stays in use until a refresh succeeds")
    )]
    RefreshFailed(String),

    #[error("Key set `{set}` does not contain a private key")]
    #[diagnostic(
        code(portcullis::keys::no_private_key),
        help("The key service must return a JWK whose `kid` contains `private:`")
    )]
    NoPrivateKey { set: String },

    #[error("Key `{kid}` has type `{found}`, expected `{expected}`")]
    #[diagnostic(code(portcullis::keys::wrong_key_type))]
    WrongKeyType {
        kid: String,
        expected: &'static str,
        found: String,
    },

    #[error("JOSE error: {0}")]
    #[diagnostic(code(portcullis::keys::jose))]
    Jose(String),
}

impl From<josekit::JoseError> for KeyError {
    fn from(value: josekit::JoseError) -> Self {
        KeyError::Jose(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Rs256,
    Hs256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::Hs256 => "HS256",
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, SigningAlgorithm::Hs256)
    }
}

/// One complete key. Replaced as a whole on refresh, never edited in place.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    pub private: Jwk,
    /// Verification key; the secret itself for symmetric keys
    pub public: Jwk,
}

impl SigningKey {
    fn signer(&self) -> Result<Box<dyn JwsSigner>, KeyError> {
        Ok(match self.algorithm {
            SigningAlgorithm::Rs256 => Box::new(RS256.signer_from_jwk(&self.private)?),
            SigningAlgorithm::Hs256 => Box::new(HS256.signer_from_jwk(&self.private)?),
        })
    }
}

/// Where keys come from. Fixed at construction.
#[derive(Debug)]
pub enum KeySource {
    /// RSA key pair generated in-process on every refresh
    Local { bits: usize, kid: String },
    /// Key set issued by a remote key service
    Remote {
        client: reqwest::Client,
        base_url: String,
        set_id: String,
    },
    /// Pre-shared HMAC secret; refresh is a no-op
    SharedSecret { key: Arc<SigningKey> },
}

pub struct KeyManager {
    source: KeySource,
    current: ArcSwapOption<SigningKey>,
    refresh_lock: Mutex<()>,
}

impl KeyManager {
    pub fn new(source: KeySource) -> Self {
        Self {
            source,
            current: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn local(bits: usize, kid: Option<String>) -> Self {
        Self::new(KeySource::Local {
            bits,
            kid: kid.unwrap_or_else(|| DEFAULT_LOCAL_KEY_ID.to_string()),
        })
    }

    pub fn remote(
        base_url: impl Into<String>,
        set_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GateError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(KeySource::Remote {
            client,
            base_url: base_url.into(),
            set_id: set_id.into(),
        }))
    }

    pub fn shared_secret(secret: &[u8]) -> Result<Self, GateError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(GateError::InvalidConfig(format!(
                "the shared secret must be at least {MIN_SECRET_LEN} bytes long, got {}",
                secret.len()
            )));
        }

        let mut jwk = Jwk::new("oct");
        jwk.set_parameter(
            "k",
            Some(Value::String(base64ct::Base64UrlUnpadded::encode_string(
                secret,
            ))),
        )?;
        let kid = uuid::Uuid::new_v4().to_string();
        jwk.set_key_id(&kid);
        jwk.set_algorithm("HS256");
        jwk.set_key_use("sig");

        let key = SigningKey {
            kid,
            algorithm: SigningAlgorithm::Hs256,
            public: jwk.clone(),
            private: jwk,
        };
        Ok(Self::new(KeySource::SharedSecret { key: Arc::new(key) }))
    }

    pub fn from_settings(cfg: &Keys) -> Result<Self, GateError> {
        match cfg.algorithm {
            KeyAlgorithm::Rs256 => {
                if cfg.key_strength < MIN_RSA_BITS {
                    return Err(GateError::InvalidConfig(format!(
                        "keys.key_strength must be at least {MIN_RSA_BITS} bits"
                    )));
                }
                Ok(Self::local(cfg.key_strength, cfg.key_id.clone()))
            }
            KeyAlgorithm::Remote => {
                let url = cfg.remote_url.clone().ok_or_else(|| {
                    GateError::InvalidConfig("keys.remote_url is required for remote keys".into())
                })?;
                Self::remote(url, cfg.set_id.clone(), REMOTE_TIMEOUT)
            }
            KeyAlgorithm::Hs256 => {
                let secret = cfg.shared_secret.as_deref().ok_or_else(|| {
                    GateError::InvalidConfig("keys.shared_secret is required for hs256".into())
                })?;
                Self::shared_secret(secret.as_bytes())
            }
        }
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        match &self.source {
            KeySource::Local { .. } | KeySource::Remote { .. } => SigningAlgorithm::Rs256,
            KeySource::SharedSecret { key } => key.algorithm,
        }
    }

    /// Load a fresh key and swap it in. On failure the old key stays.
    pub async fn refresh(&self) -> Result<(), KeyError> {
        let _guard = self.refresh_lock.lock().await;
        self.reload().await
    }

    async fn reload(&self) -> Result<(), KeyError> {
        let key = match &self.source {
            KeySource::Local { bits, kid } => generate_local(*bits, kid).await?,
            KeySource::Remote {
                client,
                base_url,
                set_id,
            } => fetch_remote(client, base_url, set_id).await?,
            KeySource::SharedSecret { key } => key.clone(),
        };
        tracing::debug!(kid = %key.kid, alg = key.algorithm.as_str(), "Signing key loaded");
        self.current.store(Some(key));
        Ok(())
    }

    /// The current key, refreshing first if none has been loaded yet.
    pub async fn private_key(&self) -> Result<Arc<SigningKey>, KeyError> {
        if let Some(key) = self.current.load_full() {
            return Ok(key);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have loaded it while we waited
        if let Some(key) = self.current.load_full() {
            return Ok(key);
        }
        self.reload().await?;
        self.current
            .load_full()
            .ok_or_else(|| KeyError::RefreshFailed("no key loaded after refresh".into()))
    }

    pub async fn public_key(&self) -> Result<Jwk, KeyError> {
        Ok(self.private_key().await?.public.clone())
    }

    pub async fn public_key_id(&self) -> Result<String, KeyError> {
        Ok(self.private_key().await?.kid.clone())
    }

    /// The JSON Web Key Set published for verifiers. Symmetric keys are not
    /// published.
    pub async fn jwks(&self) -> Result<Value, KeyError> {
        if self.algorithm().is_symmetric() {
            return Ok(json!({ "keys": [] }));
        }
        let public = self.public_key().await?;
        Ok(json!({ "keys": [serde_json::to_value(public).map_err(|e| KeyError::Jose(e.to_string()))?] }))
    }

    pub async fn sign(&self, payload: &JwtPayload) -> Result<String, KeyError> {
        let key = self.private_key().await?;
        let signer = key.signer()?;
        let mut header = JwsHeader::new();
        header.set_key_id(&key.kid);
        header.set_algorithm(key.algorithm.as_str());
        header.set_token_type("JWT");
        Ok(jwt::encode_with_signer(payload, &header, &*signer)?)
    }
}

fn finish_rsa(private: Jwk, kid: &str) -> Result<SigningKey, KeyError> {
    let mut public = private.to_public_key()?;
    public.set_key_id(kid);
    public.set_algorithm("RS256");
    public.set_key_use("sig");
    Ok(SigningKey {
        kid: kid.to_string(),
        algorithm: SigningAlgorithm::Rs256,
        private,
        public,
    })
}

async fn generate_local(bits: usize, kid: &str) -> Result<Arc<SigningKey>, KeyError> {
    let bits = u32::try_from(bits)
        .map_err(|_| KeyError::RefreshFailed(format!("unsupported key strength {bits}")))?;
    // RSA generation is CPU bound
    let private = tokio::task::spawn_blocking(move || Jwk::generate_rsa_key(bits))
        .await
        .map_err(|e| KeyError::RefreshFailed(format!("key generation task failed: {e}")))??;
    Ok(Arc::new(finish_rsa(private, kid)?))
}

async fn fetch_remote(
    client: &reqwest::Client,
    base_url: &str,
    set_id: &str,
) -> Result<Arc<SigningKey>, KeyError> {
    let url = format!("{}/keys/{}", base_url.trim_end_matches('/'), set_id);
    let res = client
        .get(&url)
        .send()
        .await
        .map_err(|e| KeyError::RefreshFailed(format!("GET {url}: {e}")))?;

    let res = match res.status() {
        StatusCode::OK => res,
        StatusCode::NOT_FOUND => {
            tracing::info!(set = %set_id, "Key set does not exist yet, requesting it");
            let created = client
                .post(&url)
                .json(&json!({ "alg": "RS256" }))
                .send()
                .await
                .map_err(|e| KeyError::RefreshFailed(format!("POST {url}: {e}")))?;
            if created.status() != StatusCode::CREATED {
                return Err(KeyError::RefreshFailed(format!(
                    "creating key set {set_id}: expected status code 201 but got {}",
                    created.status().as_u16()
                )));
            }
            created
        }
        other => {
            return Err(KeyError::RefreshFailed(format!(
                "fetching key set {set_id}: expected status code 200 but got {}",
                other.as_u16()
            )))
        }
    };

    let body: Value = res
        .json()
        .await
        .map_err(|e| KeyError::RefreshFailed(format!("decoding key set {set_id}: {e}")))?;

    let private = private_key_from_set(&body, set_id)?;
    Ok(Arc::new(finish_rsa(private, &format!("{set_id}:public"))?))
}

fn private_key_from_set(body: &Value, set_id: &str) -> Result<Jwk, KeyError> {
    let entry = body
        .get("keys")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .find(|key| {
            key.get("kid")
                .and_then(Value::as_str)
                .is_some_and(|kid| kid.contains("private:"))
        })
        .ok_or_else(|| KeyError::NoPrivateKey {
            set: set_id.to_string(),
        })?;

    let jwk = Jwk::from_map(entry.clone())?;
    if jwk.key_type() != "RSA" {
        return Err(KeyError::WrongKeyType {
            kid: jwk.key_id().unwrap_or_default().to_string(),
            expected: "RSA",
            found: jwk.key_type().to_string(),
        });
    }
    if jwk.parameter("d").is_none() {
        return Err(KeyError::NoPrivateKey {
            set: set_id.to_string(),
        });
    }
    Ok(jwk)
}
