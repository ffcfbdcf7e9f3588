use std::sync::Arc;
use std::time::Duration;

use crate::access::errors::AccessError;
use crate::access::session::Session;
use crate::keys::KeyManager;

/// Mints the bearer token the backend receives in place of the caller's.
#[derive(Clone)]
pub struct CredentialsIssuer {
    keys: Arc<KeyManager>,
    issuer: String,
    lifespan: Duration,
}

impl CredentialsIssuer {
    pub fn new(keys: Arc<KeyManager>, issuer: impl Into<String>, lifespan: Duration) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            lifespan,
        }
    }

    pub fn from_settings(keys: Arc<KeyManager>, cfg: &crate::settings::Credentials) -> Self {
        Self::new(keys, cfg.issuer.clone(), Duration::from_secs(cfg.lifespan_secs))
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// `None` for bypassed sessions; their credentials pass through untouched.
    pub async fn issue(&self, session: &Session) -> Result<Option<String>, AccessError> {
        if session.bypassed {
            return Ok(None);
        }

        let claims = session
            .to_claims(&self.issuer, self.lifespan)
            .map_err(|e| AccessError::Signing(e.to_string()))?;
        let token = self.keys.sign(&claims).await.map_err(|e| {
            tracing::error!(error = %e, "Unable to sign outbound credentials");
            AccessError::Signing(e.to_string())
        })?;
        Ok(Some(token))
    }
}
