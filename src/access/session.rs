use std::time::{Duration, SystemTime};

use josekit::jwt::JwtPayload;
use serde_json::{Map, Value};

use crate::errors::GateError;

/// Who the caller turned out to be once a rule has been applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Empty for anonymous callers
    pub subject: String,
    pub client_id: String,
    pub anonymous: bool,
    /// Set by bypass rules; no credentials are minted for these
    pub bypassed: bool,
    pub extra: Map<String, Value>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            anonymous: true,
            ..Default::default()
        }
    }

    pub fn bypassed() -> Self {
        Self {
            anonymous: true,
            bypassed: true,
            ..Default::default()
        }
    }

    pub fn authenticated(subject: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Claims of the credential forwarded to the backend.
    pub fn to_claims(&self, issuer: &str, lifespan: Duration) -> Result<JwtPayload, GateError> {
        let now = SystemTime::now();
        let mut payload = JwtPayload::new();
        payload.set_issuer(issuer);
        payload.set_subject(&self.subject);
        if !self.client_id.is_empty() {
            payload.set_audience(vec![self.client_id.as_str()]);
        }
        payload.set_issued_at(&now);
        payload.set_not_before(&now);
        payload.set_expires_at(&(now + lifespan));
        payload.set_jwt_id(uuid::Uuid::new_v4().to_string());
        payload.set_claim("anon", Some(Value::Bool(self.anonymous)))?;
        payload.set_claim("ext", Some(Value::Object(self.extra.clone())))?;
        Ok(payload)
    }
}
