use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::access::errors::AccessError;
use crate::access::matcher::RuleMatcher;
use crate::access::policy::{AccessRequest, PolicyClient, PolicyError};
use crate::access::request::InboundRequest;
use crate::access::rule::{Rule, RuleMode};
use crate::access::session::Session;

pub const REMOTE_IP_CONTEXT_KEY: &str = "remoteIpAddress";

/// Classifies inbound requests against the active rule set and, for policy
/// rules, asks the policy service.
#[derive(Clone)]
pub struct Evaluator {
    matcher: Arc<RuleMatcher>,
    policy: Arc<dyn PolicyClient>,
}

impl Evaluator {
    pub fn new(matcher: Arc<RuleMatcher>, policy: Arc<dyn PolicyClient>) -> Self {
        Self { matcher, policy }
    }

    /// Decide on one request. Errors are final; nothing is retried here.
    pub async fn evaluate(&self, req: &InboundRequest) -> Result<Session, AccessError> {
        let url = req.match_url();
        let rule = self.matcher.match_rule(&req.method, &url).map_err(|e| {
            info!(access_url = %url, method = %req.method, granted = false, error = %e, "Access request denied");
            e
        })?;

        let outcome = match rule.mode {
            RuleMode::Bypass => Ok(Session::bypassed()),
            RuleMode::Anonymous => Ok(Session::anonymous()),
            RuleMode::Public => Ok(self.public(req).await),
            RuleMode::Policy => self.policy_gated(&rule, req, &url).await,
        };

        match &outcome {
            Ok(session) => info!(
                rule_id = %rule.id,
                access_url = %url,
                method = %req.method,
                granted = true,
                subject = %session.subject,
                "Access request granted"
            ),
            Err(e) => info!(
                rule_id = %rule.id,
                access_url = %url,
                method = %req.method,
                granted = false,
                error = %e,
                "Access request denied"
            ),
        }
        outcome
    }

    /// A present token only upgrades the session; any failure degrades to
    /// anonymous.
    async fn public(&self, req: &InboundRequest) -> Session {
        let Some(token) = req.token.as_deref() else {
            return Session::anonymous();
        };

        match self.policy.introspect(token).await {
            Ok(intro) if intro.active => {
                let mut session = Session::authenticated(intro.sub, intro.client_id);
                session.extra = intro.ext;
                session
            }
            Ok(_) => {
                warn!(token = %token_prefix(token), "Token is not active, continuing anonymously");
                Session::anonymous()
            }
            Err(e) => {
                warn!(token = %token_prefix(token), error = %e, "Token introspection failed, continuing anonymously");
                Session::anonymous()
            }
        }
    }

    async fn policy_gated(
        &self,
        rule: &Rule,
        req: &InboundRequest,
        url: &str,
    ) -> Result<Session, AccessError> {
        let Some(token) = req.token.as_deref() else {
            return Err(AccessError::MissingBearerToken);
        };

        let query = access_request(rule, req, url, token);
        debug!(action = %query.action, resource = %query.resource, "Querying policy service");

        let decision = self.policy.authorize(&query).await.map_err(|e| match e {
            PolicyError::Status(401) => AccessError::UnauthorizedToken,
            other => {
                warn!(rule_id = %rule.id, error = %other, "Policy service call failed");
                AccessError::PolicyService(other.to_string())
            }
        })?;

        if !decision.allowed {
            return Err(AccessError::ForbiddenByPolicy);
        }

        let mut session = Session::authenticated(decision.subject, decision.client_id);
        session.extra = decision.ext;
        Ok(session)
    }
}

/// Derive the authorization query for `rule` from the request.
fn access_request(rule: &Rule, req: &InboundRequest, url: &str, token: &str) -> AccessRequest {
    let mut context = req.context.clone();
    if let Some(ip) = &req.remote_ip {
        context.insert(REMOTE_IP_CONTEXT_KEY.into(), Value::String(ip.clone()));
    }

    AccessRequest {
        action: rule.expand(&rule.required_action, url),
        resource: rule.expand(&rule.required_resource, url),
        scopes: rule.required_scopes.clone(),
        token: token.to_string(),
        context,
    }
}

fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(5).collect();
    format!("{prefix}...")
}
