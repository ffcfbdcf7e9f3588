use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

/// Everything that can turn an inbound request into a deny.
#[derive(Debug, Clone, Error, Diagnostic, PartialEq, Eq)]
pub enum AccessError {
    #[error("Access credentials are missing")]
    #[diagnostic(
        code(portcullis::access::missing_bearer_token),
        help("Send the token as `Authorization: Bearer <token>` or as the `access_token` query parameter")
    )]
    MissingBearerToken,

    #[error("Access credentials are invalid")]
    #[diagnostic(code(portcullis::access::unauthorized))]
    UnauthorizedToken,

    #[error("Access credentials are not sufficient to access this resource")]
    #[diagnostic(code(portcullis::access::forbidden))]
    ForbiddenByPolicy,

    #[error("Requested url does not match any rules")]
    #[diagnostic(code(portcullis::access::no_matching_rule))]
    NoMatchingRule,

    #[error("Expected exactly one rule but found {0} matching rules")]
    #[diagnostic(
        code(portcullis::access::ambiguous_match),
        help("Two or more rules share a method and an overlapping URL pattern; tighten the patterns")
    )]
    AmbiguousMatch(usize),

    #[error("Policy service failure: {0}")]
    #[diagnostic(code(portcullis::access::policy_service))]
    PolicyService(String),

    #[error("Unable to issue credentials: {0}")]
    #[diagnostic(code(portcullis::access::signing))]
    Signing(String),

    #[error("Upstream round trip failed: {0}")]
    #[diagnostic(code(portcullis::access::upstream))]
    UpstreamTransport(String),

    #[error("Transport invoked without an access decision")]
    #[diagnostic(
        code(portcullis::access::invariant_violation),
        help("Director::direct must run on a request before Transport::round_trip")
    )]
    InvariantViolation,

    #[error("Invalid request: {0}")]
    #[diagnostic(code(portcullis::access::invalid_request))]
    InvalidRequest(String),
}

impl AccessError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AccessError::MissingBearerToken | AccessError::UnauthorizedToken => {
                StatusCode::UNAUTHORIZED
            }
            AccessError::ForbiddenByPolicy => StatusCode::FORBIDDEN,
            AccessError::NoMatchingRule => StatusCode::NOT_FOUND,
            AccessError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AccessError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            AccessError::AmbiguousMatch(_)
            | AccessError::PolicyService(_)
            | AccessError::Signing(_)
            | AccessError::InvariantViolation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Failures while loading or compiling a rule set.
#[derive(Debug, Error, Diagnostic)]
pub enum RuleError {
    #[error("Rule `{id}` has an invalid URL pattern")]
    #[diagnostic(
        code(portcullis::rules::invalid_pattern),
        help("`match.url` must be a valid regular expression over scheme://host/path")
    )]
    InvalidPattern {
        id: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule `{id}` is invalid: {reason}")]
    #[diagnostic(code(portcullis::rules::invalid_rule))]
    InvalidRule { id: String, reason: String },

    #[error("Refreshing rules failed: {0}")]
    #[diagnostic(
        code(portcullis::rules::refresh_failed),
        help("The previously loaded rule set stays active until a refresh succeeds")
    )]
    RefreshFailed(String),
}
