use std::net::SocketAddr;

use axum::http::header::{AUTHORIZATION, HOST};
use axum::http::uri::Authority;
use axum::http::{HeaderMap, Method, Uri};
use serde_json::{Map, Value};
use url::Url;

use crate::access::errors::AccessError;

pub const ACCESS_TOKEN_PARAM: &str = "access_token";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_REAL_IP: &str = "x-real-ip";

/// The parts of an inbound call the access decision is based on.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub url: Url,
    /// `host[:port]` as the caller sent it. Unlike `url`, a port equal to the
    /// scheme default is kept.
    pub authority: String,
    pub token: Option<String>,
    pub remote_ip: Option<String>,
    /// Extra context forwarded to the policy service
    pub context: Map<String, Value>,
}

impl InboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let authority = url_authority(&url);
        Self {
            method,
            url,
            authority,
            token: None,
            remote_ip: None,
            context: Map::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t: &String| !t.is_empty());
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_remote_ip(mut self, ip: impl Into<String>) -> Self {
        self.remote_ip = Some(ip.into());
        self
    }

    /// Build from a request as received by the proxy listener.
    pub fn from_http(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<Self, AccessError> {
        let authority = request_authority(uri, headers)?;
        let url = request_url(uri, headers)?;
        let token = bearer_token(headers, &url);
        Ok(Self {
            method: method.clone(),
            authority,
            token,
            remote_ip: real_ip(headers, peer),
            url,
            context: Map::new(),
        })
    }

    /// `scheme://host[:port]/path`, the string rules are matched against.
    /// Query string and fragment are not part of it.
    pub fn match_url(&self) -> String {
        format!("{}://{}{}", self.url.scheme(), self.authority, self.url.path())
    }
}

/// Host of a proxied request: the Host header, else the URI authority.
pub fn request_authority(uri: &Uri, headers: &HeaderMap) -> Result<String, AccessError> {
    let from_header = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.parse::<Authority>()
                .map_err(|e| AccessError::InvalidRequest(format!("invalid host `{v}`: {e}")))
        })
        .transpose()?;
    from_header
        .as_ref()
        .or_else(|| uri.authority())
        .map(authority_string)
        .ok_or_else(|| AccessError::InvalidRequest("request has no host".into()))
}

/// Authority of an absolute URL exactly as written, default port included.
pub fn raw_authority(raw: &str) -> Option<String> {
    raw.parse::<Uri>()
        .ok()
        .and_then(|uri| uri.authority().map(authority_string))
}

fn authority_string(authority: &Authority) -> String {
    let host = authority.host().to_ascii_lowercase();
    match authority.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

fn url_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Reconstruct the absolute URL of a proxied request. Proxies usually receive
/// origin-form URIs, so scheme and host come from the headers.
pub fn request_url(uri: &Uri, headers: &HeaderMap) -> Result<Url, AccessError> {
    let scheme = headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .or_else(|| uri.scheme_str().map(str::to_string))
        .unwrap_or_else(|| "http".to_string());

    let host = request_authority(uri, headers)?;
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    Url::parse(&format!("{scheme}://{host}{path_and_query}"))
        .map_err(|e| AccessError::InvalidRequest(format!("malformed request url: {e}")))
}

/// RFC 6750 bearer token: the Authorization header first, then the
/// `access_token` query parameter. Empty tokens count as absent.
pub fn bearer_token(headers: &HeaderMap, url: &Url) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        url.query_pairs()
            .find(|(k, _)| k == ACCESS_TOKEN_PARAM)
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty())
    })
}

/// Caller IP, honouring forwarding headers set by load balancers in front.
pub fn real_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    let real = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real {
        return Some(ip.to_string());
    }

    peer.map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_bearer_from_header_case_insensitive() {
        let url = Url::parse("http://localhost/users").unwrap();
        let h = headers(&[("authorization", "bEaReR token")]);
        assert_eq!(bearer_token(&h, &url).as_deref(), Some("token"));
    }

    #[test]
    fn test_bearer_ignores_other_schemes_and_empty() {
        let url = Url::parse("http://localhost/users").unwrap();
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic Zm9vOmJhcg==")]), &url), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "bearer")]), &url), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "bearer ")]), &url), None);
    }

    #[test]
    fn test_bearer_from_query() {
        let url = Url::parse("http://localhost/users?access_token=qs-token").unwrap();
        assert_eq!(bearer_token(&HeaderMap::new(), &url).as_deref(), Some("qs-token"));

        // header wins
        let h = headers(&[("authorization", "Bearer header-token")]);
        assert_eq!(bearer_token(&h, &url).as_deref(), Some("header-token"));
    }

    #[test]
    fn test_real_ip_precedence() {
        let peer: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(real_ip(&h, Some(peer)).as_deref(), Some("203.0.113.9"));

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(real_ip(&h, Some(peer)).as_deref(), Some("198.51.100.2"));

        assert_eq!(real_ip(&HeaderMap::new(), Some(peer)).as_deref(), Some("10.1.1.1"));
        assert_eq!(real_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_request_url_from_origin_form() {
        let uri: Uri = "/users/1234?x=1".parse().unwrap();
        let h = headers(&[("host", "mydomain.com"), ("x-forwarded-proto", "https")]);
        let url = request_url(&uri, &h).unwrap();
        assert_eq!(url.as_str(), "https://mydomain.com/users/1234?x=1");

        let req = InboundRequest::from_http(&Method::GET, &uri, &h, None).unwrap();
        assert_eq!(req.match_url(), "https://mydomain.com/users/1234");
    }

    #[test]
    fn test_match_url_keeps_port() {
        let uri: Uri = "/a".parse().unwrap();
        let h = headers(&[("host", "localhost:4455")]);
        let req = InboundRequest::from_http(&Method::GET, &uri, &h, None).unwrap();
        assert_eq!(req.match_url(), "http://localhost:4455/a");
    }

    #[test]
    fn test_match_url_keeps_default_port_as_sent() {
        let uri: Uri = "/users/1".parse().unwrap();
        let h = headers(&[("host", "MyDomain.com:80")]);
        let req = InboundRequest::from_http(&Method::GET, &uri, &h, None).unwrap();
        assert_eq!(req.match_url(), "http://mydomain.com:80/users/1");

        let h = headers(&[("host", "mydomain.com")]);
        let req = InboundRequest::from_http(&Method::GET, &uri, &h, None).unwrap();
        assert_eq!(req.match_url(), "http://mydomain.com/users/1");
    }

    #[test]
    fn test_raw_authority() {
        assert_eq!(
            raw_authority("https://mydomain.com:443/users").as_deref(),
            Some("mydomain.com:443")
        );
        assert_eq!(raw_authority("http://mydomain.com/users").as_deref(), Some("mydomain.com"));
        assert_eq!(raw_authority("not a url"), None);
    }

    #[test]
    fn test_invalid_host_header() {
        let uri: Uri = "/a".parse().unwrap();
        let h = headers(&[("host", "bad host")]);
        assert!(matches!(
            request_authority(&uri, &h),
            Err(AccessError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_request_url_without_host() {
        let uri: Uri = "/a".parse().unwrap();
        assert!(matches!(
            request_url(&uri, &HeaderMap::new()),
            Err(AccessError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_from_http() {
        let uri: Uri = "/users/1".parse().unwrap();
        let h = headers(&[("host", "localhost"), ("authorization", "Bearer abc")]);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let req = InboundRequest::from_http(&Method::GET, &uri, &h, Some(peer)).unwrap();
        assert_eq!(req.token.as_deref(), Some("abc"));
        assert_eq!(req.remote_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(req.match_url(), "http://localhost/users/1");
    }
}
