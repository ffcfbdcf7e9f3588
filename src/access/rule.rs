use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::access::errors::RuleError;

/// How a matched request is authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Anonymous access, a bearer token is introspected when present.
    Public,
    /// Anonymous access, tokens are ignored.
    Anonymous,
    /// Authentication and authorization are skipped entirely.
    Bypass,
    /// A valid token and an explicit allow from the policy service are required.
    Policy,
}

/// HTTP methods a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    Any,
    Only(Vec<String>),
}

impl MethodSet {
    pub fn from_list(methods: &[String]) -> Self {
        if methods.iter().any(|m| m.trim() == "*") {
            return MethodSet::Any;
        }
        MethodSet::Only(
            methods
                .iter()
                .map(|m| m.trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        )
    }

    pub fn contains(&self, method: &Method) -> bool {
        match self {
            MethodSet::Any => true,
            MethodSet::Only(list) => list
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str())),
        }
    }
}

// ---------- Wire form ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatchSpec {
    #[serde(default)]
    pub methods: Vec<String>,
    /// Regular expression over `scheme://host/path`
    pub url: String,
}

/// A rule as it is stored and exchanged (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "match")]
    pub matches: RuleMatchSpec,
    pub mode: RuleMode,
    #[serde(default)]
    pub required_action: String,
    #[serde(default)]
    pub required_resource: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
}

// ---------- Compiled form ----------

/// A compiled rule. Immutable once built; rule sets are replaced wholesale.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub description: String,
    pub methods: MethodSet,
    pub url_pattern: Regex,
    pub mode: RuleMode,
    pub required_action: String,
    pub required_resource: String,
    pub required_scopes: Vec<String>,
}

impl Rule {
    pub fn compile(spec: RuleSpec) -> Result<Self, RuleError> {
        if spec.id.trim().is_empty() {
            return Err(RuleError::InvalidRule {
                id: spec.id,
                reason: "rule id must not be empty".into(),
            });
        }

        if spec.mode == RuleMode::Policy
            && (spec.required_action.is_empty() || spec.required_resource.is_empty())
        {
            return Err(RuleError::InvalidRule {
                id: spec.id,
                reason: "policy rules need `required_action` and `required_resource`".into(),
            });
        }

        let url_pattern =
            Regex::new(&spec.matches.url).map_err(|source| RuleError::InvalidPattern {
                id: spec.id.clone(),
                source,
            })?;

        Ok(Self {
            methods: MethodSet::from_list(&spec.matches.methods),
            url_pattern,
            id: spec.id,
            description: spec.description,
            mode: spec.mode,
            required_action: spec.required_action,
            required_resource: spec.required_resource,
            required_scopes: spec.required_scopes,
        })
    }

    /// Both the method and the canonical URL must match.
    pub fn is_matching(&self, method: &Method, url: &str) -> bool {
        self.methods.contains(method) && self.url_pattern.is_match(url)
    }

    /// Substitute the capture groups of `url` into `template`.
    pub fn expand(&self, template: &str, url: &str) -> String {
        match self.url_pattern.captures(url) {
            Some(caps) => {
                let groups: Vec<Option<&str>> =
                    caps.iter().map(|g| g.map(|m| m.as_str())).collect();
                expand_template(template, &groups)
            }
            None => expand_template(template, &[]),
        }
    }
}

/// Expand positional placeholders: `$N` and `${N}` are capture group N
/// (`$0` is the whole match), `$$` is a literal dollar sign. Groups that do not
/// exist or did not participate expand to nothing.
pub fn expand_template(template: &str, groups: &[Option<&str>]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                let rest = &template[start + 1..];
                match rest.find('}') {
                    Some(end) if end > 0 && rest[..end].bytes().all(|b| b.is_ascii_digit()) => {
                        push_group(&mut out, groups, &rest[..end]);
                        // consume `{digits}`
                        for _ in 0..=end + 1 {
                            chars.next();
                        }
                    }
                    _ => out.push('$'),
                }
            }
            Some((start, d)) if d.is_ascii_digit() => {
                let digits: String = template[start..]
                    .chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                for _ in 0..digits.len() {
                    chars.next();
                }
                push_group(&mut out, groups, &digits);
            }
            _ => out.push('$'),
        }
    }

    out
}

fn push_group(out: &mut String, groups: &[Option<&str>], index: &str) {
    if let Some(Some(value)) = index.parse::<usize>().ok().and_then(|i| groups.get(i)) {
        out.push_str(value);
    }
}
