use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::Method;

use crate::access::errors::{AccessError, RuleError};
use crate::access::rule::{Rule, RuleSpec};
use crate::access::store::RuleStore;

/// An immutable, ordered snapshot of compiled rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Compile every spec; one bad rule rejects the whole set.
    pub fn compile(specs: Vec<RuleSpec>) -> Result<Self, RuleError> {
        let rules = specs
            .into_iter()
            .map(|spec| Rule::compile(spec).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// All rules matching `method` and the canonical `url`, in rule order.
    pub fn matches(&self, method: &Method, url: &str) -> Vec<Arc<Rule>> {
        self.rules
            .iter()
            .filter(|rule| rule.is_matching(method, url))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Holds the active rule set and swaps in fresh ones from the store.
///
/// Readers load one snapshot per call and keep matching against it even if a
/// refresh lands halfway through.
pub struct RuleMatcher {
    store: Arc<dyn RuleStore>,
    active: ArcSwap<RuleSet>,
}

impl RuleMatcher {
    /// Start with an empty rule set; nothing matches until the first refresh.
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            active: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.active.load_full()
    }

    /// Every rule matching the request. Errors when nothing matches.
    pub fn match_rules(&self, method: &Method, url: &str) -> Result<Vec<Arc<Rule>>, AccessError> {
        let matched = self.snapshot().matches(method, url);
        if matched.is_empty() {
            return Err(AccessError::NoMatchingRule);
        }
        Ok(matched)
    }

    /// The single rule responsible for the request.
    pub fn match_rule(&self, method: &Method, url: &str) -> Result<Arc<Rule>, AccessError> {
        let mut matched = self.match_rules(method, url)?;
        if matched.len() > 1 {
            return Err(AccessError::AmbiguousMatch(matched.len()));
        }
        Ok(matched.remove(0))
    }

    /// Fetch the full list from the store and replace the active set.
    /// On failure the previous set stays active. Returns the new rule count.
    pub async fn refresh(&self) -> Result<usize, RuleError> {
        let specs = self.store.list_rules().await?;
        let set = RuleSet::compile(specs)?;
        let count = set.len();
        self.active.store(Arc::new(set));
        tracing::debug!(rules = count, "Rule set swapped in");
        Ok(count)
    }
}
