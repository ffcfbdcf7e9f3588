//! The access decision core: rules, matching, evaluation and the proxy
//! Director/Transport pair.

pub mod credentials;
pub mod director;
pub mod errors;
pub mod evaluator;
pub mod judge;
pub mod matcher;
pub mod policy;
pub mod request;
pub mod rule;
pub mod session;
pub mod store;

pub use errors::{AccessError, RuleError};
pub use matcher::{RuleMatcher, RuleSet};
pub use rule::{Rule, RuleMode, RuleSpec};
