use portcullis::access::rule::{RuleMatchSpec, RuleMode, RuleSpec};

/// Builder for rule specs used in tests
pub struct RuleBuilder {
    spec: RuleSpec,
}

impl RuleBuilder {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            spec: RuleSpec {
                id: id.to_string(),
                description: String::new(),
                matches: RuleMatchSpec {
                    methods: vec!["*".to_string()],
                    url: url.to_string(),
                },
                mode: RuleMode::Anonymous,
                required_action: String::new(),
                required_resource: String::new(),
                required_scopes: Vec::new(),
            },
        }
    }

    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.spec.matches.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn mode(mut self, mode: RuleMode) -> Self {
        self.spec.mode = mode;
        self
    }

    pub fn policy(mut self, action: &str, resource: &str, scopes: &[&str]) -> Self {
        self.spec.mode = RuleMode::Policy;
        self.spec.required_action = action.to_string();
        self.spec.required_resource = resource.to_string();
        self.spec.required_scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn build(self) -> RuleSpec {
        self.spec
    }
}
