//! Rate limit rules and the handler rule table.
//!
//! Handlers register their rules under a stable identity; the guard looks them
//! up by that identity at request time. Rule tables can be built in code or
//! loaded from YAML:
//!
//! ```yaml
//! handlers:
//!   login:
//!     - limit: 5
//!       ttl: 60
//!       key: ip
//!       message: Too many login attempts
//!     - limit: 100
//!       ttl: 3600
//!       key: uid
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::limiter::ViolationKind;
use crate::error::{Result, WardenError};

/// Message used when a rule does not configure one.
pub const DEFAULT_MESSAGE: &str = "Too Many Requests";

/// How a rule derives its logical counter key from the request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyStrategy {
    /// Client IP address; whitelisted IPs are never counted.
    #[default]
    Ip,
    /// Authenticated user id, falling back to the session id.
    Uid,
    /// Session id.
    Sid,
    /// A resolver registered on the rule table under this name (`fn:<name>`).
    Custom(String),
    /// A fixed key shared by every request.
    Literal(String),
}

impl From<String> for KeyStrategy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ip" => KeyStrategy::Ip,
            "uid" => KeyStrategy::Uid,
            "sid" => KeyStrategy::Sid,
            _ => match value.strip_prefix("fn:") {
                Some(name) => KeyStrategy::Custom(name.to_string()),
                None => KeyStrategy::Literal(value),
            },
        }
    }
}

impl From<KeyStrategy> for String {
    fn from(strategy: KeyStrategy) -> Self {
        strategy.to_string()
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => write!(f, "ip"),
            KeyStrategy::Uid => write!(f, "uid"),
            KeyStrategy::Sid => write!(f, "sid"),
            KeyStrategy::Custom(name) => write!(f, "fn:{}", name),
            KeyStrategy::Literal(key) => write!(f, "{}", key),
        }
    }
}

/// One limit applied to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Maximum hits allowed within one window
    pub limit: u64,
    /// Window length in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    /// Key derivation strategy
    #[serde(default)]
    pub key: KeyStrategy,
    /// Message carried by the violation
    #[serde(default = "default_message")]
    pub message: String,
    /// Violation kind; the limiter's default when unset
    #[serde(default)]
    pub kind: Option<ViolationKind>,
}

fn default_ttl() -> u64 {
    1
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

impl RateLimitRule {
    /// A rule allowing `limit` hits per `ttl` seconds, keyed by client IP.
    pub fn new(limit: u64, ttl: u64) -> Self {
        Self {
            limit,
            ttl,
            key: KeyStrategy::default(),
            message: default_message(),
            kind: None,
        }
    }

    /// Use a different key strategy.
    pub fn keyed_by(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    /// Use a different violation message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Use a specific violation kind.
    pub fn with_kind(mut self, kind: ViolationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn validate(&self, handler: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(WardenError::InvalidArgument(format!(
                "rule for handler {handler} has a zero limit"
            )));
        }
        if self.ttl == 0 {
            return Err(WardenError::InvalidArgument(format!(
                "rule for handler {handler} has a zero ttl"
            )));
        }
        Ok(())
    }
}

/// Rules per handler identity, in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(default)]
    handlers: HashMap<String, Vec<RateLimitRule>>,
}

impl RuleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rules of a handler, replacing any previous registration.
    pub fn register(
        &mut self,
        handler: impl Into<String>,
        rules: Vec<RateLimitRule>,
    ) -> Result<()> {
        let handler = handler.into();
        if handler.is_empty() {
            return Err(WardenError::InvalidArgument(
                "handler identity must not be empty".to_string(),
            ));
        }
        for rule in &rules {
            rule.validate(&handler)?;
        }
        self.handlers.insert(handler, rules);
        Ok(())
    }

    /// Rules of a handler; empty when it has none.
    pub fn rules_for(&self, handler: &str) -> &[RateLimitRule] {
        self.handlers
            .get(handler)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of handlers with registered rules.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler has rules.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Load a rule table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a rule table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: RuleTable = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        for (handler, rules) in &table.handlers {
            for rule in rules {
                rule.validate(handler)?;
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules_with_defaults() {
        let yaml = r#"
handlers:
  login:
    - limit: 5
"#;
        let table = RuleTable::from_yaml(yaml).unwrap();
        let rules = table.rules_for("login");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0], RateLimitRule::new(5, 1));
        assert_eq!(rules[0].message, DEFAULT_MESSAGE);
        assert_eq!(rules[0].key, KeyStrategy::Ip);
        assert_eq!(KeyStrategy::default(), KeyStrategy::Ip);
    }

    #[test]
    fn test_parse_rules_preserves_order_and_strategies() {
        let yaml = r#"
handlers:
  upload:
    - limit: 10
      ttl: 60
      key: uid
      message: Slow down
      kind: quota_exhausted
    - limit: 2
      ttl: 1
      key: sid
    - limit: 100
      ttl: 60
      key: fn:tenant
    - limit: 1000
      ttl: 3600
      key: global-uploads
"#;
        let table = RuleTable::from_yaml(yaml).unwrap();
        let rules = table.rules_for("upload");

        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].key, KeyStrategy::Uid);
        assert_eq!(rules[0].message, "Slow down");
        assert_eq!(rules[0].kind, Some(ViolationKind::QuotaExhausted));
        assert_eq!(rules[1].key, KeyStrategy::Sid);
        assert_eq!(rules[2].key, KeyStrategy::Custom("tenant".to_string()));
        assert_eq!(
            rules[3].key,
            KeyStrategy::Literal("global-uploads".to_string())
        );
    }

    #[test]
    fn test_unknown_handler_has_no_rules() {
        let table = RuleTable::new();
        assert!(table.rules_for("anything").is_empty());
    }

    #[test]
    fn test_register_rejects_zero_limit_or_ttl() {
        let mut table = RuleTable::new();
        assert!(table.register("h", vec![RateLimitRule::new(0, 60)]).is_err());
        assert!(table.register("h", vec![RateLimitRule::new(5, 0)]).is_err());
        assert!(table.register("", vec![RateLimitRule::new(5, 60)]).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_yaml_with_zero_ttl_is_rejected() {
        let yaml = r#"
handlers:
  bad:
    - limit: 5
      ttl: 0
"#;
        assert!(RuleTable::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_key_strategy_round_trips_through_strings() {
        for raw in ["ip", "uid", "sid", "fn:tenant", "shared"] {
            let strategy = KeyStrategy::from(raw.to_string());
            assert_eq!(strategy.to_string(), raw);
        }
    }

    #[test]
    fn test_builder_helpers() {
        let rule = RateLimitRule::new(3, 10)
            .keyed_by(KeyStrategy::Sid)
            .with_message("nope")
            .with_kind(ViolationKind::QuotaExhausted);

        assert_eq!(rule.key, KeyStrategy::Sid);
        assert_eq!(rule.message, "nope");
        assert_eq!(rule.kind, Some(ViolationKind::QuotaExhausted));
    }
}
