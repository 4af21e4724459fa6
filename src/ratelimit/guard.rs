//! Rule evaluation for handler invocations.
//!
//! The calling layer supplies the handler identity and a [`RequestContext`];
//! the guard resolves each rule's key and checks the rules in declaration
//! order, stopping at the first violation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::limiter::Limiter;
use super::rules::{KeyStrategy, RateLimitRule, RuleTable};
use crate::error::{Result, WardenError};

/// Request facts used to derive rate limit keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Client IP address as seen by the calling layer
    pub client_ip: String,
    /// Session identifier
    pub session_id: String,
    /// Authenticated user identifier, if any
    pub user_id: Option<String>,
}

impl RequestContext {
    /// Context for an anonymous request.
    pub fn new(client_ip: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            session_id: session_id.into(),
            user_id: None,
        }
    }

    /// Attach an authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Derives a key from the request for `KeyStrategy::Custom` rules.
pub type KeyResolver = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Enforces a [`RuleTable`] through a [`Limiter`].
pub struct RuleGuard {
    limiter: Arc<Limiter>,
    rules: RuleTable,
    resolvers: HashMap<String, KeyResolver>,
}

impl fmt::Debug for RuleGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleGuard")
            .field("limiter", &self.limiter)
            .field("rules", &self.rules)
            .field("resolvers", &self.resolvers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RuleGuard {
    /// Create a guard enforcing `rules` with `limiter`.
    pub fn new(limiter: Arc<Limiter>, rules: RuleTable) -> Self {
        Self {
            limiter,
            rules,
            resolvers: HashMap::new(),
        }
    }

    /// Register the resolver used by `fn:<name>` rules.
    pub fn with_resolver(mut self, name: impl Into<String>, resolver: KeyResolver) -> Self {
        self.resolvers.insert(name.into(), resolver);
        self
    }

    /// The limiter this guard checks through.
    pub fn limiter(&self) -> &Arc<Limiter> {
        &self.limiter
    }

    /// Check every rule registered for `handler`.
    ///
    /// Rules run in declaration order; the first violation is returned and
    /// later rules are not counted.
    pub async fn enforce(&self, handler: &str, ctx: &RequestContext) -> Result<()> {
        self.enforce_rules(handler, self.rules.rules_for(handler), ctx)
            .await
    }

    /// Check an explicit rule list as if registered for `handler`.
    pub async fn enforce_rules(
        &self,
        handler: &str,
        rules: &[RateLimitRule],
        ctx: &RequestContext,
    ) -> Result<()> {
        for rule in rules {
            let Some(key) = self.resolve_key(handler, rule, ctx)? else {
                trace!(handler = %handler, ip = %ctx.client_ip, "Whitelisted IP skips rule");
                continue;
            };

            self.limiter
                .check(&key, rule.limit, rule.ttl, &rule.message, rule.kind.as_ref())
                .await
                .map_err(|e| {
                    if e.is_rate_limited() {
                        debug!(handler = %handler, key = %key, limit = rule.limit, "Handler rule violated");
                    }
                    e
                })?;
        }
        Ok(())
    }

    /// Resolve the logical key for one rule; `None` means the rule is skipped.
    pub fn resolve_key(
        &self,
        handler: &str,
        rule: &RateLimitRule,
        ctx: &RequestContext,
    ) -> Result<Option<String>> {
        let key = match &rule.key {
            KeyStrategy::Ip => {
                if self.limiter.is_ip_whitelisted(&ctx.client_ip) {
                    return Ok(None);
                }
                format!("{}-ip-{}", handler, ctx.client_ip)
            }
            KeyStrategy::Uid => {
                let uid = ctx.user_id.as_deref().unwrap_or(ctx.session_id.as_str());
                format!("{}-uid-{}", handler, uid)
            }
            KeyStrategy::Sid => format!("{}-sid-{}", handler, ctx.session_id),
            KeyStrategy::Custom(name) => {
                let resolver = self.resolvers.get(name).ok_or_else(|| {
                    WardenError::Config(format!(
                        "no key resolver registered as {name} for handler {handler}"
                    ))
                })?;
                resolver(ctx)
            }
            KeyStrategy::Literal(key) => key.clone(),
        };
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::memory::MemoryStore;
    use crate::ratelimit::whitelist::IpWhitelist;
    use crate::ratelimit::ViolationKind;

    fn guard_with(rules: RuleTable, whitelist: &[&str]) -> (RuleGuard, Arc<MemoryStore>) {
        let clock = ManualClock::at_secs(1_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock)));
        let limiter = Limiter::new(store.clone()).with_whitelist(IpWhitelist::new(whitelist));
        (RuleGuard::new(Arc::new(limiter), rules), store)
    }

    fn table(handler: &str, rules: Vec<RateLimitRule>) -> RuleTable {
        let mut table = RuleTable::new();
        table.register(handler, rules).unwrap();
        table
    }

    #[tokio::test]
    async fn test_ip_rule_counts_per_ip() {
        let (guard, store) = guard_with(table("login", vec![RateLimitRule::new(1, 60)]), &[]);
        let ctx = RequestContext::new("1.2.3.4", "s1");

        guard.enforce("login", &ctx).await.unwrap();
        let err = guard.enforce("login", &ctx).await.unwrap_err();
        assert_eq!(err.code(), Some(429));
        assert_eq!(store.count("limiter-login-ip-1.2.3.4"), 2);

        let other = RequestContext::new("5.6.7.8", "s2");
        guard.enforce("login", &other).await.unwrap();
    }

    #[tokio::test]
    async fn test_whitelisted_ip_is_never_counted() {
        let (guard, store) = guard_with(
            table("login", vec![RateLimitRule::new(1, 60)]),
            &["10.0.0.*"],
        );
        let ctx = RequestContext::new("10.0.0.9", "s1");

        for _ in 0..5 {
            guard.enforce("login", &ctx).await.unwrap();
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_uid_falls_back_to_session() {
        let rules = vec![RateLimitRule::new(5, 60).keyed_by(KeyStrategy::Uid)];
        let (guard, store) = guard_with(table("feed", rules), &[]);

        guard
            .enforce("feed", &RequestContext::new("1.1.1.1", "sess").with_user("42"))
            .await
            .unwrap();
        guard
            .enforce("feed", &RequestContext::new("1.1.1.1", "sess"))
            .await
            .unwrap();

        assert_eq!(store.count("limiter-feed-uid-42"), 1);
        assert_eq!(store.count("limiter-feed-uid-sess"), 1);
    }

    #[tokio::test]
    async fn test_sid_custom_and_literal_keys() {
        let rules = vec![
            RateLimitRule::new(5, 60).keyed_by(KeyStrategy::Sid),
            RateLimitRule::new(5, 60).keyed_by(KeyStrategy::Custom("tenant".to_string())),
            RateLimitRule::new(5, 60).keyed_by(KeyStrategy::Literal("global".to_string())),
        ];
        let (guard, store) = guard_with(table("upload", rules), &[]);
        let guard = guard.with_resolver(
            "tenant",
            Arc::new(|ctx: &RequestContext| format!("tenant-{}", ctx.client_ip)),
        );

        guard
            .enforce("upload", &RequestContext::new("9.9.9.9", "abc"))
            .await
            .unwrap();

        assert_eq!(store.count("limiter-upload-sid-abc"), 1);
        assert_eq!(store.count("limiter-tenant-9.9.9.9"), 1);
        assert_eq!(store.count("limiter-global"), 1);
    }

    #[tokio::test]
    async fn test_first_violation_stops_evaluation() {
        let rules = vec![
            RateLimitRule::new(1, 60)
                .keyed_by(KeyStrategy::Sid)
                .with_message("first")
                .with_kind(ViolationKind::QuotaExhausted),
            RateLimitRule::new(10, 60).keyed_by(KeyStrategy::Literal("second".to_string())),
        ];
        let (guard, store) = guard_with(table("h", rules), &[]);
        let ctx = RequestContext::new("1.1.1.1", "s");

        guard.enforce("h", &ctx).await.unwrap();
        let err = guard.enforce("h", &ctx).await.unwrap_err();

        assert!(matches!(
            err,
            WardenError::RateLimitExceeded { kind: ViolationKind::QuotaExhausted, ref message, .. }
                if message == "first"
        ));
        assert_eq!(store.count("limiter-second"), 1);
    }

    #[tokio::test]
    async fn test_unregistered_handler_passes() {
        let (guard, store) = guard_with(RuleTable::new(), &[]);
        guard
            .enforce("unknown", &RequestContext::new("1.1.1.1", "s"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_resolver_is_config_error() {
        let rules = vec![RateLimitRule::new(1, 60).keyed_by(KeyStrategy::Custom("nope".to_string()))];
        let (guard, _store) = guard_with(table("h", rules), &[]);

        let err = guard
            .enforce("h", &RequestContext::new("1.1.1.1", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[tokio::test]
    async fn test_rules_loaded_from_yaml_are_enforced() {
        let yaml = r#"
handlers:
  search:
    - limit: 2
      ttl: 10
      key: sid
      message: Search is rate limited
"#;
        let (guard, _store) = guard_with(RuleTable::from_yaml(yaml).unwrap(), &[]);
        let ctx = RequestContext::new("1.1.1.1", "s");

        guard.enforce("search", &ctx).await.unwrap();
        guard.enforce("search", &ctx).await.unwrap();
        let err = guard.enforce("search", &ctx).await.unwrap_err();
        assert_eq!(err.to_string(), "Search is rate limited");
    }
}
