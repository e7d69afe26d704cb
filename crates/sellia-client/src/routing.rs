//! Path-routing table for a single HTTP tunnel: an ordered list of
//! pattern → local-target rules plus a fallback (`spec.md` §4.7's
//! client-side collaborator).

use serde::{Deserialize, Serialize};

/// One routing rule. `pattern` matches exactly, or, if it ends in `/*`,
/// matches any path sharing that prefix. Rules are evaluated in order;
/// the first match wins (no longest-prefix preference).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub target: String,
}

/// The table for one tunnel: its ordered rules plus an optional fallback
/// target used when nothing matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub fallback: Option<String>,
}

impl RouteTable {
    /// A table with no rules, forwarding everything to `target`.
    pub fn single_target(target: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            fallback: Some(target.into()),
        }
    }

    /// Resolves `path` to a local target, or `None` if nothing matched and
    /// there is no fallback (caller responds 502 "no route matched").
    pub fn resolve(&self, path: &str) -> Option<&str> {
        for rule in &self.rules {
            if let Some(prefix) = rule.pattern.strip_suffix("/*") {
                if path == prefix || path.starts_with(&format!("{prefix}/")) {
                    return Some(&rule.target);
                }
            } else if rule.pattern == path {
                return Some(&rule.target);
            }
        }
        self.fallback.as_deref()
    }
}
