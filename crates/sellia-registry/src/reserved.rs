//! Reserved-Subdomain Source: a read-mostly set of names the registry will
//! never hand out, refreshable atomically without blocking concurrent
//! readers mid-swap.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Names seeded at startup and marked `default = true`; these cannot be
/// removed through the management interface, only added to.
const DEFAULT_RESERVED: &[&str] = &[
    "api", "www", "admin", "mail", "smtp", "imap", "pop", "ssh", "cdn", "auth", "login", "oauth",
    "billing", "payments", "docs", "blog", "status", "health", "metrics", "monitor", "ws", "wss",
    "git", "svn", "root", "system", "server", "sellia", "tunnel", "proxy", "gateway", "app",
    "static", "assets", "media", "files", "download", "upload", "ftp", "dns", "ns1", "ns2", "mx",
    "vpn", "support", "help", "about", "legal", "security", "dashboard", "console",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReservedSourceError {
    #[error("{0:?} is a default reserved name and cannot be removed")]
    CannotRemoveDefault(String),
}

#[derive(Debug, Clone)]
struct Entry {
    /// True for names seeded by [`DEFAULT_RESERVED`]; protected from removal
    /// per `spec.md` §6's management interface contract.
    is_default: bool,
    #[allow(dead_code)]
    reason: Option<String>,
}

/// Holds the current reserved-name map behind an [`ArcSwap`] so `snapshot`
/// never blocks on a concurrent `refresh`.
pub struct ReservedSubdomainSource {
    current: ArcSwap<HashMap<String, Entry>>,
}

impl ReservedSubdomainSource {
    /// Seed with the default ~50-entry set described in `spec.md` §4.2.
    pub fn new() -> Self {
        let mut map = HashMap::new();
        for name in DEFAULT_RESERVED {
            map.insert(
                name.to_string(),
                Entry {
                    is_default: true,
                    reason: None,
                },
            );
        }
        Self {
            current: ArcSwap::from_pointee(map),
        }
    }

    /// Immutable snapshot of all currently-reserved lowercase names.
    pub fn snapshot(&self) -> Vec<String> {
        self.current.load().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.current.load().contains_key(&name.to_ascii_lowercase())
    }

    /// Add `name` to the reserved set with an optional human-readable
    /// reason, then atomically swap it in. Administrator-added entries are
    /// not `default` and can later be removed.
    pub fn add(&self, name: &str, reason: Option<String>) {
        let name = name.to_ascii_lowercase();
        let mut next = (**self.current.load()).clone();
        next.insert(name, Entry {
            is_default: false,
            reason,
        });
        self.current.store(Arc::new(next));
    }

    /// Remove `name` from the reserved set. Fails if `name` was part of the
    /// default seeded set.
    pub fn remove(&self, name: &str) -> Result<(), ReservedSourceError> {
        let name = name.to_ascii_lowercase();
        let current = self.current.load();
        match current.get(&name) {
            None => Ok(()),
            Some(entry) if entry.is_default => {
                Err(ReservedSourceError::CannotRemoveDefault(name))
            }
            Some(_) => {
                let mut next = (**current).clone();
                next.remove(&name);
                self.current.store(Arc::new(next));
                Ok(())
            }
        }
    }

    /// Atomically replace the snapshot with a fresh copy of itself; exists
    /// as the explicit refresh hook the registry's `refresh_reserved` calls
    /// after `add`/`remove`, per the `snapshot()`/`refresh()` contract in
    /// `spec.md` §4.2. `add`/`remove` already swap atomically, so this is a
    /// no-op retained for interface parity with callers that only hold a
    /// reference to the source and want to force re-reading a snapshot.
    pub fn refresh(&self) {
        let current = self.current.load();
        self.current.store(Arc::new((**current).clone()));
    }
}

impl Default for ReservedSubdomainSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_default_set_including_self_reservation() {
        let source = ReservedSubdomainSource::new();
        assert!(source.contains("sellia"));
        assert!(source.contains("api"));
        assert!(source.contains("ADMIN"));
        assert!(!source.contains("acme"));
    }

    #[test]
    fn add_then_contains() {
        let source = ReservedSubdomainSource::new();
        source.add("acme", Some("customer request".to_string()));
        assert!(source.contains("acme"));
    }

    #[test]
    fn remove_non_default_entry_succeeds() {
        let source = ReservedSubdomainSource::new();
        source.add("acme", None);
        assert!(source.remove("acme").is_ok());
        assert!(!source.contains("acme"));
    }

    #[test]
    fn remove_default_entry_fails() {
        let source = ReservedSubdomainSource::new();
        let result = source.remove("api");
        assert_eq!(
            result,
            Err(ReservedSourceError::CannotRemoveDefault("api".to_string()))
        );
        assert!(source.contains("api"));
    }

    #[test]
    fn remove_unknown_entry_is_a_noop_ok() {
        let source = ReservedSubdomainSource::new();
        assert!(source.remove("never-added").is_ok());
    }

    #[test]
    fn snapshot_is_stable_until_next_mutation() {
        let source = ReservedSubdomainSource::new();
        let before = source.snapshot().len();
        source.add("acme", None);
        let after = source.snapshot().len();
        assert_eq!(after, before + 1);
    }
}
