//! Tunnel registry: owns the subdomain → [`Tunnel`] mapping and the naming
//! rules a subdomain must satisfy before it can be claimed.

use dashmap::DashMap;
use rand::Rng;
use regex_lite::Regex;
use sellia_proto::BasicAuthPair;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::trace;

use crate::reserved::ReservedSubdomainSource;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("valid regex"))
}

/// A live tunnel: subdomain, owning client, and optional basic-auth guard.
/// `spec.md` §3 invariant: at most one `Tunnel` per subdomain at any moment.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    pub subdomain: String,
    pub client_id: String,
    pub basic_auth: Option<BasicAuthPair>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of [`TunnelRegistry::validate`]. `Ok` carries the lowercased,
/// normalized name; `Err` carries a human-readable rejection reason.
pub type ValidationResult = Result<String, String>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subdomain {0:?} is already registered")]
    SubdomainTaken(String),
    #[error("no unique subdomain found after 1000 attempts")]
    Exhausted,
}

/// Subdomain → [`Tunnel`] table plus the by-id and by-client indexes needed
/// for O(1) lookups on every axis `spec.md` §4.3 names.
pub struct TunnelRegistry {
    by_subdomain: Arc<DashMap<String, Tunnel>>,
    by_id: Arc<DashMap<String, String>>,
    reserved: Arc<ReservedSubdomainSource>,
}

impl TunnelRegistry {
    pub fn new(reserved: Arc<ReservedSubdomainSource>) -> Self {
        Self {
            by_subdomain: Arc::new(DashMap::new()),
            by_id: Arc::new(DashMap::new()),
            reserved,
        }
    }

    /// Applies the five ordered rules from `spec.md` §4.3: length, hyphen
    /// placement, pattern, reserved-set membership, then availability. The
    /// first failing rule wins — later rules are not evaluated. Hyphen
    /// placement is checked ahead of the general charset pattern so a name
    /// like `-bad` is rejected for its hyphen, not reported as containing an
    /// invalid character.
    pub fn validate(&self, name: &str) -> ValidationResult {
        let normalized = name.to_ascii_lowercase();

        if normalized.len() < 3 || normalized.len() > 63 {
            return Err(format!(
                "subdomain must be between 3 and 63 characters, got {}",
                normalized.len()
            ));
        }
        if normalized.starts_with('-') || normalized.ends_with('-') {
            return Err("subdomain must not start or end with a hyphen".to_string());
        }
        if normalized.contains("--") {
            return Err("subdomain must not contain consecutive hyphens".to_string());
        }
        if !name_pattern().is_match(&normalized) {
            return Err(
                "subdomain must contain only lowercase letters, digits, and hyphens".to_string(),
            );
        }
        if self.reserved.contains(&normalized) {
            return Err(format!("{normalized:?} is a reserved subdomain"));
        }
        if self.by_subdomain.contains_key(&normalized) {
            return Err(format!("{normalized:?} is already registered"));
        }

        Ok(normalized)
    }

    /// Registers `tunnel` under its (already-validated) subdomain.
    /// Race-safe: uses `DashMap::entry` so the check-and-insert is atomic
    /// against a concurrent registration of the same subdomain.
    pub fn register(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;

        match self.by_subdomain.entry(tunnel.subdomain.clone()) {
            Entry::Occupied(_) => Err(RegistryError::SubdomainTaken(tunnel.subdomain)),
            Entry::Vacant(slot) => {
                self.by_id.insert(tunnel.id.clone(), tunnel.subdomain.clone());
                trace!(tunnel_id = %tunnel.id, subdomain = %tunnel.subdomain, "tunnel registered");
                slot.insert(tunnel);
                Ok(())
            }
        }
    }

    /// Removes a tunnel by id. Idempotent: removing an unknown id is not an
    /// error.
    pub fn unregister(&self, tunnel_id: &str) {
        if let Some((_, subdomain)) = self.by_id.remove(tunnel_id) {
            self.by_subdomain.remove(&subdomain);
            trace!(tunnel_id, subdomain, "tunnel unregistered");
        }
    }

    /// Removes every tunnel owned by `client_id`, returning the removed
    /// tunnels so the caller can fail their pending requests.
    pub fn unregister_client(&self, client_id: &str) -> Vec<Tunnel> {
        let ids: Vec<String> = self
            .by_subdomain
            .iter()
            .filter(|entry| entry.value().client_id == client_id)
            .map(|entry| entry.value().id.clone())
            .collect();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, subdomain)) = self.by_id.remove(&id) {
                if let Some((_, tunnel)) = self.by_subdomain.remove(&subdomain) {
                    removed.push(tunnel);
                }
            }
        }
        removed
    }

    /// Generates a random 8-hex-character subdomain guaranteed available at
    /// the moment of generation, retrying up to 1000 times before giving up.
    pub fn generate_unique(&self) -> Result<String, RegistryError> {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let candidate: String = (0..8)
                .map(|_| {
                    let digit = rng.gen_range(0..16u8);
                    std::char::from_digit(digit as u32, 16).expect("valid hex digit")
                })
                .collect();
            if !self.reserved.contains(&candidate) && !self.by_subdomain.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(RegistryError::Exhausted)
    }

    pub fn lookup_by_subdomain(&self, name: &str) -> Option<Tunnel> {
        self.by_subdomain
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Tunnel> {
        let subdomain = self.by_id.get(id)?;
        self.by_subdomain.get(subdomain.value()).map(|e| e.value().clone())
    }

    /// Re-reads the reserved-subdomain snapshot. `spec.md` §6's admin
    /// surface hook: does not retroactively evict an already-registered
    /// tunnel (see `DESIGN.md`'s Open Question notes), only affects
    /// `validate` calls made after this returns.
    pub fn refresh_reserved(&self) {
        self.reserved.refresh();
    }

    pub fn lookup_by_client(&self, client_id: &str) -> Vec<Tunnel> {
        self.by_subdomain
            .iter()
            .filter(|entry| entry.value().client_id == client_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_subdomain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subdomain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TunnelRegistry {
        TunnelRegistry::new(Arc::new(ReservedSubdomainSource::new()))
    }

    fn tunnel(id: &str, subdomain: &str, client_id: &str) -> Tunnel {
        Tunnel {
            id: id.to_string(),
            subdomain: subdomain.to_string(),
            client_id: client_id.to_string(),
            basic_auth: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn validate_rejects_too_short_and_too_long() {
        let reg = registry();
        assert!(reg.validate("ab").is_err());
        let long = "a".repeat(64);
        assert!(reg.validate(&long).is_err());
        assert!(reg.validate(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn validate_rejects_invalid_characters() {
        let reg = registry();
        assert!(reg.validate("has_underscore").is_err());
        assert!(reg.validate("has.dot").is_err());
        assert!(reg.validate("UPPER-OK-but-lowercased").is_ok());
    }

    #[test]
    fn validate_rejects_hyphen_placement() {
        let reg = registry();
        assert!(reg.validate("-leading").is_err());
        assert!(reg.validate("trailing-").is_err());
        assert!(reg.validate("double--hyphen").is_err());
        assert!(reg.validate("mid-hyphen-ok").is_ok());
    }

    #[test]
    fn validate_rejects_reserved_names() {
        let reg = registry();
        assert!(reg.validate("sellia").is_err());
        assert!(reg.validate("api").is_err());
    }

    #[test]
    fn validate_rejects_already_registered() {
        let reg = registry();
        reg.register(tunnel("t1", "acme", "client-1")).unwrap();
        assert!(reg.validate("acme").is_err());
    }

    #[test]
    fn validate_is_case_insensitive_and_normalizes() {
        let reg = registry();
        assert_eq!(reg.validate("ACME").unwrap(), "acme");
    }

    #[test]
    fn register_then_lookup_all_axes() {
        let reg = registry();
        reg.register(tunnel("t1", "acme", "client-1")).unwrap();

        assert!(reg.lookup_by_subdomain("acme").is_some());
        assert!(reg.lookup_by_id("t1").is_some());
        assert_eq!(reg.lookup_by_client("client-1").len(), 1);
    }

    #[test]
    fn register_duplicate_subdomain_fails() {
        let reg = registry();
        reg.register(tunnel("t1", "acme", "client-1")).unwrap();
        let err = reg.register(tunnel("t2", "acme", "client-2"));
        assert!(matches!(err, Err(RegistryError::SubdomainTaken(_))));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = registry();
        reg.register(tunnel("t1", "acme", "client-1")).unwrap();
        reg.unregister("t1");
        reg.unregister("t1");
        assert!(reg.lookup_by_id("t1").is_none());
        assert!(reg.lookup_by_subdomain("acme").is_none());
    }

    #[test]
    fn unregister_client_removes_all_owned_tunnels() {
        let reg = registry();
        reg.register(tunnel("t1", "acme", "client-1")).unwrap();
        reg.register(tunnel("t2", "beta", "client-1")).unwrap();
        reg.register(tunnel("t3", "gamma", "client-2")).unwrap();

        let removed = reg.unregister_client("client-1");
        assert_eq!(removed.len(), 2);
        assert!(reg.lookup_by_subdomain("acme").is_none());
        assert!(reg.lookup_by_subdomain("beta").is_none());
        assert!(reg.lookup_by_subdomain("gamma").is_some());
    }

    #[test]
    fn generate_unique_avoids_existing_and_reserved() {
        let reg = registry();
        let name = reg.generate_unique().unwrap();
        assert_eq!(name.len(), 8);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(reg.validate(&name).is_ok());
    }
}
