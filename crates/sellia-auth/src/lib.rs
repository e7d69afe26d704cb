//! Authentication for the sellia control channel.
//!
//! `spec.md` §6 describes the Auth Provider collaborator abstractly:
//! `validate(credential) -> {ok, account_id} | {err, reason}`, with master
//! credential and stored-hash implementations treated as equivalent. This
//! crate defines the [`AuthProvider`] trait and three implementations:
//! a direct-match master credential, an Argon2id-hashed account store, and a
//! JWT validator for deployments that issue signed tokens per account.

pub mod jwt;
pub mod password;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub use jwt::{JwtAuthProvider, JwtClaims, JwtError};
pub use password::{hash_password, verify_password, PasswordError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    Invalid,
    #[error("auth timed out waiting for credential")]
    Timeout,
}

/// Validates a client-presented credential, returning an opaque account id
/// on success. Implementations are injected collaborators (per `spec.md`
/// §9's "no process-wide singletons" rule) — the gateway holds one
/// `Arc<dyn AuthProvider>` and never constructs providers itself.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<String, AuthError>;
}

/// Matches a single configured credential directly, per `spec.md` §6's
/// `master_credential` config option. All callers presenting the right
/// credential share one account id.
pub struct MasterCredentialAuth {
    credential: String,
    account_id: String,
}

impl MasterCredentialAuth {
    pub fn new(credential: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            account_id: account_id.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for MasterCredentialAuth {
    async fn validate(&self, credential: &str) -> Result<String, AuthError> {
        // Constant-time-ish comparison is unnecessary here: the master
        // credential path is a single shared secret, not a per-user secret
        // where timing could leak which account exists.
        if credential == self.credential {
            Ok(self.account_id.clone())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// Validates credentials of the form `account_id:token` against a map of
/// account id to Argon2id password hash.
pub struct HashedCredentialAuth {
    accounts: HashMap<String, String>,
}

impl HashedCredentialAuth {
    pub fn new(accounts: HashMap<String, String>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl AuthProvider for HashedCredentialAuth {
    async fn validate(&self, credential: &str) -> Result<String, AuthError> {
        let (account_id, token) = credential.split_once(':').ok_or(AuthError::Invalid)?;
        let hash = self.accounts.get(account_id).ok_or(AuthError::Invalid)?;
        match password::verify_password(token, hash) {
            Ok(true) => Ok(account_id.to_string()),
            Ok(false) => Err(AuthError::Invalid),
            Err(_) => Err(AuthError::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_credential_matches_exactly() {
        let auth = MasterCredentialAuth::new("super-secret", "acct-solo");
        assert_eq!(
            auth.validate("super-secret").await.unwrap(),
            "acct-solo"
        );
        assert_eq!(auth.validate("wrong").await, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn hashed_credential_checks_account_then_hash() {
        let hash = password::hash_password("hunter2").unwrap();
        let mut accounts = HashMap::new();
        accounts.insert("alice".to_string(), hash);
        let auth = HashedCredentialAuth::new(accounts);

        assert_eq!(auth.validate("alice:hunter2").await.unwrap(), "alice");
        assert_eq!(
            auth.validate("alice:wrong-password").await,
            Err(AuthError::Invalid)
        );
        assert_eq!(auth.validate("bob:hunter2").await, Err(AuthError::Invalid));
        assert_eq!(auth.validate("no-colon-here").await, Err(AuthError::Invalid));
    }
}
