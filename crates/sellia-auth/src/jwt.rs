//! JWT-based credential validation: the presented credential is a signed
//! token whose `sub` claim becomes the account id.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AuthError, AuthProvider};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject — becomes the account id on successful validation.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token decode failed: {0}")]
    Decode(#[from] jsonwebtoken::errors::Error),
    #[error("token expired at {0}")]
    Expired(i64),
}

pub struct JwtAuthProvider {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthProvider {
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.exp < Utc::now().timestamp() {
            return Err(JwtError::Expired(data.claims.exp));
        }
        Ok(data.claims)
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn validate(&self, credential: &str) -> Result<String, AuthError> {
        self.decode_claims(credential)
            .map(|claims| claims.sub)
            .map_err(|_| AuthError::Invalid)
    }
}
