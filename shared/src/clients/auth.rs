//! Caller-identity resolution. The core only needs to turn a bearer token
//! into a user id before the pipeline runs.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: i64,
    pub email: String,
}

pub trait TokenVerifier: Send + Sync {
    fn validate_token(&self, token: &str) -> Result<TokenIdentity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    email: String,
    exp: usize,
}

/// HS256 verifier for tokens issued by the user service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn validate_token(&self, token: &str) -> Result<TokenIdentity> {
        let data =
            decode::<Claims>(token, &self.key, &self.validation).map_err(|_| Error::PermissionDenied)?;
        Ok(TokenIdentity {
            user_id: data.claims.sub,
            email: data.claims.email,
        })
    }
}
