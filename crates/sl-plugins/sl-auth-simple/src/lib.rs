//! # sl-auth-simple
//!
//! Argon2-based implementation of `OperatorAuth`.
//! Operators present a shared key in the `X-Operator-Key` header; only its
//! PHC-format hash is ever configured.

use argon2::{
    password_hash::{PasswordHash, PasswordVerifier},
    Argon2,
};
use async_trait::async_trait;
use sl_core::traits::OperatorAuth;
use tracing::warn;

#[derive(Debug, Default, Clone)]
pub struct SimpleOperatorAuth;

impl SimpleOperatorAuth {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OperatorAuth for SimpleOperatorAuth {
    /// Verifies a presented key against a stored Argon2 hash.
    /// An unparseable hash rejects every key.
    async fn verify_operator_key(&self, key: &str, hash: &str) -> bool {
        let parsed_hash = match PasswordHash::new(hash) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "operator key hash is not a valid PHC string");
                return false;
            }
        };
        Argon2::default()
            .verify_password(key.as_bytes(), &parsed_hash)
            .is_ok()
    }
}
