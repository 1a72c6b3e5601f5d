//! # Identity
//!
//! Resolves a presented credential to a user id.

use async_trait::async_trait;
use uuid::Uuid;

use super::errors::{AuthError, AuthResult};
use super::jwt::JwtManager;

/// Source of authenticated identities
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// User behind `credential`, or an error if it is not valid
    async fn current_identity(&self, credential: &str) -> AuthResult<Uuid>;
}

/// Validates HS256 bearer tokens
#[derive(Debug, Clone)]
pub struct JwtIdentityProvider {
    manager: JwtManager,
}

impl JwtIdentityProvider {
    pub fn new(manager: JwtManager) -> Self {
        Self { manager }
    }

    /// Underlying token manager
    pub fn manager(&self) -> &JwtManager {
        &self.manager
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn current_identity(&self, credential: &str) -> AuthResult<Uuid> {
        let token = credential
            .strip_prefix("Bearer ")
            .unwrap_or(credential)
            .trim();
        if token.is_empty() {
            return Err(AuthError::AuthenticationRequired);
        }

        let claims = self.manager.validate_token(token)?;
        JwtManager::get_user_id(&claims)
    }
}
