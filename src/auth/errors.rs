//! # Auth Errors
//!
//! Error types for the authentication module.

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication and authorization errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    // ==================
    // JWT Errors
    // ==================
    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    /// Issuer or audience did not match
    #[error("Token not issued for this service")]
    WrongAudience,

    /// No credential was presented
    #[error("Authentication required")]
    AuthenticationRequired,

    // ==================
    // Membership Errors
    // ==================
    /// Not a member of the requested topic
    #[error("Not authorized to access this resource")]
    Unauthorized,

    /// The membership backend failed
    #[error("Membership lookup failed: {0}")]
    MembershipUnavailable(String),

    // ==================
    // Internal Errors
    // ==================
    /// Token generation failed
    #[error("Internal error: token generation failed")]
    TokenGenerationFailed,
}

impl AuthError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::MalformedToken => 400,

            AuthError::TokenExpired
            | AuthError::InvalidSignature
            | AuthError::WrongAudience
            | AuthError::AuthenticationRequired => 401,

            AuthError::Unauthorized => 403,

            AuthError::MembershipUnavailable(_) => 503,
            AuthError::TokenGenerationFailed => 500,
        }
    }

    /// Returns whether this error should be logged at warn level
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}
