//! # Auth Module
//!
//! Token validation and topic membership. Both are backed by external
//! collaborators; this module only defines the seams and the default
//! implementations.

pub mod errors;
pub mod identity;
pub mod jwt;
pub mod membership;

pub use errors::{AuthError, AuthResult};
pub use identity::{IdentityProvider, JwtIdentityProvider};
pub use jwt::{JwtClaims, JwtConfig, JwtManager};
pub use membership::{InMemoryMembership, MembershipStore};
