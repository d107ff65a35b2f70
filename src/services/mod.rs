//! Business logic services layer

pub mod audit_chain;
pub mod audit_service;
pub mod lockout;
pub mod mfa;
pub mod session_cache;
pub mod token_authority;

pub use audit_service::AuditService;
pub use lockout::{LockoutGuard, LockoutStatus};
pub use mfa::{MfaChallenge, MfaChallengeManager};
pub use session_cache::SessionCache;
pub use token_authority::{AuthorityDeps, TokenAuthority};
