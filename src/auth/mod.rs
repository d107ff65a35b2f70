//! Authentication primitives and HTTP authentication

pub mod middleware;
pub mod password;
pub mod token;
pub mod totp;

pub use middleware::{
    bearer_auth_middleware, extract_token, optional_auth_middleware, AuthContext, MaybeAuth,
};
pub use password::PasswordHasher;
pub use token::TokenGenerator;
