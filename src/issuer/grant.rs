//! Grant requests accepted by the token endpoint.

use super::principal::UserId;

pub const PASSWORD: &str = "password";
pub const AUTHORIZATION_CODE: &str = "authorization_code";
pub const REFRESH_TOKEN: &str = "refresh_token";

/// Principal reference and properties stored with an authorization code or a
/// refresh token.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantContext {
    pub subject: UserId,
    pub scopes: Vec<String>,
    pub security_stamp: Option<String>,
}

/// One token request.
#[derive(Debug, Clone, PartialEq)]
pub enum GrantRequest {
    Password {
        username: String,
        password: String,
        scopes: Vec<String>,
    },
    AuthorizationCode(GrantContext),
    RefreshToken(GrantContext),
    Unsupported(String),
}

impl GrantRequest {
    /// Value of the `grant_type` parameter.
    pub fn grant_type(&self) -> &str {
        match self {
            Self::Password { .. } => PASSWORD,
            Self::AuthorizationCode(_) => AUTHORIZATION_CODE,
            Self::RefreshToken(_) => REFRESH_TOKEN,
            Self::Unsupported(grant_type) => grant_type,
        }
    }
}
