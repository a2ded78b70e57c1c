//! These traits define what the issuer needs from the outside world.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::issuer::{Claim, GrantContext, Principal, UserId};

/// Outcome of a password check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInResult {
    Succeeded,
    Failed,
    LockedOut,
    NotAllowed,
}

impl SignInResult {
    pub fn succeeded(self) -> bool {
        self == Self::Succeeded
    }
}

/// Port for credential checks.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Find a principal by its username.
    async fn find_by_name(&self, username: &str) -> Result<Option<Principal>>;

    /// Check a password, counting failures towards lockout when asked.
    async fn check_password_sign_in(
        &self,
        principal: &Principal,
        password: &str,
        lockout_on_failure: bool,
    ) -> Result<SignInResult>;

    /// Spend the work of a password check when no account matched, so both
    /// outcomes take the same time.
    async fn reject_unknown(&self, password: &str) -> Result<()>;

    /// Whether the account is still allowed to sign in (not disabled, not
    /// locked out).
    async fn can_sign_in(&self, principal: &Principal) -> Result<bool>;
}

/// Port for principal lookups.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    /// Find a principal by its stable identifier.
    async fn find_by_id(&self, id: &UserId) -> Result<Option<Principal>>;
}

/// Port for role lookups.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Claims attached to a role. Unknown roles have none.
    async fn claims(&self, role: &str) -> Result<Vec<Claim>>;
}

/// Refresh token as persisted. Only the digest of the token is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub hash: String,
    pub context: GrantContext,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Authorization code as persisted by the authorization front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCode {
    pub hash: String,
    pub client_id: String,
    pub redirect_uri: Option<String>,
    pub context: GrantContext,
    pub expires_at: DateTime<Utc>,
}

/// Port for token persistence.
///
/// Implementations sequence writes per subject so that revocations and
/// insertions for one subject never interleave.
#[async_trait]
pub trait TokenPersistence: Send + Sync {
    /// Store a new refresh token as the only live one of its subject.
    ///
    /// Revoking the previous tokens and inserting the new one is a single
    /// unit. Returns how many tokens were revoked.
    async fn replace_refresh_tokens(&self, token: &StoredToken) -> Result<u64>;

    /// Find a refresh token by digest, revoked or not.
    async fn find_refresh_token(&self, hash: &str)
    -> Result<Option<StoredToken>>;

    /// Revoke one refresh token. Returns `false` if it was already revoked.
    async fn revoke_refresh_token(&self, hash: &str) -> Result<bool>;

    /// Revoke every refresh token of a subject. Returns how many were live.
    async fn revoke_all_for_subject(&self, subject: &UserId) -> Result<u64>;

    /// Consume an authorization code. A code is returned at most once.
    async fn redeem_authorization_code(
        &self,
        hash: &str,
    ) -> Result<Option<StoredCode>>;
}

/// Port for browser sessions.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Delete a session. Unknown sessions are ignored.
    async fn sign_out(&self, session_id: &str) -> Result<()>;
}
