//! Token issuance: authenticate a grant, then assemble the ticket.
//!
//! The issuer holds no mutable state. Every exchange reads the stores through
//! the ports and returns a fresh [`Ticket`].
pub mod grant;
pub mod principal;
pub mod scope;
pub mod ticket;

use std::sync::Arc;

pub use grant::{GrantContext, GrantRequest};
pub use principal::{Claim, Principal, UserId};
use principal::{ROLE, USER_ID};
pub use ticket::{Destination, Lifetimes, Ticket, TicketClaim};

use crate::config::IssuerOptions;
use crate::error::{OAuthError, Result, ServerError};
use crate::ports::{CredentialStore, PrincipalStore, RoleStore, TokenPersistence};
use crate::telemetry;

/// Exchange grants for tickets.
#[derive(Clone)]
pub struct TokenIssuer {
    credentials: Arc<dyn CredentialStore>,
    principals: Arc<dyn PrincipalStore>,
    roles: Arc<dyn RoleStore>,
    tokens: Arc<dyn TokenPersistence>,
    options: IssuerOptions,
}

impl TokenIssuer {
    /// Create a new [`TokenIssuer`].
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        principals: Arc<dyn PrincipalStore>,
        roles: Arc<dyn RoleStore>,
        tokens: Arc<dyn TokenPersistence>,
        options: IssuerOptions,
    ) -> Self {
        Self {
            credentials,
            principals,
            roles,
            tokens,
            options,
        }
    }

    /// Authenticate a grant and build its ticket.
    pub async fn exchange(&self, request: GrantRequest) -> Result<Ticket> {
        let grant_type = request.grant_type().to_owned();
        let ticket = self.authenticate(request).await?;

        telemetry::record_issued(&grant_type);
        tracing::info!(
            user_id = %ticket.subject(),
            %grant_type,
            scopes = ticket.scopes().len(),
            "ticket issued"
        );

        Ok(ticket)
    }

    async fn authenticate(&self, request: GrantRequest) -> Result<Ticket> {
        match request {
            GrantRequest::Password {
                username,
                password,
                scopes,
            } => self.password_grant(&username, &password, &scopes).await,
            GrantRequest::AuthorizationCode(context) => {
                let principal = self.resolve(&context).await?;
                let scopes = self.grant_scopes(&principal, &context.scopes).await?;
                Ok(self.ticket(&principal, scopes))
            },
            GrantRequest::RefreshToken(context) => {
                let principal = self.resolve(&context).await?;
                Ok(self.ticket(&principal, context.scopes))
            },
            GrantRequest::Unsupported(grant_type) => {
                tracing::debug!(%grant_type, "unsupported grant type");
                Err(OAuthError::UnsupportedGrantType.into())
            },
        }
    }

    async fn password_grant(
        &self,
        username: &str,
        password: &str,
        requested: &[String],
    ) -> Result<Ticket> {
        let Some(principal) = self.credentials.find_by_name(username).await?
        else {
            self.credentials.reject_unknown(password).await?;
            return Err(OAuthError::INVALID_CREDENTIALS.into());
        };

        let result = self
            .credentials
            .check_password_sign_in(&principal, password, true)
            .await?;
        if !result.succeeded() {
            tracing::info!(user_id = %principal.id, ?result, "password sign-in refused");
            return Err(OAuthError::INVALID_CREDENTIALS.into());
        }

        // single active refresh token per subject.
        let revoked = self.tokens.revoke_all_for_subject(&principal.id).await?;
        tracing::debug!(user_id = %principal.id, revoked, "refresh tokens revoked");

        let scopes = self.grant_scopes(&principal, requested).await?;
        Ok(self.ticket(&principal, scopes))
    }

    /// Principal stored in an authorization code or a refresh token, if still
    /// allowed to sign in.
    async fn resolve(&self, context: &GrantContext) -> Result<Principal> {
        let Some(principal) = self.principals.find_by_id(&context.subject).await?
        else {
            return Err(OAuthError::TOKEN_NO_LONGER_VALID.into());
        };

        if !self.credentials.can_sign_in(&principal).await? {
            return Err(OAuthError::SIGN_IN_NOT_ALLOWED.into());
        }

        if self.options.validate_security_stamp {
            let current =
                principal.find_first(&self.options.security_stamp_claim_type);
            if current != context.security_stamp.as_deref() {
                tracing::info!(user_id = %principal.id, "security stamp changed since issuance");
                return Err(OAuthError::SIGN_IN_NOT_ALLOWED.into());
            }
        }

        Ok(principal)
    }

    /// Allowed requested scopes followed by the principal's permissions.
    async fn grant_scopes(
        &self,
        principal: &Principal,
        requested: &[String],
    ) -> Result<Vec<String>> {
        let mut scopes = scope::intersect(requested);

        let mut role_claims = Vec::with_capacity(principal.roles.len());
        for role in &principal.roles {
            role_claims.push(self.roles.claims(role).await?);
        }

        for permission in scope::fold_permissions(role_claims) {
            if !scopes.contains(&permission) {
                scopes.push(permission);
            }
        }

        Ok(scopes)
    }

    fn ticket(&self, principal: &Principal, scopes: Vec<String>) -> Ticket {
        let stamp_claim = self.options.security_stamp_claim_type.as_str();
        let lifetimes = Lifetimes {
            access_token: self.options.access_token_lifetime,
            identity_token: self.options.identity_token_lifetime,
            refresh_token: self.options.refresh_token_lifetime,
        };

        let role_claims = principal
            .roles
            .iter()
            .map(|role| Claim::new(ROLE, role.as_str()));

        let builder = principal
            .claims
            .iter()
            .filter(|claim| !claim.is(stamp_claim))
            .cloned()
            .chain(role_claims)
            .fold(Ticket::builder(principal.id.clone(), lifetimes), |builder, claim| {
                let destination = scope::destination_for(&claim, &scopes);
                builder.claim(claim, destination)
            });

        builder
            .claim(
                Claim::new(USER_ID, principal.id.as_str()),
                Destination::AccessToken,
            )
            .audience(&self.options.audience)
            .resource(&self.options.audience)
            .security_stamp(principal.find_first(stamp_claim).map(str::to_owned))
            .scopes(scopes)
            .build()
    }

    /// Resolve the user behind an access token's user-id claim.
    pub async fn current_user(&self, user_id: Option<&str>) -> Result<Principal> {
        let Some(user_id) = user_id else {
            return Err(ServerError::no_user_found());
        };

        self.principals
            .find_by_id(&UserId::new(user_id))
            .await?
            .ok_or_else(ServerError::no_user_found)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};

    use super::principal::{EMAIL, NAME, PERMISSION};
    use super::*;
    use crate::crypto::test_password_manager;
    use crate::database::UserRecord;
    use crate::database::memory::MemoryStore;
    use crate::ports::{SignInResult, StoredCode, StoredToken};

    pub const PASSWORD: &str = "P$soW%920$n&";
    pub const STAMP_CLAIM: &str = "security_stamp";

    pub fn user(id: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            username: id.into(),
            email: Some(format!("{id}@example.com")),
            password_hash: test_password_manager().hash_password(PASSWORD).unwrap(),
            security_stamp: format!("{id}-stamp"),
            disabled: false,
            lockout_enabled: true,
            lockout_end: None,
            access_failed_count: 0,
        }
    }

    /// Store seeded with `alice` (admin, editor) and `bob` (no role).
    pub async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::with_passwords(
            test_password_manager(),
            STAMP_CLAIM,
        ));

        store
            .insert_role(
                "admin",
                vec![
                    Claim::new(PERMISSION, "users.read"),
                    Claim::new(PERMISSION, "users.write"),
                ],
            )
            .await;
        store
            .insert_role(
                "editor",
                vec![
                    Claim::new(PERMISSION, "posts.write"),
                    Claim::new(PERMISSION, "users.read"),
                    Claim::new("description", "content editors"),
                ],
            )
            .await;
        store.insert_user(user("alice"), &["admin", "editor"]).await;
        store.insert_user(user("bob"), &[]).await;

        store
    }

    pub fn options() -> IssuerOptions {
        IssuerOptions {
            audience: "resource_server".into(),
            access_token_lifetime: Duration::from_secs(3600),
            identity_token_lifetime: Duration::from_secs(1200),
            refresh_token_lifetime: Duration::from_secs(86400),
            security_stamp_claim_type: STAMP_CLAIM.into(),
            validate_security_stamp: false,
        }
    }

    pub fn issuer_with(store: &Arc<MemoryStore>, options: IssuerOptions) -> TokenIssuer {
        TokenIssuer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            options,
        )
    }

    fn password(username: &str, password: &str, scopes: &[&str]) -> GrantRequest {
        GrantRequest::Password {
            username: username.into(),
            password: password.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn context(subject: &str, scopes: &[&str]) -> GrantContext {
        GrantContext {
            subject: UserId::new(subject),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            security_stamp: Some(format!("{subject}-stamp")),
        }
    }

    fn destination(ticket: &Ticket, kind: &str) -> Option<Destination> {
        ticket
            .claims()
            .iter()
            .find(|c| c.claim.is(kind))
            .map(|c| c.destination)
    }

    fn refresh_token(subject: &str, hash: &str) -> StoredToken {
        StoredToken {
            hash: hash.into(),
            context: context(subject, &["openid", "offline_access"]),
            expires_at: Utc::now() + TimeDelta::hours(1),
            revoked: false,
        }
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_alike() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let unknown = issuer
            .exchange(password("nobody", PASSWORD, &["openid"]))
            .await
            .unwrap_err();
        let wrong = issuer
            .exchange(password("alice", "wrong", &["openid"]))
            .await
            .unwrap_err();

        for err in [unknown, wrong] {
            assert!(matches!(
                err,
                ServerError::OAuth(OAuthError::InvalidGrant(
                    "The username/password couple is invalid."
                ))
            ));
        }
    }

    /// Credentials counting argon2 checks.
    struct CountingCredentials {
        store: Arc<MemoryStore>,
        checks: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for CountingCredentials {
        async fn find_by_name(&self, username: &str) -> Result<Option<Principal>> {
            self.store.find_by_name(username).await
        }

        async fn check_password_sign_in(
            &self,
            principal: &Principal,
            password: &str,
            lockout_on_failure: bool,
        ) -> Result<SignInResult> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.store
                .check_password_sign_in(principal, password, lockout_on_failure)
                .await
        }

        async fn reject_unknown(&self, password: &str) -> Result<()> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.store.reject_unknown(password).await
        }

        async fn can_sign_in(&self, principal: &Principal) -> Result<bool> {
            self.store.can_sign_in(principal).await
        }
    }

    #[tokio::test]
    async fn test_unknown_user_costs_a_password_check() {
        let store = seeded_store().await;
        let credentials = Arc::new(CountingCredentials {
            store: store.clone(),
            checks: AtomicUsize::new(0),
        });
        let issuer = TokenIssuer::new(
            credentials.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            options(),
        );

        assert!(issuer.exchange(password("nobody", "wrong", &[])).await.is_err());
        assert_eq!(credentials.checks.load(Ordering::SeqCst), 1);

        assert!(issuer.exchange(password("alice", "wrong", &[])).await.is_err());
        assert_eq!(credentials.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lockout_uses_same_message() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        for _ in 0..5 {
            let _ = issuer.exchange(password("bob", "wrong", &[])).await;
        }

        let err = issuer
            .exchange(password("bob", PASSWORD, &[]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::InvalidGrant(
                "The username/password couple is invalid."
            ))
        ));
    }

    #[tokio::test]
    async fn test_password_grant_revokes_refresh_tokens() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());
        store.insert_refresh_token(refresh_token("alice", "one")).await;
        store.insert_refresh_token(refresh_token("alice", "two")).await;
        store.insert_refresh_token(refresh_token("bob", "three")).await;

        let ticket = issuer
            .exchange(password("alice", PASSWORD, &["openid", "offline_access"]))
            .await
            .unwrap();

        assert_eq!(ticket.subject().as_str(), "alice");
        assert_eq!(store.active_refresh_tokens(&UserId::new("alice")).await, 0);
        assert_eq!(store.active_refresh_tokens(&UserId::new("bob")).await, 1);
    }

    #[tokio::test]
    async fn test_scopes_intersect_and_expand_permissions() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let ticket = issuer
            .exchange(password("alice", PASSWORD, &["openid", "email", "bogus_scope"]))
            .await
            .unwrap();

        assert_eq!(
            ticket.scopes(),
            ["openid", "email", "users.read", "users.write", "posts.write"]
        );
        assert_eq!(ticket.audiences(), ["resource_server"]);
        assert_eq!(ticket.resources(), ["resource_server"]);
        assert_eq!(
            ticket.lifetimes().refresh_token,
            Duration::from_secs(86400)
        );
    }

    #[tokio::test]
    async fn test_security_stamp_never_in_ticket() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let ticket = issuer
            .exchange(password("alice", PASSWORD, &["openid", "profile", "email", "roles"]))
            .await
            .unwrap();

        assert!(ticket.claims().iter().all(|c| !c.claim.is(STAMP_CLAIM)));
        assert!(
            ticket
                .claims()
                .iter()
                .all(|c| !c.claim.value.contains("alice-stamp"))
        );
        // kept aside for refresh token persistence only.
        assert_eq!(ticket.security_stamp(), Some("alice-stamp"));

        let uid = ticket
            .claims()
            .iter()
            .find(|c| c.claim.is(USER_ID))
            .unwrap();
        assert_eq!(uid.claim.value, "alice");
        assert_eq!(uid.destination, Destination::AccessToken);
    }

    #[tokio::test]
    async fn test_claim_destinations_follow_scopes() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let with_profile = issuer
            .exchange(password("alice", PASSWORD, &["openid", "profile", "roles"]))
            .await
            .unwrap();
        assert_eq!(destination(&with_profile, NAME), Some(Destination::Both));
        assert_eq!(
            destination(&with_profile, EMAIL),
            Some(Destination::AccessToken)
        );
        assert_eq!(destination(&with_profile, ROLE), Some(Destination::Both));

        let without_profile = issuer
            .exchange(password("alice", PASSWORD, &["openid", "email"]))
            .await
            .unwrap();
        assert_eq!(
            destination(&without_profile, NAME),
            Some(Destination::AccessToken)
        );
        assert_eq!(destination(&without_profile, EMAIL), Some(Destination::Both));
        assert_eq!(
            destination(&without_profile, ROLE),
            Some(Destination::AccessToken)
        );
    }

    #[tokio::test]
    async fn test_refresh_grant_reuses_stored_scopes() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let ticket = issuer
            .exchange(GrantRequest::RefreshToken(context(
                "alice",
                &["openid", "offline_access", "legacy.permission"],
            )))
            .await
            .unwrap();

        assert_eq!(
            ticket.scopes(),
            ["openid", "offline_access", "legacy.permission"]
        );
        assert!(ticket.claims().iter().any(|c| c.claim.is(USER_ID)));
    }

    #[tokio::test]
    async fn test_authorization_code_grant_computes_scopes() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let ticket = issuer
            .exchange(GrantRequest::AuthorizationCode(context(
                "bob",
                &["profile", "openid", "unknown"],
            )))
            .await
            .unwrap();

        assert_eq!(ticket.scopes(), ["profile", "openid"]);
        assert_eq!(destination(&ticket, NAME), Some(Destination::Both));
    }

    #[tokio::test]
    async fn test_unknown_principal_token_no_longer_valid() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        for request in [
            GrantRequest::RefreshToken(context("ghost", &["openid"])),
            GrantRequest::AuthorizationCode(context("ghost", &["openid"])),
        ] {
            let err = issuer.exchange(request).await.unwrap_err();
            assert!(matches!(
                err,
                ServerError::OAuth(OAuthError::InvalidGrant(
                    "The token is no longer valid."
                ))
            ));
        }
    }

    #[tokio::test]
    async fn test_disabled_principal_cannot_refresh() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());
        store.update_user("bob", |u| u.disabled = true).await;

        let err = issuer
            .exchange(GrantRequest::RefreshToken(context("bob", &["openid"])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::InvalidGrant(
                "The user is no longer allowed to sign in."
            ))
        ));
    }

    #[tokio::test]
    async fn test_disabled_principal_cannot_redeem_code() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());
        store.update_user("alice", |u| u.disabled = true).await;

        let err = issuer
            .exchange(GrantRequest::AuthorizationCode(context("alice", &["openid"])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::InvalidGrant(
                "The user is no longer allowed to sign in."
            ))
        ));
    }

    #[tokio::test]
    async fn test_locked_out_principal_cannot_redeem_code() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());
        store
            .update_user("bob", |u| {
                u.lockout_end = Some(Utc::now() + TimeDelta::minutes(5))
            })
            .await;

        let err = issuer
            .exchange(GrantRequest::AuthorizationCode(context("bob", &["openid"])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::InvalidGrant(
                "The user is no longer allowed to sign in."
            ))
        ));
    }

    #[tokio::test]
    async fn test_security_stamp_policy() {
        let store = seeded_store().await;
        store
            .update_user("bob", |u| u.security_stamp = "rotated".into())
            .await;

        // default policy only checks that the account can sign in.
        let relaxed = issuer_with(&store, options());
        assert!(
            relaxed
                .exchange(GrantRequest::RefreshToken(context("bob", &["openid"])))
                .await
                .is_ok()
        );

        let strict = issuer_with(
            &store,
            IssuerOptions {
                validate_security_stamp: true,
                ..options()
            },
        );
        let err = strict
            .exchange(GrantRequest::RefreshToken(context("bob", &["openid"])))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::InvalidGrant(
                "The user is no longer allowed to sign in."
            ))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_grant_type() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let err = issuer
            .exchange(GrantRequest::Unsupported("client_credentials".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::OAuth(OAuthError::UnsupportedGrantType)
        ));
    }

    #[tokio::test]
    async fn test_current_user() {
        let store = seeded_store().await;
        let issuer = issuer_with(&store, options());

        let alice = issuer.current_user(Some("alice")).await.unwrap();
        assert_eq!(alice.username, "alice");
        assert_eq!(alice.roles, ["admin", "editor"]);

        for user_id in [Some("ghost"), None] {
            let err = issuer.current_user(user_id).await.unwrap_err();
            assert!(matches!(err, ServerError::BadRequest(ref m) if m == "No user found"));
        }
    }

    /// Persistence failing on revocation.
    struct BrokenPersistence;

    #[async_trait]
    impl TokenPersistence for BrokenPersistence {
        async fn replace_refresh_tokens(&self, _: &StoredToken) -> Result<u64> {
            Ok(0)
        }

        async fn find_refresh_token(&self, _: &str) -> Result<Option<StoredToken>> {
            Ok(None)
        }

        async fn revoke_refresh_token(&self, _: &str) -> Result<bool> {
            Ok(false)
        }

        async fn revoke_all_for_subject(&self, _: &UserId) -> Result<u64> {
            Err(ServerError::Internal {
                details: "connection reset".into(),
                source: None,
            })
        }

        async fn redeem_authorization_code(
            &self,
            _: &str,
        ) -> Result<Option<StoredCode>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_revocation_failure_fails_issuance() {
        let store = seeded_store().await;
        let issuer = TokenIssuer::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(BrokenPersistence),
            options(),
        );

        let err = issuer
            .exchange(password("alice", PASSWORD, &["openid"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Internal { .. }));
    }
}
