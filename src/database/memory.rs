//! In-memory stores. Data is lost on restart.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{LockoutPolicy, UserRecord};
use crate::config::Memory;
use crate::crypto::{CryptoError, PasswordManager, random_token};
use crate::error::Result;
use crate::issuer::principal::PERMISSION;
use crate::issuer::{Claim, Principal, UserId};
use crate::ports::{
    CredentialStore, PrincipalStore, RoleStore, SessionManager, SignInResult,
    StoredCode, StoredToken, TokenPersistence,
};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    user_roles: HashMap<String, Vec<String>>,
    roles: HashMap<String, Vec<Claim>>,
    refresh_tokens: HashMap<String, StoredToken>,
    codes: HashMap<String, StoredCode>,
    sessions: HashSet<String>,
}

/// Process-local store. One lock guards every table, so operations on a
/// subject never interleave. Password hashing runs with the lock released.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    passwords: PasswordManager,
    lockout: LockoutPolicy,
    stamp_claim: String,
}

impl MemoryStore {
    /// Create a new [`MemoryStore`].
    pub fn new(
        passwords: PasswordManager,
        lockout: LockoutPolicy,
        stamp_claim: &str,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            passwords,
            lockout,
            stamp_claim: stamp_claim.to_owned(),
        }
    }

    /// Load the accounts and roles listed in the `memory` section.
    pub async fn seed(&self, seed: &Memory) -> std::result::Result<(), CryptoError> {
        for role in &seed.roles {
            let claims = role
                .permissions
                .iter()
                .map(|permission| Claim::new(PERMISSION, permission.as_str()))
                .collect();
            self.insert_role(&role.name, claims).await;
        }

        for user in &seed.users {
            let record = UserRecord {
                id: user.id.clone().unwrap_or_else(|| user.username.clone()),
                username: user.username.clone(),
                email: user.email.clone(),
                password_hash: self.passwords.hash_password(&user.password)?,
                security_stamp: random_token(),
                disabled: false,
                lockout_enabled: true,
                lockout_end: None,
                access_failed_count: 0,
            };
            let roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
            self.insert_user(record, &roles).await;
        }

        tracing::info!(
            users = seed.users.len(),
            roles = seed.roles.len(),
            "in-memory stores seeded"
        );
        Ok(())
    }

    /// Insert or replace an account with its roles.
    pub async fn insert_user(&self, record: UserRecord, roles: &[&str]) {
        let mut inner = self.inner.lock().await;
        inner.user_roles.insert(
            record.id.clone(),
            roles.iter().map(|r| r.to_string()).collect(),
        );
        inner.users.insert(record.id.clone(), record);
    }

    /// Create or replace a role.
    pub async fn insert_role(&self, name: &str, claims: Vec<Claim>) {
        self.inner.lock().await.roles.insert(name.to_owned(), claims);
    }

    fn principal(&self, inner: &Inner, record: &UserRecord) -> Principal {
        let roles = inner.user_roles.get(&record.id).cloned().unwrap_or_default();
        record.clone().into_principal(&self.stamp_claim, roles)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Store with default lockout policy.
    pub fn with_passwords(passwords: PasswordManager, stamp_claim: &str) -> Self {
        Self::new(
            passwords,
            LockoutPolicy::from(&crate::config::Lockout::default()),
            stamp_claim,
        )
    }

    /// Update an account in place.
    pub async fn update_user<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut UserRecord),
    {
        if let Some(record) = self.inner.lock().await.users.get_mut(id) {
            update(record);
        }
    }

    /// Delete an account and its role memberships.
    pub async fn remove_user(&self, id: &UserId) {
        let mut inner = self.inner.lock().await;
        inner.users.remove(id.as_str());
        inner.user_roles.remove(id.as_str());
    }

    /// Register an authorization code issued by the front-end.
    pub async fn insert_authorization_code(&self, code: StoredCode) {
        self.inner.lock().await.codes.insert(code.hash.clone(), code);
    }

    /// Insert a refresh token as is, alongside the live ones.
    pub async fn insert_refresh_token(&self, token: StoredToken) {
        self.inner
            .lock()
            .await
            .refresh_tokens
            .insert(token.hash.clone(), token);
    }

    /// Open a browser session.
    pub async fn insert_session(&self, session_id: &str) {
        self.inner.lock().await.sessions.insert(session_id.to_owned());
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.inner.lock().await.sessions.contains(session_id)
    }

    /// Live refresh tokens of a subject.
    pub async fn active_refresh_tokens(&self, subject: &UserId) -> usize {
        self.inner
            .lock()
            .await
            .refresh_tokens
            .values()
            .filter(|t| !t.revoked && t.context.subject == *subject)
            .count()
    }
}

fn revoke_subject(inner: &mut Inner, subject: &UserId) -> u64 {
    let mut revoked = 0;

    for token in inner
        .refresh_tokens
        .values_mut()
        .filter(|t| !t.revoked && t.context.subject == *subject)
    {
        token.revoked = true;
        revoked += 1;
    }

    revoked
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_name(&self, username: &str) -> Result<Option<Principal>> {
        let inner = self.inner.lock().await;
        let username = username.to_lowercase();

        Ok(inner
            .users
            .values()
            .find(|u| u.username.to_lowercase() == username)
            .map(|record| self.principal(&inner, record)))
    }

    async fn check_password_sign_in(
        &self,
        principal: &Principal,
        password: &str,
        lockout_on_failure: bool,
    ) -> Result<SignInResult> {
        let password_hash = match self.inner.lock().await.users.get(principal.id.as_str()) {
            Some(record) => record.password_hash.clone(),
            None => return Ok(SignInResult::Failed),
        };

        let matches = self.passwords.verify(password, &password_hash).await?;

        let mut inner = self.inner.lock().await;
        let Some(record) = inner.users.get_mut(principal.id.as_str()) else {
            return Ok(SignInResult::Failed);
        };

        Ok(self
            .lockout
            .apply(record, matches, lockout_on_failure, Utc::now()))
    }

    async fn reject_unknown(&self, password: &str) -> Result<()> {
        self.passwords.reject(password).await?;
        Ok(())
    }

    async fn can_sign_in(&self, principal: &Principal) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .await
            .users
            .get(principal.id.as_str())
            .is_some_and(|record| record.can_sign_in(Utc::now())))
    }
}

#[async_trait]
impl PrincipalStore for MemoryStore {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<Principal>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .users
            .get(id.as_str())
            .map(|record| self.principal(&inner, record)))
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn claims(&self, role: &str) -> Result<Vec<Claim>> {
        Ok(self
            .inner
            .lock()
            .await
            .roles
            .get(role)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TokenPersistence for MemoryStore {
    async fn replace_refresh_tokens(&self, token: &StoredToken) -> Result<u64> {
        let mut inner = self.inner.lock().await;

        let revoked = revoke_subject(&mut inner, &token.context.subject);
        inner
            .refresh_tokens
            .insert(token.hash.clone(), token.clone());

        Ok(revoked)
    }

    async fn find_refresh_token(
        &self,
        hash: &str,
    ) -> Result<Option<StoredToken>> {
        Ok(self.inner.lock().await.refresh_tokens.get(hash).cloned())
    }

    async fn revoke_refresh_token(&self, hash: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        Ok(match inner.refresh_tokens.get_mut(hash) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                true
            },
            _ => false,
        })
    }

    async fn revoke_all_for_subject(&self, subject: &UserId) -> Result<u64> {
        Ok(revoke_subject(&mut *self.inner.lock().await, subject))
    }

    async fn redeem_authorization_code(
        &self,
        hash: &str,
    ) -> Result<Option<StoredCode>> {
        Ok(self.inner.lock().await.codes.remove(hash))
    }
}

#[async_trait]
impl SessionManager for MemoryStore {
    async fn sign_out(&self, session_id: &str) -> Result<()> {
        self.inner.lock().await.sessions.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::test_password_manager;
    use crate::issuer::GrantContext;
    use chrono::TimeDelta;

    fn token(hash: &str, subject: &str) -> StoredToken {
        StoredToken {
            hash: hash.into(),
            context: GrantContext {
                subject: UserId::new(subject),
                scopes: vec!["openid".into()],
                security_stamp: None,
            },
            expires_at: Utc::now() + TimeDelta::hours(1),
            revoked: false,
        }
    }

    #[tokio::test]
    async fn test_revoke_all_only_touches_subject() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        store.insert_refresh_token(token("a1", "alice")).await;
        store.insert_refresh_token(token("a2", "alice")).await;
        store.insert_refresh_token(token("b1", "bob")).await;

        let revoked = store
            .revoke_all_for_subject(&UserId::new("alice"))
            .await
            .unwrap();

        assert_eq!(revoked, 2);
        assert_eq!(store.active_refresh_tokens(&UserId::new("alice")).await, 0);
        assert_eq!(store.active_refresh_tokens(&UserId::new("bob")).await, 1);
    }

    #[tokio::test]
    async fn test_revoke_refresh_token_once() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        store.insert_refresh_token(token("a1", "alice")).await;

        assert!(store.revoke_refresh_token("a1").await.unwrap());
        assert!(!store.revoke_refresh_token("a1").await.unwrap());
        assert!(!store.revoke_refresh_token("unknown").await.unwrap());

        let stored = store.find_refresh_token("a1").await.unwrap().unwrap();
        assert!(stored.revoked);
    }

    #[tokio::test]
    async fn test_replace_leaves_one_live_token() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        let alice = UserId::new("alice");
        store.insert_refresh_token(token("a1", "alice")).await;
        store.insert_refresh_token(token("a2", "alice")).await;
        store.insert_refresh_token(token("b1", "bob")).await;

        assert_eq!(store.replace_refresh_tokens(&token("a3", "alice")).await.unwrap(), 2);
        assert_eq!(store.active_refresh_tokens(&alice).await, 1);
        assert!(!store.find_refresh_token("a3").await.unwrap().unwrap().revoked);
        assert_eq!(store.active_refresh_tokens(&UserId::new("bob")).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_replace() {
        let store = Arc::new(MemoryStore::with_passwords(
            test_password_manager(),
            "security_stamp",
        ));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .replace_refresh_tokens(&token(&format!("a{i}"), "alice"))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.active_refresh_tokens(&UserId::new("alice")).await, 1);
    }

    #[tokio::test]
    async fn test_seed() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        let seed: Memory = serde_yaml::from_str(
            r#"
users:
  - username: Carol
    email: carol@example.com
    password: hunter2
    roles: [admin]
roles:
  - name: admin
    permissions: [users.read, users.write]
"#,
        )
        .unwrap();
        store.seed(&seed).await.unwrap();

        let carol = store.find_by_name("carol").await.unwrap().unwrap();
        assert_eq!(carol.id, UserId::new("Carol"));
        assert_eq!(carol.roles, vec!["admin".to_owned()]);
        assert_eq!(
            store
                .check_password_sign_in(&carol, "hunter2", true)
                .await
                .unwrap(),
            SignInResult::Succeeded
        );
        assert_eq!(store.claims("admin").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_password_check_counts_failures() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        store
            .seed(&serde_yaml::from_str("users: [{username: dave, password: pw}]").unwrap())
            .await
            .unwrap();
        let dave = store.find_by_name("dave").await.unwrap().unwrap();

        for _ in 0..2 {
            assert_eq!(
                store.check_password_sign_in(&dave, "wrong", true).await.unwrap(),
                SignInResult::Failed
            );
        }
        store
            .update_user("dave", |record| assert_eq!(record.access_failed_count, 2))
            .await;

        store.remove_user(&dave.id).await;
        assert_eq!(
            store.check_password_sign_in(&dave, "pw", true).await.unwrap(),
            SignInResult::Failed
        );
    }

    #[tokio::test]
    async fn test_authorization_code_is_single_use() {
        let store = MemoryStore::with_passwords(test_password_manager(), "security_stamp");
        store
            .insert_authorization_code(StoredCode {
                hash: "code".into(),
                client_id: "client".into(),
                redirect_uri: None,
                context: token("code", "alice").context,
                expires_at: Utc::now() + TimeDelta::minutes(5),
            })
            .await;

        assert!(store.redeem_authorization_code("code").await.unwrap().is_some());
        assert!(store.redeem_authorization_code("code").await.unwrap().is_none());
    }
}
