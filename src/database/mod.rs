//! Store adapters backing the issuer ports.
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::Lockout;
use crate::crypto::PasswordManager;
use crate::issuer::Principal;
use crate::ports::{
    CredentialStore, PrincipalStore, RoleStore, SessionManager, SignInResult,
    TokenPersistence,
};

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "issuer";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Account as stored by both adapters.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub security_stamp: String,
    pub disabled: bool,
    pub lockout_enabled: bool,
    pub lockout_end: Option<DateTime<Utc>>,
    pub access_failed_count: i32,
}

impl UserRecord {
    /// Convert into a [`Principal`], the stamp keyed by `stamp_claim`.
    pub fn into_principal(self, stamp_claim: &str, roles: Vec<String>) -> Principal {
        Principal::new(
            self.id,
            self.username,
            self.email,
            Some((stamp_claim, self.security_stamp)),
        )
        .with_roles(roles)
    }

    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        self.lockout_enabled && self.lockout_end.is_some_and(|end| end > now)
    }

    pub fn can_sign_in(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && !self.is_locked_out(now)
    }
}

/// Lockout policy shared by adapters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockoutPolicy {
    max_failed_access_attempts: i32,
    duration: TimeDelta,
}

impl From<&Lockout> for LockoutPolicy {
    fn from(config: &Lockout) -> Self {
        Self {
            max_failed_access_attempts: config
                .max_failed_access_attempts
                .max(1)
                .try_into()
                .unwrap_or(i32::MAX),
            duration: i64::try_from(config.duration)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
        }
    }
}

impl LockoutPolicy {
    /// Apply a password check outcome to the record.
    /// The caller persists the updated counters.
    pub fn apply(
        &self,
        record: &mut UserRecord,
        password_matches: bool,
        lockout_on_failure: bool,
        now: DateTime<Utc>,
    ) -> SignInResult {
        if record.disabled {
            return SignInResult::NotAllowed;
        }
        if record.is_locked_out(now) {
            return SignInResult::LockedOut;
        }

        if password_matches {
            record.access_failed_count = 0;
            record.lockout_end = None;
            return SignInResult::Succeeded;
        }

        if lockout_on_failure && record.lockout_enabled {
            record.access_failed_count += 1;
            if record.access_failed_count >= self.max_failed_access_attempts {
                record.access_failed_count = 0;
                record.lockout_end = Some(
                    now.checked_add_signed(self.duration)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC),
                );
                return SignInResult::LockedOut;
            }
        }

        SignInResult::Failed
    }
}

/// Every port implemented by one backend.
pub trait Store:
    CredentialStore + PrincipalStore + RoleStore + TokenPersistence + SessionManager
{
}

impl<T> Store for T where
    T: CredentialStore
        + PrincipalStore
        + RoleStore
        + TokenPersistence
        + SessionManager
{
}

/// Ports handed to the application state.
#[derive(Clone)]
pub struct Database {
    pub credentials: Arc<dyn CredentialStore>,
    pub principals: Arc<dyn PrincipalStore>,
    pub roles: Arc<dyn RoleStore>,
    pub tokens: Arc<dyn TokenPersistence>,
    pub sessions: Arc<dyn SessionManager>,
}

impl Database {
    /// Share one backend across every port.
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            credentials: store.clone(),
            principals: store.clone(),
            roles: store.clone(),
            tokens: store.clone(),
            sessions: store,
        }
    }

    /// Init PostgreSQL connections and run migrations.
    pub async fn postgres(
        config: &crate::config::Postgres,
        passwords: PasswordManager,
        lockout: LockoutPolicy,
        stamp_claim: &str,
    ) -> Result<Self, sqlx::Error> {
        let pool = postgres::connect(
            &config.address,
            config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS),
            config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME),
            config.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        )
        .await?;

        // execute migrations scripts on start.
        postgres::migrate(&pool).await?;

        Ok(Self::from_store(Arc::new(postgres::PgStore::new(
            pool,
            passwords,
            lockout,
            stamp_claim,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UserRecord {
        UserRecord {
            id: "alice".into(),
            username: "alice".into(),
            email: Some("alice@example.com".into()),
            password_hash: String::default(),
            security_stamp: "stamp".into(),
            disabled: false,
            lockout_enabled: true,
            lockout_end: None,
            access_failed_count: 0,
        }
    }

    fn policy() -> LockoutPolicy {
        LockoutPolicy::from(&Lockout {
            max_failed_access_attempts: 3,
            duration: 60,
        })
    }

    #[test]
    fn test_lockout_after_max_failures() {
        let now = Utc::now();
        let mut user = record();

        assert_eq!(policy().apply(&mut user, false, true, now), SignInResult::Failed);
        assert_eq!(policy().apply(&mut user, false, true, now), SignInResult::Failed);
        assert_eq!(
            policy().apply(&mut user, false, true, now),
            SignInResult::LockedOut
        );
        assert!(user.is_locked_out(now));
        // even the right password is refused while locked.
        assert_eq!(
            policy().apply(&mut user, true, true, now),
            SignInResult::LockedOut
        );
        // lock expires.
        let later = now + TimeDelta::seconds(61);
        assert_eq!(
            policy().apply(&mut user, true, true, later),
            SignInResult::Succeeded
        );
    }

    #[test]
    fn test_failures_without_lockout() {
        let now = Utc::now();
        let mut user = record();

        for _ in 0..5 {
            assert_eq!(
                policy().apply(&mut user, false, false, now),
                SignInResult::Failed
            );
        }
        assert_eq!(user.access_failed_count, 0);
    }

    #[test]
    fn test_oversized_lockout_duration() {
        let now = Utc::now();
        let mut user = record();
        let policy = LockoutPolicy::from(&Lockout {
            max_failed_access_attempts: 1,
            duration: u64::MAX,
        });

        assert_eq!(policy.apply(&mut user, false, true, now), SignInResult::LockedOut);
        assert_eq!(user.lockout_end, Some(DateTime::<Utc>::MAX_UTC));
        assert!(user.is_locked_out(now + TimeDelta::days(365 * 100)));
    }

    #[test]
    fn test_disabled_account() {
        let mut user = UserRecord {
            disabled: true,
            ..record()
        };

        assert!(!user.can_sign_in(Utc::now()));
        assert_eq!(
            policy().apply(&mut user, true, true, Utc::now()),
            SignInResult::NotAllowed
        );
    }
}
