//! PostgreSQL implementation of the store ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::{LockoutPolicy, UserRecord};
use crate::crypto::PasswordManager;
use crate::error::Result;
use crate::issuer::{Claim, GrantContext, Principal, UserId};
use crate::ports::{
    CredentialStore, PrincipalStore, RoleStore, SessionManager, SignInResult,
    StoredCode, StoredToken, TokenPersistence,
};

const USER_COLUMNS: &str = r#"
    id, username, email, password_hash, security_stamp, disabled,
    lockout_enabled, lockout_end, access_failed_count
"#;

#[derive(Debug, FromRow)]
struct RefreshTokenRow {
    token_hash: String,
    user_id: String,
    scopes: Vec<String>,
    security_stamp: Option<String>,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

impl From<RefreshTokenRow> for StoredToken {
    fn from(row: RefreshTokenRow) -> Self {
        Self {
            hash: row.token_hash,
            context: GrantContext {
                subject: UserId::new(row.user_id),
                scopes: row.scopes,
                security_stamp: row.security_stamp,
            },
            expires_at: row.expires_at,
            revoked: row.revoked,
        }
    }
}

#[derive(Debug, FromRow)]
struct AuthorizationCodeRow {
    code_hash: String,
    client_id: String,
    redirect_uri: Option<String>,
    user_id: String,
    scopes: Vec<String>,
    security_stamp: Option<String>,
    expires_at: DateTime<Utc>,
}

impl From<AuthorizationCodeRow> for StoredCode {
    fn from(row: AuthorizationCodeRow) -> Self {
        Self {
            hash: row.code_hash,
            client_id: row.client_id,
            redirect_uri: row.redirect_uri,
            context: GrantContext {
                subject: UserId::new(row.user_id),
                scopes: row.scopes,
                security_stamp: row.security_stamp,
            },
            expires_at: row.expires_at,
        }
    }
}

/// Init database connections.
pub async fn connect(
    hostname: &str,
    username: &str,
    password: &str,
    db: &str,
    pool: u32,
) -> std::result::Result<PgPool, sqlx::Error> {
    let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
    let postgres = PgPoolOptions::new()
        .max_connections(pool)
        .connect(&addr)
        .await?;

    tracing::info!(%hostname, %db, "postgres connected");

    Ok(postgres)
}

/// Execute migrations scripts.
pub async fn migrate(pool: &PgPool) -> std::result::Result<(), sqlx::Error> {
    sqlx::migrate!().run(pool).await?;
    Ok(())
}

/// PostgreSQL store.
pub struct PgStore {
    pool: PgPool,
    passwords: PasswordManager,
    lockout: LockoutPolicy,
    stamp_claim: String,
}

impl PgStore {
    /// Create a new [`PgStore`].
    pub fn new(
        pool: PgPool,
        passwords: PasswordManager,
        lockout: LockoutPolicy,
        stamp_claim: &str,
    ) -> Self {
        Self {
            pool,
            passwords,
            lockout,
            stamp_claim: stamp_claim.to_owned(),
        }
    }

    async fn roles_of(&self, user_id: &str) -> Result<Vec<String>> {
        let roles = sqlx::query_scalar::<_, String>(
            r#"
            SELECT role_name
            FROM user_roles
            WHERE user_id = $1
            ORDER BY role_name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(roles)
    }

    async fn principal(&self, record: Option<UserRecord>) -> Result<Option<Principal>> {
        match record {
            Some(record) => {
                let roles = self.roles_of(&record.id).await?;
                Ok(Some(record.into_principal(&self.stamp_claim, roles)))
            },
            None => Ok(None),
        }
    }

    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// Serialize writes of one subject until the transaction ends.
async fn lock_subject(
    tx: &mut Transaction<'_, Postgres>,
    subject: &str,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(subject)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn revoke_subject(
    tx: &mut Transaction<'_, Postgres>,
    subject: &UserId,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE refresh_tokens
        SET revoked = true
        WHERE user_id = $1 AND revoked = false
        "#,
    )
    .bind(subject.as_str())
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_name(&self, username: &str) -> Result<Option<Principal>> {
        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1)"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        self.principal(record).await
    }

    async fn check_password_sign_in(
        &self,
        principal: &Principal,
        password: &str,
        lockout_on_failure: bool,
    ) -> Result<SignInResult> {
        let Some(record) = self.find_user(principal.id.as_str()).await? else {
            return Ok(SignInResult::Failed);
        };

        // no row lock is held while argon2 runs.
        let matches = self
            .passwords
            .verify(password, &record.password_hash)
            .await?;

        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(principal.id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut record) = record else {
            return Ok(SignInResult::Failed);
        };

        let result =
            self.lockout
                .apply(&mut record, matches, lockout_on_failure, Utc::now());

        sqlx::query(
            r#"
            UPDATE users
            SET access_failed_count = $2, lockout_end = $3
            WHERE id = $1
            "#,
        )
        .bind(&record.id)
        .bind(record.access_failed_count)
        .bind(record.lockout_end)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(result)
    }

    async fn reject_unknown(&self, password: &str) -> Result<()> {
        self.passwords.reject(password).await?;
        Ok(())
    }

    async fn can_sign_in(&self, principal: &Principal) -> Result<bool> {
        Ok(self
            .find_user(principal.id.as_str())
            .await?
            .is_some_and(|record| record.can_sign_in(Utc::now())))
    }
}

#[async_trait]
impl PrincipalStore for PgStore {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<Principal>> {
        let record = self.find_user(id.as_str()).await?;
        self.principal(record).await
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn claims(&self, role: &str) -> Result<Vec<Claim>> {
        let claims = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT claim_type, claim_value
            FROM role_claims
            WHERE role_name = $1
            ORDER BY id
            "#,
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims
            .into_iter()
            .map(|(kind, value)| Claim::new(kind, value))
            .collect())
    }
}

#[async_trait]
impl TokenPersistence for PgStore {
    async fn replace_refresh_tokens(&self, token: &StoredToken) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        lock_subject(&mut tx, token.context.subject.as_str()).await?;

        let revoked = revoke_subject(&mut tx, &token.context.subject).await?;

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token_hash, user_id, scopes, security_stamp, expires_at, revoked)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&token.hash)
        .bind(token.context.subject.as_str())
        .bind(&token.context.scopes)
        .bind(&token.context.security_stamp)
        .bind(token.expires_at)
        .bind(token.revoked)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(revoked)
    }

    async fn find_refresh_token(
        &self,
        hash: &str,
    ) -> Result<Option<StoredToken>> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT token_hash, user_id, scopes, security_stamp, expires_at, revoked
            FROM refresh_tokens
            WHERE token_hash = $1
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredToken::from))
    }

    async fn revoke_refresh_token(&self, hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = true
            WHERE token_hash = $1 AND revoked = false
            "#,
        )
        .bind(hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all_for_subject(&self, subject: &UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        lock_subject(&mut tx, subject.as_str()).await?;

        let revoked = revoke_subject(&mut tx, subject).await?;

        tx.commit().await?;

        Ok(revoked)
    }

    async fn redeem_authorization_code(
        &self,
        hash: &str,
    ) -> Result<Option<StoredCode>> {
        let row = sqlx::query_as::<_, AuthorizationCodeRow>(
            r#"
            DELETE FROM authorization_codes
            WHERE code_hash = $1
            RETURNING code_hash, client_id, redirect_uri, user_id, scopes, security_stamp, expires_at
            "#,
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(StoredCode::from))
    }
}

#[async_trait]
impl SessionManager for PgStore {
    async fn sign_out(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
