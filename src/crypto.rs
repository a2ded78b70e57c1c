//! Cryptographic helpers.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::config::Argon2 as ArgonConfig;
use crate::error::ToInternal;

/// Length of opaque refresh tokens and session identifiers.
pub const TOKEN_LENGTH: usize = 64;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
///
/// It also holds a hash of a random secret, built with the same parameters,
/// so that checks for unknown accounts cost as much as real ones.
#[derive(Debug, Clone)]
pub struct PasswordManager {
    params: Params,
    dummy_hash: String,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        let mut manager = Self {
            params,
            dummy_hash: String::new(),
        };
        manager.dummy_hash = manager.hash_password(random_token())?;

        Ok(manager)
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC. Malformed hashes never match.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        let Ok(parsed) = PasswordHash::new(phc_hash) else {
            tracing::warn!("stored password hash is not a PHC string");
            return false;
        };

        self.argon2()
            .verify_password(password.as_ref(), &parsed)
            .is_ok()
    }

    /// Run a full verification against the dummy hash. Never matches.
    pub fn verify_dummy(&self, password: impl AsRef<[u8]>) -> bool {
        let _ = self.verify_password(password, &self.dummy_hash);
        false
    }

    /// [`Self::verify_password`] on the blocking pool.
    pub async fn verify(
        &self,
        password: &str,
        phc_hash: &str,
    ) -> crate::error::Result<bool> {
        let manager = self.clone();
        let (password, phc_hash) = (password.to_owned(), phc_hash.to_owned());

        tokio::task::spawn_blocking(move || {
            manager.verify_password(password, &phc_hash)
        })
        .await
        .catch()
    }

    /// [`Self::verify_dummy`] on the blocking pool.
    pub async fn reject(&self, password: &str) -> crate::error::Result<bool> {
        let manager = self.clone();
        let password = password.to_owned();

        tokio::task::spawn_blocking(move || manager.verify_dummy(password))
            .await
            .catch()
    }
}

/// Digest an opaque token into SHA256. Only digests are persisted.
pub fn digest(token: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_ref());
    hex::encode(hasher.finalize())
}

/// Generate a random alphanumeric token.
pub fn random_token() -> String {
    Alphanumeric.sample_string(&mut OsRng, TOKEN_LENGTH)
}

#[cfg(test)]
pub(crate) fn test_password_manager() -> PasswordManager {
    PasswordManager::new(Some(ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }))
    .expect("valid argon2 parameters")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_roundtrip() {
        let pwd = test_password_manager();
        let hash = pwd.hash_password("P$soW%920$n&").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(pwd.verify_password("P$soW%920$n&", &hash));
        assert!(!pwd.verify_password("wrong", &hash));
        assert!(!pwd.verify_password("P$soW%920$n&", "not-a-phc"));
    }

    #[test]
    fn test_dummy_hash_shares_parameters() {
        let pwd = test_password_manager();
        let real = pwd.hash_password("P$soW%920$n&").unwrap();
        let params = |phc: &str| phc.split('$').nth(3).map(str::to_owned);

        assert_eq!(params(&pwd.dummy_hash), params(&real));
        assert_eq!(params(&real).as_deref(), Some("m=1024,t=1,p=1"));
        assert!(!pwd.verify_dummy("P$soW%920$n&"));
        assert!(!pwd.verify_dummy(""));
    }

    #[tokio::test]
    async fn test_verify_on_blocking_pool() {
        let pwd = test_password_manager();
        let hash = pwd.hash_password("P$soW%920$n&").unwrap();

        assert!(pwd.verify("P$soW%920$n&", &hash).await.unwrap());
        assert!(!pwd.verify("wrong", &hash).await.unwrap());
        assert!(!pwd.reject("P$soW%920$n&").await.unwrap());
    }

    #[test]
    fn test_sha2() {
        let excepted =
            "6580f23ce10ddcbbf651ebb415565654307ac739ba9b52ef686bffda29b7b03c";

        assert_eq!(digest("super_secret_data"), excepted);
    }

    #[test]
    fn test_random_token() {
        let token = random_token();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, random_token());
    }
}
