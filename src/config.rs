//! Configuration manager for the issuer.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_AUDIENCE: &str = "resource_server";
const DEFAULT_SECURITY_STAMP_CLAIM: &str = "security_stamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    #[serde(default)]
    pub name: String,
    /// Public URL of current instance, used as token issuer.
    #[serde(default)]
    pub url: String,
    /// Listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to JsonWebToken configuration.
    #[serde(default, skip_serializing)]
    pub jwt: Jwt,
    /// Related to account lockout.
    #[serde(default, skip_serializing)]
    pub lockout: Lockout,
    /// Related to browser sessions and logout.
    #[serde(default, skip_serializing)]
    pub session: Session,
    /// Related to PostgreSQL configuration.
    /// In-memory stores are used when missing.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Accounts and roles loaded into the in-memory stores.
    /// Ignored when `postgres` is set.
    #[serde(default, skip_serializing)]
    pub memory: Memory,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to OpenTelemetry export.
    #[serde(default, skip_serializing)]
    pub telemetry: Telemetry,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").to_owned(),
            url: "http://localhost/".to_owned(),
            port: DEFAULT_PORT,
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            jwt: Jwt::default(),
            lockout: Lockout::default(),
            session: Session::default(),
            postgres: None,
            memory: Memory::default(),
            argon2: None,
            telemetry: Telemetry::default(),
        }
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Jwt {
    /// Audience and resource set on every ticket.
    pub audience: String,
    /// Access token lifetime, in seconds.
    pub access_token_lifetime: u64,
    /// Identity token lifetime, in seconds.
    pub identity_token_lifetime: u64,
    /// Refresh token lifetime, in seconds.
    pub refresh_token_lifetime: u64,
    /// Claim type holding the security stamp. Never serialized into tokens.
    pub security_stamp_claim_type: String,
    /// Reject code and refresh exchanges when the security stamp changed
    /// since issuance.
    pub validate_security_stamp: bool,
    pub key_id: Option<String>,
    /// EC P-384 public key, SPKI PEM.
    pub public_key_pem: String,
    /// EC P-384 private key, PKCS#8 PEM.
    pub private_key_pem: String,
}

impl Default for Jwt {
    fn default() -> Self {
        Self {
            audience: DEFAULT_AUDIENCE.to_owned(),
            access_token_lifetime: 60 * 60,
            identity_token_lifetime: 20 * 60,
            refresh_token_lifetime: 14 * 24 * 60 * 60,
            security_stamp_claim_type: DEFAULT_SECURITY_STAMP_CLAIM.to_owned(),
            validate_security_stamp: false,
            key_id: None,
            public_key_pem: String::default(),
            private_key_pem: String::default(),
        }
    }
}

/// Account lockout policy.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Lockout {
    /// Failed password checks before the account is locked.
    pub max_failed_access_attempts: u32,
    /// Lock duration, in seconds.
    pub duration: u64,
}

impl Default for Lockout {
    fn default() -> Self {
        Self {
            max_failed_access_attempts: 5,
            duration: 5 * 60,
        }
    }
}

/// Browser session configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    /// Cookie carrying the session identifier.
    pub cookie_name: String,
    /// Redirections accepted after logout.
    pub post_logout_redirect_uris: Vec<String>,
    /// Redirection used when none (or an unknown one) is requested.
    pub default_logout_redirect: String,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            cookie_name: "session_id".to_owned(),
            post_logout_redirect_uris: Vec::new(),
            default_logout_redirect: "/".to_owned(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Seed of the in-memory stores.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Memory {
    pub users: Vec<SeedUser>,
    pub roles: Vec<SeedRole>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    /// Stable identifier. Defaults to the username.
    pub id: Option<String>,
    pub username: String,
    pub email: Option<String>,
    /// Plain password, hashed on load.
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SeedRole {
    pub name: String,
    /// Values of the `permission` claims of the role.
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// OpenTelemetry configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    /// OTLP gRPC endpoint receiving logs and traces.
    pub otlp_endpoint: Option<String>,
}

/// Immutable options handed to the token issuer.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuerOptions {
    pub audience: String,
    pub access_token_lifetime: Duration,
    pub identity_token_lifetime: Duration,
    pub refresh_token_lifetime: Duration,
    pub security_stamp_claim_type: String,
    pub validate_security_stamp: bool,
}

impl From<&Jwt> for IssuerOptions {
    fn from(jwt: &Jwt) -> Self {
        Self {
            audience: jwt.audience.clone(),
            access_token_lifetime: Duration::from_secs(
                jwt.access_token_lifetime,
            ),
            identity_token_lifetime: Duration::from_secs(
                jwt.identity_token_lifetime,
            ),
            refresh_token_lifetime: Duration::from_secs(
                jwt.refresh_token_lifetime,
            ),
            security_stamp_claim_type: jwt.security_stamp_claim_type.clone(),
            validate_security_stamp: jwt.validate_security_stamp,
        }
    }
}

impl Default for IssuerOptions {
    fn default() -> Self {
        Self::from(&Jwt::default())
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Normalizes a URL string by ensuring it starts with a valid scheme
    /// (`http` or `https`).
    fn normalize_url(&self, url: &str) -> Result<String, url::ParseError> {
        let url_with_scheme =
            if url.starts_with("http://") || url.starts_with("https://") {
                url.to_string()
            } else {
                format!("https://{url}")
            };

        let parsed_url = Url::parse(&url_with_scheme)?;
        Ok(parsed_url.to_string())
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Result<Arc<Self>, url::ParseError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let config = match serde_yaml::from_reader(file) {
                    Ok(config) => config,
                    Err(err) => return Ok(Arc::new(self.error(err))),
                };

                Ok(Arc::new(self.finalize(config)?))
            },
            Err(err) => Ok(Arc::new(self.error(err))),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(self, yaml: &str) -> Result<Self, serde_yaml::Error> {
        let config: Configuration = serde_yaml::from_str(yaml)?;
        // an invalid URL keeps the raw value, issuer claims stay readable.
        Ok(match self.finalize(config.clone()) {
            Ok(config) => config,
            Err(_) => config,
        })
    }

    fn finalize(
        &self,
        mut config: Configuration,
    ) -> Result<Self, url::ParseError> {
        // set app version.
        config.version = VERSION.to_owned();
        config.path = self.path.clone();

        // normalize URLs.
        if !config.url.is_empty() {
            config.url = self.normalize_url(&config.url)?;
        }

        Ok(config)
    }

    /// Options passed to [`crate::issuer::TokenIssuer`].
    pub fn issuer_options(&self) -> IssuerOptions {
        IssuerOptions::from(&self.jwt)
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}
