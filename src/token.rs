//! Manage json web tokens.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::random_token;
use crate::error::Result;
use crate::issuer::{Claim, Ticket};

/// Claim names set by the serializer itself.
const REGISTERED_CLAIMS: [&str; 8] =
    ["iss", "sub", "aud", "iat", "exp", "nbf", "jti", "scope"];

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// User ID.
    pub sub: String,
    /// Recipients that the JWT is intended for.
    pub aud: Vec<String>,
    /// Identifies the time at which the JWT was issued.
    pub iat: i64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Space-delimited granted scopes. Access tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Principal claims routed to this token.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// First string value of a principal claim.
    pub fn find_first(&self, kind: &str) -> Option<&str> {
        match self.extra.get(kind)? {
            Value::String(value) => Some(value),
            Value::Array(values) => values.first().and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Serialized tokens of one ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTokens {
    pub access_token: String,
    /// Set when `openid` is granted.
    pub id_token: Option<String>,
    /// Access token lifetime, in seconds.
    pub expires_in: u64,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    algorithm: Algorithm,
    public_key: DecodingKey,
    private_key: EncodingKey,
    issuer: String,
    audience: String,
    key_id: Option<String>,
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    pub fn new(
        issuer: &str,
        audience: &str,
        key_id: Option<String>,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self> {
        Ok(Self {
            algorithm: Algorithm::ES384,
            public_key: DecodingKey::from_ec_pem(public_key_pem.as_bytes())?,
            private_key: EncodingKey::from_ec_pem(private_key_pem.as_bytes())?,
            issuer: issuer.to_owned(),
            audience: audience.to_owned(),
            key_id,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn header(&self) -> Header {
        let mut header = Header::new(self.algorithm);
        header.kid = self.key_id.clone();
        header
    }

    fn claims<'a>(
        &self,
        ticket: &Ticket,
        lifetime: std::time::Duration,
        principal_claims: impl Iterator<Item = &'a Claim>,
    ) -> Claims {
        let now = Utc::now();
        let lifetime = i64::try_from(lifetime.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let exp = now
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Claims {
            iss: self.issuer.clone(),
            sub: ticket.subject().to_string(),
            aud: ticket.audiences().to_vec(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            jti: None,
            scope: None,
            extra: group_claims(principal_claims),
        }
    }

    /// Serialize a ticket into an access token and, if `openid` is granted,
    /// an identity token.
    pub fn sign(&self, ticket: &Ticket) -> Result<SignedTokens> {
        let lifetimes = ticket.lifetimes();

        let access_claims = Claims {
            jti: Some(random_token()),
            scope: Some(ticket.scopes().join(" ")),
            ..self.claims(
                ticket,
                lifetimes.access_token,
                ticket.access_token_claims(),
            )
        };
        let access_token =
            encode(&self.header(), &access_claims, &self.private_key)?;

        let id_token = if ticket.has_scope(crate::issuer::scope::OPENID) {
            let identity_claims = self.claims(
                ticket,
                lifetimes.identity_token,
                ticket.identity_token_claims(),
            );
            Some(encode(&self.header(), &identity_claims, &self.private_key)?)
        } else {
            None
        };

        Ok(SignedTokens {
            access_token,
            id_token,
            expires_in: lifetimes.access_token.as_secs(),
        })
    }

    /// Decode and check a token issued for the configured audience.
    pub fn decode(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);

        Ok(decode::<Claims>(token, &self.public_key, &validation)?.claims)
    }
}

/// Claims sharing a type become a JSON array.
fn group_claims<'a>(claims: impl Iterator<Item = &'a Claim>) -> Map<String, Value> {
    let mut map = Map::new();

    for claim in claims.filter(|c| !REGISTERED_CLAIMS.contains(&c.kind.as_str())) {
        let value = Value::String(claim.value.clone());
        match map.get_mut(&claim.kind) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            },
            None => {
                map.insert(claim.kind.clone(), value);
            },
        }
    }

    map
}

#[cfg(test)]
pub(crate) fn test_token_manager() -> TokenManager {
    TokenManager::new(
        "https://auth.example.com/",
        "resource_server",
        Some("test".into()),
        include_str!("../fixtures/public_key.pem"),
        include_str!("../fixtures/private_key.pem"),
    )
    .expect("fixture keys")
}
