//! Authenticated principal and its claims.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Claim type of the subject identifier.
pub const SUBJECT: &str = "sub";
/// Claim type of the display name.
pub const NAME: &str = "name";
/// Claim type of the email address.
pub const EMAIL: &str = "email";
/// Claim type of a role membership.
pub const ROLE: &str = "role";
/// Claim type of a permission granted through a role.
pub const PERMISSION: &str = "permission";
/// Claim type carrying the current user identifier inside access tokens.
pub const USER_ID: &str = "uid";

/// Stable user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed statement about a principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Claim {
    pub kind: String,
    pub value: String,
}

impl Claim {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// A stored security principal.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
    pub roles: Vec<String>,
    pub claims: Vec<Claim>,
}

impl Principal {
    /// Build a principal with its base claims (`sub`, `name`, `email`,
    /// security stamp).
    pub fn new(
        id: impl Into<String>,
        username: impl Into<String>,
        email: Option<String>,
        security_stamp: Option<(&str, String)>,
    ) -> Self {
        let id = UserId::new(id);
        let username = username.into();

        let mut claims = vec![
            Claim::new(SUBJECT, id.as_str()),
            Claim::new(NAME, username.clone()),
        ];
        if let Some(email) = email {
            claims.push(Claim::new(EMAIL, email));
        }
        if let Some((kind, stamp)) = security_stamp {
            claims.push(Claim::new(kind, stamp));
        }

        Self {
            id,
            username,
            roles: Vec::new(),
            claims,
        }
    }

    /// Assign roles to the principal.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// First value of a claim type.
    pub fn find_first(&self, kind: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|claim| claim.is(kind))
            .map(|claim| claim.value.as_str())
    }
}
