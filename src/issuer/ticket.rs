//! Authentication ticket handed to the token serializer.

use std::time::Duration;

use super::principal::{Claim, UserId};

/// Tokens a claim is serialized into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    AccessToken,
    IdentityToken,
    Both,
}

impl Destination {
    pub fn access_token(self) -> bool {
        matches!(self, Self::AccessToken | Self::Both)
    }

    pub fn identity_token(self) -> bool {
        matches!(self, Self::IdentityToken | Self::Both)
    }
}

/// A claim with its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketClaim {
    pub claim: Claim,
    pub destination: Destination,
}

/// Token lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetimes {
    pub access_token: Duration,
    pub identity_token: Duration,
    pub refresh_token: Duration,
}

/// Who is authenticated, with which claims, scopes and lifetimes.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    subject: UserId,
    scopes: Vec<String>,
    claims: Vec<TicketClaim>,
    audiences: Vec<String>,
    resources: Vec<String>,
    lifetimes: Lifetimes,
    security_stamp: Option<String>,
}

impl Ticket {
    pub fn builder(subject: UserId, lifetimes: Lifetimes) -> TicketBuilder {
        TicketBuilder {
            ticket: Ticket {
                subject,
                scopes: Vec::new(),
                claims: Vec::new(),
                audiences: Vec::new(),
                resources: Vec::new(),
                lifetimes,
                security_stamp: None,
            },
        }
    }

    pub fn subject(&self) -> &UserId {
        &self.subject
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn claims(&self) -> &[TicketClaim] {
        &self.claims
    }

    /// Claims serialized into access tokens.
    pub fn access_token_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims
            .iter()
            .filter(|c| c.destination.access_token())
            .map(|c| &c.claim)
    }

    /// Claims serialized into identity tokens.
    pub fn identity_token_claims(&self) -> impl Iterator<Item = &Claim> {
        self.claims
            .iter()
            .filter(|c| c.destination.identity_token())
            .map(|c| &c.claim)
    }

    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn lifetimes(&self) -> Lifetimes {
        self.lifetimes
    }

    /// Stamp captured at issuance, persisted with refresh tokens only.
    pub fn security_stamp(&self) -> Option<&str> {
        self.security_stamp.as_deref()
    }
}

/// Assemble a [`Ticket`] step by step.
#[derive(Debug)]
pub struct TicketBuilder {
    ticket: Ticket,
}

impl TicketBuilder {
    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.ticket.scopes = scopes;
        self
    }

    pub fn claim(mut self, claim: Claim, destination: Destination) -> Self {
        self.ticket.claims.push(TicketClaim { claim, destination });
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.ticket.audiences = vec![audience.to_owned()];
        self
    }

    pub fn resource(mut self, resource: &str) -> Self {
        self.ticket.resources = vec![resource.to_owned()];
        self
    }

    pub fn security_stamp(mut self, stamp: Option<String>) -> Self {
        self.ticket.security_stamp = stamp;
        self
    }

    pub fn build(self) -> Ticket {
        self.ticket
    }
}
