//! Scope intersection, permission expansion and claim destinations.

use std::collections::HashSet;

use super::principal::{Claim, EMAIL, NAME, PERMISSION, ROLE};
use super::ticket::Destination;

pub const OPENID: &str = "openid";
pub const EMAIL_SCOPE: &str = "email";
pub const PROFILE: &str = "profile";
pub const OFFLINE_ACCESS: &str = "offline_access";
pub const ROLES: &str = "roles";

/// Scopes a client may be granted.
pub const ALLOWED_SCOPES: [&str; 5] =
    [OPENID, EMAIL_SCOPE, PROFILE, OFFLINE_ACCESS, ROLES];

/// Split a space-delimited `scope` parameter.
pub fn parse(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

/// Keep requested scopes that are allowed, in the caller's order.
pub fn intersect<S: AsRef<str>>(requested: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();

    requested
        .iter()
        .map(AsRef::as_ref)
        .filter(|scope| ALLOWED_SCOPES.contains(scope))
        .filter(|scope| seen.insert(*scope))
        .map(str::to_owned)
        .collect()
}

/// Union of `permission` claim values across role claim sets.
/// Order is first-seen.
pub fn fold_permissions<I>(role_claims: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<Claim>>,
{
    role_claims
        .into_iter()
        .flatten()
        .filter(|claim| claim.is(PERMISSION))
        .fold(Vec::new(), |mut permissions, claim| {
            if !permissions.contains(&claim.value) {
                permissions.push(claim.value);
            }
            permissions
        })
}

/// Where a principal claim is serialized given the granted scopes.
pub fn destination_for(claim: &Claim, scopes: &[String]) -> Destination {
    let granted = |scope: &str| scopes.iter().any(|s| s == scope);

    if (claim.is(NAME) && granted(PROFILE))
        || (claim.is(EMAIL) && granted(EMAIL_SCOPE))
        || (claim.is(ROLE) && granted(ROLES))
    {
        Destination::Both
    } else {
        Destination::AccessToken
    }
}
