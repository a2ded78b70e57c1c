//! Token endpoint.
//! Path: /connect/token

use axum::Json;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::header;
use axum::response::IntoResponse;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::crypto::{digest, random_token};
use crate::error::{OAuthError, Result};
use crate::issuer::scope::{self, OFFLINE_ACCESS};
use crate::issuer::{GrantContext, GrantRequest, Ticket, grant};
use crate::ports::{StoredToken, TokenPersistence};
use crate::{AppState, telemetry};

pub const TOKEN_TYPE: &str = "Bearer";

const MAX_PARAMETER_LENGTH: u64 = 2048;

#[derive(Debug, Default, Deserialize, Validate)]
pub struct Body {
    #[validate(length(min = 1, max = 64))]
    pub grant_type: String,
    #[validate(length(max = 256))]
    pub username: Option<String>,
    #[validate(length(max = 1024))]
    pub password: Option<String>,
    #[validate(length(max = MAX_PARAMETER_LENGTH))]
    pub scope: Option<String>,
    #[validate(length(max = MAX_PARAMETER_LENGTH))]
    pub code: Option<String>,
    #[validate(length(max = 256))]
    pub client_id: Option<String>,
    #[validate(length(max = MAX_PARAMETER_LENGTH))]
    pub redirect_uri: Option<String>,
    #[validate(length(max = MAX_PARAMETER_LENGTH))]
    pub refresh_token: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

pub async fn handler(
    State(state): State<AppState>,
    body: std::result::Result<Form<Body>, FormRejection>,
) -> Result<impl IntoResponse> {
    let response = exchange(state, body).await;
    if let Err(err) = &response {
        telemetry::record_token_error(err);
    }

    response
}

async fn exchange(
    state: AppState,
    body: std::result::Result<Form<Body>, FormRejection>,
) -> Result<([(header::HeaderName, &'static str); 1], Json<Response>)> {
    let Form(body) =
        body.map_err(|err| OAuthError::InvalidRequest(err.body_text()))?;
    body.validate()
        .map_err(|err| OAuthError::InvalidRequest(err.to_string()))?;

    let request = grant_request(state.db.tokens.as_ref(), body).await?;
    let ticket = state.issuer.exchange(request).await?;
    let tokens = state.token.sign(&ticket)?;

    let refresh_token = if ticket.has_scope(OFFLINE_ACCESS) {
        Some(issue_refresh_token(state.db.tokens.as_ref(), &ticket).await?)
    } else {
        None
    };

    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(Response {
            access_token: tokens.access_token,
            token_type: TOKEN_TYPE.to_owned(),
            expires_in: tokens.expires_in,
            scope: ticket.scopes().join(" "),
            id_token: tokens.id_token,
            refresh_token,
        }),
    ))
}

fn missing(parameter: &str) -> OAuthError {
    OAuthError::InvalidRequest(format!(
        "The mandatory '{parameter}' parameter is missing."
    ))
}

/// Map form parameters to a [`GrantRequest`], redeeming codes and refresh
/// tokens on the way.
pub async fn grant_request(
    tokens: &dyn TokenPersistence,
    body: Body,
) -> Result<GrantRequest> {
    match body.grant_type.as_str() {
        grant::PASSWORD => {
            let username = body.username.ok_or_else(|| missing("username"))?;
            let password = body.password.ok_or_else(|| missing("password"))?;

            Ok(GrantRequest::Password {
                username,
                password,
                scopes: scope::parse(body.scope.as_deref()),
            })
        },
        grant::AUTHORIZATION_CODE => {
            let code = body.code.ok_or_else(|| missing("code"))?;
            let client_id = body.client_id.ok_or_else(|| missing("client_id"))?;

            let context = redeem_authorization_code(
                tokens,
                &code,
                &client_id,
                body.redirect_uri.as_deref(),
            )
            .await?;
            Ok(GrantRequest::AuthorizationCode(context))
        },
        grant::REFRESH_TOKEN => {
            let refresh_token =
                body.refresh_token.ok_or_else(|| missing("refresh_token"))?;

            let context = redeem_refresh_token(tokens, &refresh_token).await?;
            Ok(GrantRequest::RefreshToken(context))
        },
        other => Ok(GrantRequest::Unsupported(other.to_owned())),
    }
}

/// Consume an authorization code bound to `client_id` and `redirect_uri`.
pub async fn redeem_authorization_code(
    tokens: &dyn TokenPersistence,
    code: &str,
    client_id: &str,
    redirect_uri: Option<&str>,
) -> Result<GrantContext> {
    let Some(stored) = tokens.redeem_authorization_code(&digest(code)).await?
    else {
        return Err(OAuthError::INVALID_AUTHORIZATION_CODE.into());
    };

    let redirect_matches = stored
        .redirect_uri
        .as_deref()
        .is_none_or(|expected| Some(expected) == redirect_uri);

    if stored.expires_at <= Utc::now()
        || stored.client_id != client_id
        || !redirect_matches
    {
        tracing::debug!(%client_id, "authorization code rejected");
        return Err(OAuthError::INVALID_AUTHORIZATION_CODE.into());
    }

    Ok(stored.context)
}

/// Rotate a refresh token. Presenting a revoked token again revokes every
/// token of its subject.
pub async fn redeem_refresh_token(
    tokens: &dyn TokenPersistence,
    refresh_token: &str,
) -> Result<GrantContext> {
    let hash = digest(refresh_token);
    let Some(stored) = tokens.find_refresh_token(&hash).await? else {
        return Err(OAuthError::INVALID_REFRESH_TOKEN.into());
    };

    if stored.revoked || !tokens.revoke_refresh_token(&hash).await? {
        tracing::warn!(
            user_id = %stored.context.subject,
            "revoked refresh token presented, revoking subject tokens"
        );
        telemetry::record_refresh_replay();
        tokens.revoke_all_for_subject(&stored.context.subject).await?;
        return Err(OAuthError::INVALID_REFRESH_TOKEN.into());
    }

    if stored.expires_at <= Utc::now() {
        return Err(OAuthError::INVALID_REFRESH_TOKEN.into());
    }

    Ok(stored.context)
}

/// Persist a new refresh token for the ticket and return its raw value.
/// Every other refresh token of the subject is revoked in the same unit.
pub async fn issue_refresh_token(
    tokens: &dyn TokenPersistence,
    ticket: &Ticket,
) -> Result<String> {
    let refresh_token = random_token();
    let lifetime = TimeDelta::from_std(ticket.lifetimes().refresh_token)
        .unwrap_or(TimeDelta::MAX);
    let now = Utc::now();

    let revoked = tokens
        .replace_refresh_tokens(&StoredToken {
            hash: digest(&refresh_token),
            context: GrantContext {
                subject: ticket.subject().clone(),
                scopes: ticket.scopes().to_vec(),
                security_stamp: ticket.security_stamp().map(str::to_owned),
            },
            expires_at: now
                .checked_add_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            revoked: false,
        })
        .await?;
    if revoked > 0 {
        tracing::debug!(user_id = %ticket.subject(), revoked, "refresh tokens superseded");
    }

    Ok(refresh_token)
}
