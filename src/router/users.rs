//! Users-related HTTP API.

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use crate::issuer::Principal;
use crate::issuer::principal::{EMAIL, USER_ID};
use crate::{AppState, ServerError};

const BEARER: &str = "Bearer ";

/// Principal behind the request's bearer access token.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Principal);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .and_then(|header| header.strip_prefix(BEARER))
            .ok_or(ServerError::Unauthorized)?;

        let claims = state.token.decode(token.trim()).map_err(|err| {
            tracing::debug!(error = %err, "bearer token rejected");
            ServerError::Unauthorized
        })?;

        let user = state.issuer.current_user(claims.find_first(USER_ID)).await?;
        Ok(CurrentUser(user))
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

impl From<Principal> for Response {
    fn from(user: Principal) -> Self {
        Self {
            email: user.find_first(EMAIL).map(str::to_owned),
            id: user.id.to_string(),
            username: user.username,
            roles: user.roles,
        }
    }
}

/// `GET /users/@me`.
pub async fn me(CurrentUser(user): CurrentUser) -> Json<Response> {
    Json(Response::from(user))
}
