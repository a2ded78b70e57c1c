//! Based on OpenID Connect Discovery.
//! Path: /.well-known/openid-configuration

use std::sync::OnceLock;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::issuer::grant;
use crate::issuer::scope::ALLOWED_SCOPES;

const TOKEN_ENDPOINT: &str = "/connect/token";
const END_SESSION_ENDPOINT: &str = "/connect/logout";
const USERINFO_ENDPOINT: &str = "/users/@me";

static RESPONSE: OnceLock<Response> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    issuer: String,
    token_endpoint: String,
    end_session_endpoint: String,
    userinfo_endpoint: String,
    grant_types_supported: Vec<String>,
    response_types_supported: Vec<String>,
    id_token_signing_alg_values_supported: Vec<String>,
    token_endpoint_auth_methods_supported: Vec<String>,
    scopes_supported: Vec<String>,
    subject_types_supported: Vec<String>,
}

pub async fn handler(
    State(state): State<AppState>,
) -> Result<Json<&'static Response>, StatusCode> {
    if let Some(resp) = RESPONSE.get() {
        return Ok(Json(resp));
    }

    let constructed = build_response(&state)?;
    let response = RESPONSE.get_or_init(|| constructed);

    Ok(Json(response))
}

fn build_response(state: &AppState) -> Result<Response, StatusCode> {
    let base = Url::parse(&state.config.url).map_err(|err| {
        tracing::error!(error = %err, "issuer URL is invalid");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Response {
        issuer: state.config.url.clone(),
        token_endpoint: join_url(&base, TOKEN_ENDPOINT)?,
        end_session_endpoint: join_url(&base, END_SESSION_ENDPOINT)?,
        userinfo_endpoint: join_url(&base, USERINFO_ENDPOINT)?,
        grant_types_supported: [
            grant::PASSWORD,
            grant::AUTHORIZATION_CODE,
            grant::REFRESH_TOKEN,
        ]
        .map(str::to_owned)
        .to_vec(),
        response_types_supported: vec!["code".to_owned()],
        id_token_signing_alg_values_supported: vec![format!(
            "{:?}",
            state.token.algorithm()
        )],
        token_endpoint_auth_methods_supported: vec!["none".to_owned()],
        scopes_supported: ALLOWED_SCOPES.map(str::to_owned).to_vec(),
        subject_types_supported: vec!["public".to_owned()],
    })
}

fn join_url(base: &Url, path: &str) -> Result<String, StatusCode> {
    base.join(path)
        .map(|u| u.to_string())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_state;

    #[tokio::test]
    async fn test_discovery_document() {
        let (state, _) = test_state().await;
        let response = build_response(&state).unwrap();

        assert_eq!(response.issuer, "https://auth.example.com/");
        assert_eq!(
            response.token_endpoint,
            "https://auth.example.com/connect/token"
        );
        assert_eq!(
            response.end_session_endpoint,
            "https://auth.example.com/connect/logout"
        );
        assert_eq!(response.id_token_signing_alg_values_supported, ["ES384"]);
        assert_eq!(
            response.grant_types_supported,
            ["password", "authorization_code", "refresh_token"]
        );
        assert!(response.scopes_supported.contains(&"offline_access".to_owned()));
    }
}
