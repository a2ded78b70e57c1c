//! Logout endpoint.
//! Path: /connect/logout

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Redirect;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde::Deserialize;
use url::Url;
use validator::Validate;

use crate::error::{Result, ServerError};
use crate::router::Valid;
use crate::AppState;

/// Cookie holding the anti-forgery token.
pub const ANTIFORGERY_COOKIE: &str = "csrf_token";
/// Header alternative to the `csrf_token` form field.
pub const ANTIFORGERY_HEADER: &str = "x-csrf-token";

#[derive(Debug, Default, Deserialize, Validate)]
pub struct Body {
    #[validate(length(max = 256))]
    csrf_token: Option<String>,
    #[validate(length(max = 2048))]
    post_logout_redirect_uri: Option<String>,
    #[validate(length(max = 512))]
    state: Option<String>,
}

pub async fn handler(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Valid(body): Valid<Body>,
) -> Result<(CookieJar, Redirect)> {
    let presented = body.csrf_token.as_deref().or_else(|| {
        headers
            .get(ANTIFORGERY_HEADER)
            .and_then(|value| value.to_str().ok())
    });

    match (jar.get(ANTIFORGERY_COOKIE), presented) {
        (Some(cookie), Some(token))
            if !token.is_empty() && cookie.value() == token => {},
        _ => return Err(ServerError::AntiForgery),
    }

    let session_cookie = state.config.session.cookie_name.clone();
    let Some(session) = jar.get(&session_cookie) else {
        return Err(ServerError::Unauthorized);
    };
    state.db.sessions.sign_out(session.value()).await?;
    tracing::debug!("session signed out");

    let target = redirect_target(
        &state.config.session,
        body.post_logout_redirect_uri.as_deref(),
        body.state.as_deref(),
    );

    let jar = jar
        .remove(Cookie::build((session_cookie, "")).path("/"))
        .remove(Cookie::build((ANTIFORGERY_COOKIE, "")).path("/"));

    Ok((jar, Redirect::to(&target)))
}

/// Registered post-logout URI with `state` echoed, or the default one.
fn redirect_target(
    session: &crate::config::Session,
    requested: Option<&str>,
    state: Option<&str>,
) -> String {
    let registered = requested.filter(|uri| {
        session
            .post_logout_redirect_uris
            .iter()
            .any(|allowed| allowed == uri)
    });

    match registered.map(Url::parse) {
        Some(Ok(mut url)) => {
            if let Some(state) = state {
                url.query_pairs_mut().append_pair("state", state);
            }
            url.to_string()
        },
        Some(Err(err)) => {
            tracing::warn!(error = %err, "registered post-logout URI is invalid");
            session.default_logout_redirect.clone()
        },
        None => session.default_logout_redirect.clone(),
    }
}
