//! OpenID Connect token endpoint issuing access, identity and refresh tokens.
#![forbid(unsafe_code)]

mod crypto;
mod database;
pub mod error;
pub mod issuer;
pub mod ports;
mod router;
pub mod telemetry;
mod token;
mod well_known;

pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post};
use axum::{Router, middleware as AxumMiddleware};
use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub issuer: issuer::TokenIssuer,
    pub token: token::TokenManager,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `POST /connect/token` exchanges a grant for tokens.
        .route("/connect/token", post(router::token::handler))
        // `POST /connect/logout` ends the browser session.
        .route("/connect/logout", post(router::logout::handler))
        // `GET /users/@me` requires a bearer access token.
        .route("/users/@me", get(router::users::me))
        .with_state(state.clone())
        .nest("/.well-known", well_known::well_known(state))
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Read `config.yaml`, from `CONFIG_PATH` when set.
pub fn read_configuration() -> Result<Arc<config::Configuration>, BoxError> {
    let path = std::env::var("CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_default();

    Ok(config::Configuration::default().path(path).read()?)
}

/// Initialize the application state.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, BoxError> {
    let passwords = crypto::PasswordManager::new(config.argon2.clone())?;
    let lockout = database::LockoutPolicy::from(&config.lockout);
    let stamp_claim = config.jwt.security_stamp_claim_type.as_str();

    let db = match &config.postgres {
        Some(postgres) => {
            database::Database::postgres(postgres, passwords, lockout, stamp_claim)
                .await?
        },
        None => {
            tracing::warn!(
                "missing `postgres` entry on `config.yaml` file, data is kept in memory"
            );
            let store =
                database::memory::MemoryStore::new(passwords, lockout, stamp_claim);
            store.seed(&config.memory).await?;
            database::Database::from_store(Arc::new(store))
        },
    };

    // handle jwt.
    if config.jwt.private_key_pem.is_empty() {
        tracing::error!("missing `jwt.private_key_pem` entry on `config.yaml` file");
        return Err("no signing key configured".into());
    }
    let token = token::TokenManager::new(
        &config.url,
        &config.jwt.audience,
        config.jwt.key_id.clone(),
        &config.jwt.public_key_pem,
        &config.jwt.private_key_pem,
    )?;

    let issuer = issuer::TokenIssuer::new(
        db.credentials.clone(),
        db.principals.clone(),
        db.roles.clone(),
        db.tokens.clone(),
        config.issuer_options(),
    );

    Ok(AppState {
        config,
        db,
        issuer,
        token,
    })
}

#[cfg(test)]
const TEST_CONFIG: &str = r#"
name: issuer
url: auth.example.com
session:
  post_logout_redirect_uris:
    - https://app.example.com/bye
"#;

/// State over in-memory stores seeded with `alice` and `bob`.
#[cfg(test)]
pub(crate) async fn test_state() -> (AppState, Arc<database::memory::MemoryStore>) {
    let config = Arc::new(
        config::Configuration::default()
            .from_yaml(TEST_CONFIG)
            .expect("test configuration"),
    );
    let store = issuer::tests::seeded_store().await;
    let db = database::Database::from_store(store.clone());
    let issuer = issuer::TokenIssuer::new(
        db.credentials.clone(),
        db.principals.clone(),
        db.roles.clone(),
        db.tokens.clone(),
        config.issuer_options(),
    );

    let state = AppState {
        config,
        db,
        issuer,
        token: token::test_token_manager(),
    };

    (state, store)
}

/// MUST NEVER be used in production.
#[cfg(test)]
pub(crate) async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    headers: &[(&str, &str)],
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let request = headers
        .iter()
        .fold(Request::builder().method(method).uri(path), |builder, (name, value)| {
            builder.header(*name, *value)
        })
        .body(axum::body::Body::from(body))
        .unwrap();

    app.oneshot(request).await.unwrap()
}
