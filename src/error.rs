//! Error handler for the issuer.

use axum::extract::rejection::FormRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

/// OAuth2 protocol errors, surfaced to clients with a `400` status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidGrant(&'static str),

    #[error("The specified grant type is not supported.")]
    UnsupportedGrantType,

    #[error("{0}")]
    InvalidRequest(String),
}

impl OAuthError {
    pub const INVALID_CREDENTIALS: Self =
        Self::InvalidGrant("The username/password couple is invalid.");
    pub const TOKEN_NO_LONGER_VALID: Self =
        Self::InvalidGrant("The token is no longer valid.");
    pub const SIGN_IN_NOT_ALLOWED: Self =
        Self::InvalidGrant("The user is no longer allowed to sign in.");
    pub const INVALID_AUTHORIZATION_CODE: Self =
        Self::InvalidGrant("The specified authorization code is invalid.");
    pub const INVALID_REFRESH_TOKEN: Self =
        Self::InvalidGrant("The specified refresh token is invalid.");

    /// OAuth2 `error` field.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// OAuth2 error body.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    pub error_description: String,
}

impl From<&OAuthError> for OAuthErrorResponse {
    fn from(err: &OAuthError) -> Self {
        Self {
            error: err.error_code().to_owned(),
            error_description: err.to_string(),
        }
    }
}

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error("{0}")]
    BadRequest(String),

    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Form(#[from] FormRejection),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid anti-forgery token")]
    AntiForgery,

    #[error("invalid 'Authorization' header")]
    Unauthorized,

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ServerError {
    /// Current user cannot be resolved from the request.
    pub fn no_user_found() -> Self {
        Self::BadRequest("No user found".to_owned())
    }
}

/// Box any adapter error into [`ServerError::Internal`].
pub trait ToInternal<T> {
    fn catch(self) -> Result<T>;
}

impl<T, E> ToInternal<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn catch(self) -> Result<T> {
        self.map_err(|err| ServerError::Internal {
            details: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        json_response(self.status, &self)
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

fn json_response<T: Serialize>(
    status: u16,
    body: &T,
) -> std::result::Result<Response, axum::http::Error> {
    if let Ok(body) = serde_json::to_string(body) {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CACHE_CONTROL, "no-store")
            .body(body.into())
    } else {
        Ok(internal_server_error())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        if let ServerError::OAuth(err) = &self {
            tracing::debug!(error = err.error_code(), "oauth request rejected");
            return json_response(
                StatusCode::BAD_REQUEST.as_u16(),
                &OAuthErrorResponse::from(err),
            )
            .unwrap_or_else(|_| internal_server_error());
        }

        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::BadRequest(message) => {
                response.title("Bad request.").details(message)
            },

            ServerError::Form(err) => response
                .title("Server error during data parsing.")
                .details(&err.body_text()),

            ServerError::AntiForgery => {
                response.title("Missing or invalid anti-forgery token.")
            },

            ServerError::Unauthorized => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Sql(err) => {
                tracing::error!(error = %err, "database request failed");
                ResponseError::default()
            },

            ServerError::Jwt(err) => {
                tracing::error!(error = %err, "token signing failed");
                ResponseError::default()
            },

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                ResponseError::default()
            },

            ServerError::OAuth(_) => response,
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
