use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Device error: {0}")]
    DeviceError(#[from] DeviceError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl AppError {
    /// Stable machine-readable code, surfaced to clients next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidToken => "invalid_token",
                AuthError::Unauthorized => "unauthorized",
                AuthError::SessionExpired => "session_expired",
                AuthError::SessionMismatch => "session_mismatch",
                AuthError::RateLimited { .. } => "rate_limited",
                AuthError::LivenessUnavailable => "liveness_unavailable",
            },
            AppError::DeviceError(e) => match e {
                DeviceError::Conflict => "device_conflict",
                DeviceError::Revoked => "device_revoked",
                DeviceError::QuotaExceeded => "quota_exceeded",
                DeviceError::InvalidDeviceId(_) => "invalid_device_id",
            },
            AppError::DatabaseError(DatabaseError::NotFound) => "not_found",
            AppError::DatabaseError(DatabaseError::Duplicate) => "duplicate",
            AppError::DatabaseError(_) => "database_error",
            AppError::ConfigError(_) => "config_error",
            AppError::InternalError(_) => "internal_error",
            AppError::ValidationError(_) => "validation_error",
        }
    }

    /// True for errors after which the client should discard its tokens and log in again.
    pub fn requires_relogin(&self) -> bool {
        matches!(
            self,
            AppError::AuthError(
                AuthError::InvalidToken
                    | AuthError::SessionExpired
                    | AuthError::SessionMismatch
                    | AuthError::Unauthorized
            ) | AppError::DeviceError(DeviceError::Revoked)
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::DatabaseError(DatabaseError::NotFound),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::DatabaseError(DatabaseError::Duplicate)
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                AppError::DatabaseError(DatabaseError::ConnectionError(err.to_string()))
            }
            _ => AppError::DatabaseError(DatabaseError::QueryError(err.to_string())),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::AuthError(AuthError::SessionExpired)
            }
            _ => AppError::AuthError(AuthError::InvalidToken),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        // Server-side failures keep their detail in the logs only.
        let message = match self {
            AppError::AuthError(e) => e.to_string(),
            AppError::DeviceError(e) => e.to_string(),
            _ if status.is_server_error() => "Internal server error".to_string(),
            _ => self.to_string(),
        };
        let response = json!({
            "error": {
                "status": status.as_u16(),
                "code": self.code(),
                "message": message,
                "relogin": self.requires_relogin()
            }
        });

        let mut builder = HttpResponse::build(status);
        if let AppError::AuthError(AuthError::RateLimited { retry_after_secs, .. }) = self {
            builder.insert_header(("Retry-After", retry_after_secs.to_string()));
        }
        builder.json(response)
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
                AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
                AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
                AuthError::SessionMismatch => StatusCode::UNAUTHORIZED,
                AuthError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                AuthError::LivenessUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::DeviceError(e) => match e {
                DeviceError::Conflict => StatusCode::CONFLICT,
                DeviceError::Revoked => StatusCode::UNAUTHORIZED,
                DeviceError::QuotaExceeded => StatusCode::FORBIDDEN,
                DeviceError::InvalidDeviceId(_) => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::Duplicate) => StatusCode::CONFLICT,
            AppError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session does not match the presented credentials")]
    SessionMismatch,

    #[error("{message}")]
    RateLimited { message: String, retry_after_secs: u64 },

    #[error("Device status could not be verified, please retry")]
    LivenessUnavailable,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device is already bound to another account")]
    Conflict,

    #[error("Device has been signed out, please log in again")]
    Revoked,

    #[error("Device limit reached for this device type")]
    QuotaExceeded,

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,
}
