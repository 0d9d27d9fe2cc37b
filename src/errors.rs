use axum::extract::ws::close_code;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Upstream domain code for a rejected display password request.
pub const CODE_WRONG_PASSWORD: i64 = 5090;
/// Upstream domain code for an unknown user.
pub const CODE_USER_NOT_FOUND: i64 = 5098;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid bearer token")]
    InvalidToken,
    #[error("bearer token expired at {0}")]
    TokenExpired(DateTime<Utc>),
    #[error("session not found or expired")]
    SessionExpired,
    #[error("Too many connections for this VM")]
    VmCapacity,
    #[error("too many connections")]
    GlobalCapacity,
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream rejected request ({code}): {message}")]
    UpstreamRejected { code: i64, message: String },
    #[error("vm {0} not found")]
    VmNotFound(String),
    #[error("forbidden")]
    Forbidden,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("failed to connect to {addr} after {attempts} attempts: {source}")]
    DialFailed {
        addr: String,
        attempts: u32,
        source: std::io::Error,
    },
    #[error("invalid request path: {0}")]
    InvalidPath(String),
    #[error("inbound buffer limit exceeded")]
    BufferOverflow,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// WebSocket close code the dispatcher sends for this failure.
    pub fn close_code(&self) -> u16 {
        match self {
            GatewayError::MissingToken
            | GatewayError::InvalidToken
            | GatewayError::TokenExpired(_)
            | GatewayError::SessionExpired
            | GatewayError::VmCapacity
            | GatewayError::GlobalCapacity
            | GatewayError::Forbidden
            | GatewayError::Unauthenticated => close_code::POLICY,
            GatewayError::UpstreamRejected { code, .. }
                if *code == CODE_WRONG_PASSWORD || *code == CODE_USER_NOT_FOUND =>
            {
                close_code::POLICY
            }
            GatewayError::InvalidPath(_) => close_code::PROTOCOL,
            _ => close_code::ERROR,
        }
    }

    /// Auth-shaped failures log at info; everything else at warn.
    pub fn is_auth_shaped(&self) -> bool {
        self.close_code() == close_code::POLICY
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::MissingToken
            | GatewayError::InvalidToken
            | GatewayError::TokenExpired(_)
            | GatewayError::SessionExpired
            | GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::VmNotFound(_) | GatewayError::InvalidPath(_) => StatusCode::NOT_FOUND,
            GatewayError::VmCapacity | GatewayError::GlobalCapacity => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::UpstreamUnreachable(_)
            | GatewayError::UpstreamRejected { .. }
            | GatewayError::DialFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let code = match status.as_u16() {
            401 => "unauthorized",
            403 => "forbidden",
            404 => "not_found",
            429 => "capacity_exceeded",
            502 => "upstream_failed",
            _ => "internal_error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
