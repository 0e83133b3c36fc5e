//! Error handling subsystem. Implements a custom Error type.

use axum::{http::StatusCode, response::IntoResponse, Json};

use crate::prelude::*;
use crate::types::ErrorResponse;

pub type RmResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub enum Error {
	// Core errors
	NotFound,
	Unauthorized, // 401 - missing/invalid auth token
	PermissionDenied(String),
	DbError,
	Parse,

	// Tenant state
	TenantNotFound(String),
	TenantSuspended(String),
	TenantUnavailable(String),

	// Channel protocol
	ChannelError(String),
	RateLimited(String),
	TokenExpired,

	// Input validation and constraints
	ValidationError(String), // 400 - invalid input data

	// Network and external services
	NetworkError(String), // Network/cluster failures
	Timeout,              // Operation timeout

	// System and configuration
	ConfigError(String),        // Missing or invalid configuration
	ServiceUnavailable(String), // 503 - temporary system failures
	Internal(String),           // Internal invariant violations, for debugging
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?}", self)
	}
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
	fn into_response(self) -> axum::response::Response {
		let (status, code, message) = match self {
			Error::NotFound => (
				StatusCode::NOT_FOUND,
				"E-CORE-NOTFOUND".to_string(),
				"Resource not found".to_string(),
			),
			Error::Unauthorized => (
				StatusCode::UNAUTHORIZED,
				"E-AUTH-UNAUTH".to_string(),
				"Authentication required or invalid token".to_string(),
			),
			Error::PermissionDenied(msg) => (StatusCode::FORBIDDEN, "E-AUTH-NOPERM".to_string(), msg),
			Error::TenantNotFound(id) => (
				StatusCode::NOT_FOUND,
				"E-TENANT-NOTFOUND".to_string(),
				format!("Tenant not found: {}", id),
			),
			Error::TenantSuspended(id) => (
				StatusCode::FORBIDDEN,
				"E-TENANT-SUSPENDED".to_string(),
				format!("Tenant suspended: {}", id),
			),
			Error::TenantUnavailable(reason) => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-TENANT-UNAVAIL".to_string(),
				format!("Tenant unavailable: {}", reason),
			),
			Error::ChannelError(reason) => (
				StatusCode::UNPROCESSABLE_ENTITY,
				"E-CHAN-ERROR".to_string(),
				reason,
			),
			Error::RateLimited(what) => (
				StatusCode::TOO_MANY_REQUESTS,
				"E-RATE-LIMITED".to_string(),
				format!("Rate limit exceeded: {}", what),
			),
			Error::TokenExpired => (
				StatusCode::UNAUTHORIZED,
				"E-AUTH-EXPIRED".to_string(),
				"Token has expired".to_string(),
			),
			Error::ValidationError(msg) => (
				StatusCode::BAD_REQUEST,
				"E-VAL-INVALID".to_string(),
				format!("Request validation failed: {}", msg),
			),
			Error::Timeout => (
				StatusCode::REQUEST_TIMEOUT,
				"E-NET-TIMEOUT".to_string(),
				"Request timeout".to_string(),
			),
			Error::ServiceUnavailable(msg) => (
				StatusCode::SERVICE_UNAVAILABLE,
				"E-SYS-UNAVAIL".to_string(),
				format!("Service temporarily unavailable: {}", msg),
			),
			// Server errors (5xx) - no message exposure for security
			Error::DbError => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-CORE-DBERR".to_string(),
				"Internal server error".to_string(),
			),
			Error::Internal(msg) => {
				warn!("internal error: {}", msg);
				(
					StatusCode::INTERNAL_SERVER_ERROR,
					"E-CORE-INTERNAL".to_string(),
					"Internal server error".to_string(),
				)
			}
			Error::Parse => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-CORE-PARSE".to_string(),
				"Internal server error".to_string(),
			),
			Error::NetworkError(_) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-NET-ERROR".to_string(),
				"Internal server error".to_string(),
			),
			Error::ConfigError(_) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				"E-CONF-CFGERR".to_string(),
				"Internal server error".to_string(),
			),
		};

		let error_response = ErrorResponse::new(code, message);
		(status, Json(error_response)).into_response()
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		warn!("io error: {}", err);
		Self::NetworkError(format!("io error: {}", err))
	}
}

impl From<std::num::ParseIntError> for Error {
	fn from(_err: std::num::ParseIntError) -> Self {
		warn!("parse int error: {}", _err);
		Error::Parse
	}
}

impl From<std::time::SystemTimeError> for Error {
	fn from(_err: std::time::SystemTimeError) -> Self {
		warn!("system time error: {}", _err);
		Error::ServiceUnavailable("system time error".into())
	}
}

impl From<axum::Error> for Error {
	fn from(_err: axum::Error) -> Self {
		warn!("axum error: {}", _err);
		Error::NetworkError("axum error".into())
	}
}

impl From<axum::http::Error> for Error {
	fn from(_err: axum::http::Error) -> Self {
		warn!("http error: {}", _err);
		Error::NetworkError("http error".into())
	}
}

impl From<axum::http::header::ToStrError> for Error {
	fn from(_err: axum::http::header::ToStrError) -> Self {
		warn!("header to str error: {}", _err);
		Error::Parse
	}
}

impl From<serde_json::Error> for Error {
	fn from(_err: serde_json::Error) -> Self {
		warn!("json error: {}", _err);
		Error::Parse
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(_err: tokio::task::JoinError) -> Self {
		warn!("tokio join error: {}", _err);
		Error::ServiceUnavailable("task execution failed".into())
	}
}

impl From<jsonwebtoken::errors::Error> for Error {
	fn from(err: jsonwebtoken::errors::Error) -> Self {
		use jsonwebtoken::errors::ErrorKind;
		match err.kind() {
			ErrorKind::ExpiredSignature => Error::TokenExpired,
			_ => {
				warn!("jwt error: {}", err);
				Error::Unauthorized
			}
		}
	}
}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		match err {
			sqlx::Error::RowNotFound => Error::NotFound,
			err => {
				warn!("db error: {}", err);
				Error::DbError
			}
		}
	}
}

impl From<hyper::Error> for Error {
	fn from(_err: hyper::Error) -> Self {
		warn!("hyper error: {}", _err);
		Error::NetworkError("HTTP client error".into())
	}
}

impl From<hyper_util::client::legacy::Error> for Error {
	fn from(_err: hyper_util::client::legacy::Error) -> Self {
		warn!("hyper error: {}", _err);
		Error::NetworkError("HTTP client error".into())
	}
}

// vim: ts=4
