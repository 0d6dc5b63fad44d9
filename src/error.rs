//! Error taxonomy for the gateway (spec §7).
//!
//! `GatewayError` is a flat enum of *kinds*, not a type hierarchy: every
//! variant knows its own retryability and client-facing status, so the
//! retry policy in `executor` and the response envelope in `ingress` both
//! read off the same source of truth instead of re-deriving it.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error, Clone)]
pub enum GatewayError {
	#[error("missing environment variable {0}")]
	ConfigMissingEnv(String),

	#[error("secret not found: {0}")]
	SecretNotFound(String),

	#[error("secret file unreadable: {0}")]
	SecretFileUnreadable(String),

	#[error("secret file has no recognised field: {0}")]
	SecretNoField(String),

	#[error("oauth refresh failed: status={status} body={body}")]
	OAuthRefreshFailed { status: u16, body: String },

	#[error("oauth token expired and no refresh token is available")]
	OAuthExpiredNoRefresh,

	#[error("no provider target available for this request")]
	ErrNoProviderTarget,

	#[error("runtime not found for provider key {0}")]
	ErrRuntimeNotFound(String),

	#[error("provider not found: {0}")]
	ErrProviderNotFound(String),

	#[error("upstream rate limited (429)")]
	Http429,

	#[error("upstream server error ({0})")]
	Http5xx(u16),

	#[error("upstream client error ({0}): {1}")]
	Http4xx(u16, String),

	#[error("upstream request timed out")]
	Timeout,

	#[error("network error talking to upstream: {0}")]
	NetworkError(String),

	#[error("connection pool timed out waiting for a slot")]
	ConnectionTimeout,

	#[error("authentication error: {0}")]
	AuthenticationError(String),

	#[error("permission error: {0}")]
	PermissionError(String),

	#[error("validation error: {0}")]
	ValidationError(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("failed to decode upstream SSE stream: {0}")]
	SseDecodeError(String),

	#[error("server-tool follow-up failed: {0}")]
	ServerToolFailed(String),

	#[error("provider protocol error (status={status:?}): {message}")]
	ProviderProtocolError {
		status: Option<u16>,
		message: String,
	},

	#[error("internal error: {0}")]
	Internal(String),
}

impl GatewayError {
	/// Per spec §4.5.2 / §7: which errors the executor's attempt loop may retry.
	pub fn retryable(&self) -> bool {
		matches!(
			self,
			GatewayError::Http429
				| GatewayError::Http5xx(_)
				| GatewayError::Timeout
				| GatewayError::NetworkError(_)
				| GatewayError::ConnectionTimeout
				| GatewayError::ErrRuntimeNotFound(_)
				| GatewayError::ErrProviderNotFound(_)
		)
	}

	/// Whether this error is fatal regardless of attempt budget (spec §4.5.2, §4.6).
	pub fn fatal(&self) -> bool {
		matches!(
			self,
			GatewayError::SseDecodeError(_)
				| GatewayError::ServerToolFailed(_)
				| GatewayError::ProviderProtocolError { .. }
		)
	}

	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::ConfigMissingEnv(_) | GatewayError::SecretNotFound(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
			GatewayError::SecretFileUnreadable(_) | GatewayError::SecretNoField(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
			GatewayError::OAuthRefreshFailed { .. } | GatewayError::OAuthExpiredNoRefresh => {
				StatusCode::UNAUTHORIZED
			},
			GatewayError::ErrNoProviderTarget => StatusCode::SERVICE_UNAVAILABLE,
			GatewayError::ErrRuntimeNotFound(_) | GatewayError::ErrProviderNotFound(_) => {
				StatusCode::SERVICE_UNAVAILABLE
			},
			GatewayError::Http429 => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::Http5xx(_) => StatusCode::BAD_GATEWAY,
			GatewayError::Http4xx(status, _) => {
				StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
			},
			GatewayError::Timeout | GatewayError::ConnectionTimeout => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::NetworkError(_) => StatusCode::BAD_GATEWAY,
			GatewayError::AuthenticationError(_) => StatusCode::UNAUTHORIZED,
			GatewayError::PermissionError(_) => StatusCode::FORBIDDEN,
			GatewayError::ValidationError(_) => StatusCode::BAD_REQUEST,
			GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
			GatewayError::SseDecodeError(_) => StatusCode::BAD_GATEWAY,
			GatewayError::ServerToolFailed(_) => StatusCode::BAD_GATEWAY,
			GatewayError::ProviderProtocolError { status, .. } => status
				.and_then(|s| StatusCode::from_u16(s).ok())
				.unwrap_or(StatusCode::BAD_GATEWAY),
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn code(&self) -> &'static str {
		match self {
			GatewayError::ConfigMissingEnv(_) => "CONFIG_MISSING_ENV",
			GatewayError::SecretNotFound(_) => "SECRET_NOT_FOUND",
			GatewayError::SecretFileUnreadable(_) => "SECRET_FILE_UNREADABLE",
			GatewayError::SecretNoField(_) => "SECRET_NO_FIELD",
			GatewayError::OAuthRefreshFailed { .. } => "OAUTH_REFRESH_FAILED",
			GatewayError::OAuthExpiredNoRefresh => "OAUTH_EXPIRED_NO_REFRESH",
			GatewayError::ErrNoProviderTarget => "ERR_NO_PROVIDER_TARGET",
			GatewayError::ErrRuntimeNotFound(_) => "ERR_RUNTIME_NOT_FOUND",
			GatewayError::ErrProviderNotFound(_) => "ERR_PROVIDER_NOT_FOUND",
			GatewayError::Http429 => "HTTP_429",
			GatewayError::Http5xx(_) => "HTTP_5XX",
			GatewayError::Http4xx(_, _) => "HTTP_4XX",
			GatewayError::Timeout => "TIMEOUT",
			GatewayError::NetworkError(_) => "NETWORK_ERROR",
			GatewayError::ConnectionTimeout => "CONNECTION_TIMEOUT",
			GatewayError::AuthenticationError(_) => "AUTHENTICATION_ERROR",
			GatewayError::PermissionError(_) => "PERMISSION_ERROR",
			GatewayError::ValidationError(_) => "VALIDATION_ERROR",
			GatewayError::NotFound(_) => "NOT_FOUND",
			GatewayError::SseDecodeError(_) => "SSE_DECODE_ERROR",
			GatewayError::ServerToolFailed(_) => "SERVERTOOL_FOLLOWUP_FAILED",
			GatewayError::ProviderProtocolError { .. } => "PROVIDER_PROTOCOL_ERROR",
			GatewayError::Internal(_) => "INTERNAL",
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: ErrorObj,
}

#[derive(Serialize)]
struct ErrorObj {
	message: String,
	#[serde(rename = "type")]
	kind: &'static str,
	code: &'static str,
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let status = self.status();
		let body = ErrorBody {
			error: ErrorObj {
				message: self.to_string(),
				kind: if self.retryable() { "transient" } else { "fatal" },
				code: self.code(),
			},
		};
		(status, Json(body)).into_response()
	}
}

/// A terminal `event: error` SSE frame per spec §7's streaming envelope.
pub fn sse_error_frame(err: &GatewayError) -> String {
	let body = serde_json::json!({
		"error": {
			"message": err.to_string(),
			"type": if err.retryable() { "transient" } else { "fatal" },
			"code": err.code(),
		}
	});
	format!("event: error\ndata: {}\n\n", body)
}
