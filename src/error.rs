//! Error taxonomy shared by the dispatch core, the credential layer and storage.
//!
//! Variants carry only identifiers, status codes and short categories. Vendor
//! response bodies are kept out of `Display` so they never reach logs.

use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Unknown or inactive vendor. Never retried.
    #[error("vendor not found: {0}")]
    VendorNotFound(String),

    /// Stored credential could not be recovered (wrong secret, corrupted blob).
    #[error("vendor credential could not be decrypted")]
    DecryptionFailed,

    #[error("vendor '{vendor}' did not respond within {timeout_secs}s")]
    VendorTimeout { vendor: String, timeout_secs: u64 },

    /// Connection failures, 5xx and 429 responses.
    #[error("transient failure from vendor '{vendor}': {reason}")]
    VendorTransient {
        vendor: String,
        status: Option<u16>,
        reason: String,
    },

    /// Non-retryable vendor answer. The body is handed back to the caller
    /// verbatim but is not part of the message.
    #[error("vendor '{vendor}' rejected the request with status {status}")]
    VendorRejected {
        vendor: String,
        status: u16,
        body: Bytes,
    },

    #[error("malformed response from vendor '{vendor}': {reason}")]
    MalformedResponse { vendor: String, reason: String },

    /// Failure after chunks were already relayed to the caller.
    #[error("stream from vendor '{vendor}' interrupted: {reason}")]
    StreamInterrupted { vendor: String, reason: String },

    #[error("dispatch to vendor '{vendor}' gave up after {attempts} attempts: {last}")]
    DispatchExhausted {
        vendor: String,
        attempts: u32,
        last: Box<GatewayError>,
    },

    /// The commit of a unit of work failed; nothing was persisted.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse outcome of a dispatch, as reported to callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStatus {
    Success,
    VendorError,
    Timeout,
    ExhaustedRetries,
}

impl GatewayError {
    /// Whether the dispatcher may spend another attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::VendorTimeout { .. } | GatewayError::VendorTransient { .. }
        )
    }

    pub fn dispatch_status(&self) -> DispatchStatus {
        match self {
            GatewayError::VendorTimeout { .. } => DispatchStatus::Timeout,
            GatewayError::DispatchExhausted { .. } => DispatchStatus::ExhaustedRetries,
            _ => DispatchStatus::VendorError,
        }
    }

    /// Short machine-readable category used in JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::VendorNotFound(_) => "vendor_not_found",
            GatewayError::DecryptionFailed => "decryption_failed",
            GatewayError::VendorTimeout { .. } => "vendor_timeout",
            GatewayError::VendorTransient { .. } => "vendor_transient_error",
            GatewayError::VendorRejected { .. } => "vendor_rejected",
            GatewayError::MalformedResponse { .. } => "malformed_response",
            GatewayError::StreamInterrupted { .. } => "stream_interrupted",
            GatewayError::DispatchExhausted { .. } => "dispatch_exhausted",
            GatewayError::TransactionFailed(_) => "transaction_failed",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::InvalidInput(_) => "invalid_request_error",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Storage(_) => "storage_error",
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::VendorNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::VendorRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::VendorTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DispatchExhausted { last, .. } => match last.as_ref() {
                GatewayError::VendorTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::BAD_GATEWAY,
            },
            GatewayError::VendorTransient { .. }
            | GatewayError::MalformedResponse { .. }
            | GatewayError::StreamInterrupted { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::DecryptionFailed
            | GatewayError::TransactionFailed(_)
            | GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let GatewayError::VendorRejected { body, .. } = self {
            if !body.is_empty() {
                return HttpResponse::build(self.status_code())
                    .insert_header(ContentType::json())
                    .body(body.clone());
            }
        }
        let mut error = serde_json::json!({
            "message": self.to_string(),
            "type": self.kind(),
        });
        if let GatewayError::DispatchExhausted { attempts, .. } = self {
            error["attempts"] = serde_json::json!(attempts);
        }
        HttpResponse::build(self.status_code()).json(serde_json::json!({ "error": error }))
    }
}
