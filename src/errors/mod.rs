// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User-facing API errors.
//!
//! Every error answered over HTTP carries a unique reference code that also
//! appears in the server log, so a client report can be matched to the
//! internal details.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::error::QueueError;

// =============================================================================
// ERROR REFERENCE CODE GENERATION
// =============================================================================

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20240115-A3F8K2)
pub fn generate_reference_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let random: String = (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("ERR-{}-{}", date, random)
}

// =============================================================================
// USER-FACING ERROR TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// Malformed or empty request (400)
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// Unknown job (404)
    NotFound { message: String, reference: String },

    /// Job is in the wrong state for the command (409)
    Conflict { message: String, reference: String },

    /// Queue full or shutting down (503)
    ServiceUnavailable {
        message: String,
        reference: String,
        retry_after_secs: Option<u64>,
    },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. }
            | ApiError::NotFound { reference, .. }
            | ApiError::Conflict { reference, .. }
            | ApiError::ServiceUnavailable { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::ServiceUnavailable { message, .. } => message,
        }
    }

    pub fn invalid_request(message: impl Into<String>, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        let message = message.into();
        tracing::warn!(reference = %reference, field = ?field, error = %message, "Invalid request");
        Self::InvalidRequest {
            message,
            reference,
            field: field.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (Reference: {})", self.message(), self.reference())
    }
}

impl std::error::Error for ApiError {}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let reference = generate_reference_code();
        let message = err.to_string();
        tracing::info!(reference = %reference, error = %message, "Request rejected");
        match err {
            QueueError::UrlRequired => Self::InvalidRequest {
                message,
                reference,
                field: Some("URL".to_string()),
            },
            QueueError::NotFound(_) => Self::NotFound { message, reference },
            QueueError::AlreadyFinished(_)
            | QueueError::NotPausable(_)
            | QueueError::NotPaused(_)
            | QueueError::NotRetryable(_) => Self::Conflict { message, reference },
            QueueError::QueueFull { .. } => Self::ServiceUnavailable {
                message,
                reference,
                retry_after_secs: Some(30),
            },
            QueueError::ShuttingDown => Self::ServiceUnavailable {
                message,
                reference,
                retry_after_secs: None,
            },
        }
    }
}

/// JSON body of an error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ApiError,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };
        (status, Json(body)).into_response()
    }
}
