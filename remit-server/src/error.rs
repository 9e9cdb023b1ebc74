//! Maps domain error kinds onto HTTP statuses. Every 4xx carries a stable
//! `error` string and, for business rules, a machine-readable `code`; 5xx
//! bodies are stripped of detail in production mode.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use remit_billing::BillingError;
use remit_billing::BusinessCode;
use remit_idempotency::IdempotencyError;
use remit_webhooks::WebhookError;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: error.into(),
                code: None,
            },
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.body.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    #[must_use]
    pub fn internal(production: bool, detail: impl Into<String>) -> Self {
        if production {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        } else {
            Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
        }
    }

    #[must_use]
    pub fn from_billing(err: BillingError, production: bool) -> Self {
        match err {
            BillingError::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            BillingError::PciViolation(field) => Self::new(
                StatusCode::BAD_REQUEST,
                format!("field {field} must not be sent; use a processor token"),
            )
            .with_code("PCI_FIELD_FORBIDDEN"),
            BillingError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, what),
            BillingError::Conflict(message) => Self::new(StatusCode::CONFLICT, message),
            BillingError::Business { code, message } => {
                // The endpoint table documents charge-not-settled as a 409;
                // the remaining business rules are 422s.
                let status = if code == BusinessCode::ChargeNotSettled {
                    StatusCode::CONFLICT
                } else {
                    StatusCode::UNPROCESSABLE_ENTITY
                };
                Self::new(status, message).with_code(code.as_str())
            }
            BillingError::Processor(processor) => {
                let status = if processor.retriable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                };
                let message = if production {
                    "payment processor error".to_string()
                } else {
                    processor.to_string()
                };
                Self::new(status, message).with_code(processor.code)
            }
            BillingError::Internal(detail) => Self::internal(production, detail),
        }
    }

    #[must_use]
    pub fn from_idempotency(err: IdempotencyError, production: bool) -> Self {
        match err {
            IdempotencyError::KeyReuseMismatch => Self::new(
                StatusCode::CONFLICT,
                "idempotency key reused with a different request",
            )
            .with_code("IDEMPOTENCY_KEY_REUSE"),
            IdempotencyError::Storage(detail) => Self::internal(production, detail),
        }
    }

    #[must_use]
    pub fn from_webhook(err: WebhookError, production: bool) -> Self {
        match err {
            WebhookError::Malformed(message) => Self::new(StatusCode::BAD_REQUEST, message),
            WebhookError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, what),
            WebhookError::InvalidState(message) => Self::new(StatusCode::CONFLICT, message),
            WebhookError::Storage(detail) => Self::internal(production, detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
