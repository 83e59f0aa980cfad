use axum::http::StatusCode;
use ulid::Ulid;

use crate::store::StoreError;

use super::validate::ValidationError;

/// Terminal failures of a request. Each maps to one HTTP status.
#[derive(Debug)]
pub enum RequestError {
    Validation(ValidationError),
    /// Missing identity or missing capability.
    Unauthorized(String),
    RateLimited { limit: u32 },
    Conflict {
        reason: String,
        conflicting_booking_id: Ulid,
    },
    InvalidReference { field: &'static str, id: String },
    NotFound(Ulid),
    /// Both the primary and the fallback store were unavailable.
    Unavailable(String),
    Internal(String),
}

impl RequestError {
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::Validation(_) | RequestError::InvalidReference { .. } => StatusCode::BAD_REQUEST,
            RequestError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RequestError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RequestError::Conflict { .. } => StatusCode::CONFLICT,
            RequestError::NotFound(_) => StatusCode::NOT_FOUND,
            RequestError::Unavailable(_) | RequestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for response bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::Validation(_) => "validation_error",
            RequestError::Unauthorized(_) => "unauthorized",
            RequestError::RateLimited { .. } => "rate_limited",
            RequestError::Conflict { .. } => "conflict",
            RequestError::InvalidReference { .. } => "invalid_reference",
            RequestError::NotFound(_) => "not_found",
            RequestError::Unavailable(_) => "unavailable",
            RequestError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Validation(e) => write!(f, "{e}"),
            RequestError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            RequestError::RateLimited { limit } => {
                write!(f, "rate limit exceeded: at most {limit} creations per window")
            }
            RequestError::Conflict {
                reason,
                conflicting_booking_id,
            } => write!(f, "scheduling conflict with booking {conflicting_booking_id}: {reason}"),
            RequestError::InvalidReference { field, id } => write!(f, "invalid {field}: {id}"),
            RequestError::NotFound(id) => write!(f, "not found: {id}"),
            RequestError::Unavailable(msg) => write!(f, "service unavailable: {msg}"),
            RequestError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<ValidationError> for RequestError {
    fn from(e: ValidationError) -> Self {
        RequestError::Validation(e)
    }
}

impl From<StoreError> for RequestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => RequestError::Unavailable(msg),
            StoreError::InvalidReference { field, id } => RequestError::InvalidReference { field, id },
            StoreError::NotFound(id) => RequestError::NotFound(id),
            StoreError::LimitExceeded(msg) => RequestError::Validation(ValidationError::single("tenant", msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (RequestError::Validation(ValidationError::single("title", "is required")), 400),
            (RequestError::InvalidReference { field: "clientId", id: "x".into() }, 400),
            (RequestError::Unauthorized("no role".into()), 401),
            (RequestError::NotFound(Ulid::nil()), 404),
            (
                RequestError::Conflict {
                    reason: "overlap".into(),
                    conflicting_booking_id: Ulid::nil(),
                },
                409,
            ),
            (RequestError::RateLimited { limit: 10 }, 429),
            (RequestError::Unavailable("down".into()), 500),
            (RequestError::Internal("boom".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
        }
    }

    #[test]
    fn store_errors_keep_their_category() {
        assert!(matches!(
            RequestError::from(StoreError::Unavailable("wal".into())),
            RequestError::Unavailable(_)
        ));
        assert!(matches!(
            RequestError::from(StoreError::InvalidReference { field: "serviceId", id: "s9".into() }),
            RequestError::InvalidReference { field: "serviceId", .. }
        ));
        assert_eq!(
            RequestError::from(StoreError::LimitExceeded("too many tenants")).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
