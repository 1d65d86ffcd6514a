use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Standard JSON error envelope returned by every handler.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Not Found", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Structured details (e.g. the full list of stock shortages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// One cart or payment line that cannot be satisfied by current stock.
///
/// Stock validation is batch-style: every line is checked and every
/// shortage is reported, so a client can fix the whole cart in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockShortage {
    pub product_id: Uuid,
    pub name: String,
    pub requested: i32,
    pub available: i32,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient stock for {} product(s)", .0.len())]
    InsufficientStock(Vec<StockShortage>),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Hash error: {0}")]
    HashError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::HashError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientStock(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal and upstream errors return generic messages; the full
    /// error is logged where it occurred.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::HashError(_) | Self::InternalError(_) => "Internal server error".to_string(),
            Self::ExternalServiceError(_) => "Payment gateway unavailable".to_string(),
            Self::RateLimitExceeded => "Rate limit exceeded".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured payload attached to the response body, when the
    /// variant carries one.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InsufficientStock(shortages) => Some(json!(shortages)),
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

/// API error type for HTTP handlers. Wraps `ServiceError` and adds the
/// handler-level failure modes that never reach a service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    InternalServerError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Delegate to ServiceError's unified status/message methods when applicable
        let (status, message, details) = match &self {
            ApiError::ServiceError(service_error) => (
                service_error.status_code(),
                service_error.response_message(),
                service_error.details(),
            ),
            ApiError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                None,
            ),
        };

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message,
            details,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, http::StatusCode};
    use test_case::test_case;

    fn shortage(name: &str, requested: i32, available: i32) -> StockShortage {
        StockShortage {
            product_id: Uuid::new_v4(),
            name: name.to_string(),
            requested,
            available,
        }
    }

    #[test_case(ServiceError::NotFound("x".into()), StatusCode::NOT_FOUND; "not found")]
    #[test_case(ServiceError::ValidationError("x".into()), StatusCode::BAD_REQUEST; "validation")]
    #[test_case(ServiceError::BadRequest("x".into()), StatusCode::BAD_REQUEST; "bad request")]
    #[test_case(ServiceError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED; "unauthorized")]
    #[test_case(ServiceError::Forbidden("x".into()), StatusCode::FORBIDDEN; "forbidden")]
    #[test_case(ServiceError::Conflict("x".into()), StatusCode::CONFLICT; "conflict")]
    #[test_case(ServiceError::InsufficientStock(vec![]), StatusCode::UNPROCESSABLE_ENTITY; "insufficient stock")]
    #[test_case(ServiceError::RateLimitExceeded, StatusCode::TOO_MANY_REQUESTS; "rate limited")]
    #[test_case(ServiceError::ExternalServiceError("x".into()), StatusCode::BAD_GATEWAY; "upstream")]
    #[test_case(ServiceError::InternalError("x".into()), StatusCode::INTERNAL_SERVER_ERROR; "internal")]
    fn service_error_status_code_mapping(err: ServiceError, expected: StatusCode) {
        assert_eq!(err.status_code(), expected);
    }

    #[test]
    fn service_error_response_message_hides_internal_details() {
        // Internal and upstream errors must not expose implementation details
        assert_eq!(
            ServiceError::HashError("argon2 param".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::DatabaseError(sea_orm::error::DbErr::Custom("dsn".into()))
                .response_message(),
            "Database error"
        );
        assert_eq!(
            ServiceError::ExternalServiceError("connect refused api.paystack.co".into())
                .response_message(),
            "Payment gateway unavailable"
        );

        // User-facing errors keep the actual message
        assert_eq!(
            ServiceError::NotFound("payment record not found".into()).response_message(),
            "Not found: payment record not found"
        );
        assert_eq!(
            ServiceError::ValidationError("cart is empty".into()).response_message(),
            "Validation error: cart is empty"
        );
    }

    #[tokio::test]
    async fn insufficient_stock_response_lists_every_shortage() {
        let err = ServiceError::InsufficientStock(vec![
            shortage("widget", 3, 1),
            shortage("gadget", 2, 0),
        ]);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        let details = payload.details.expect("shortage details");
        let lines = details.as_array().expect("details is an array");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["name"], "widget");
        assert_eq!(lines[0]["requested"], 3);
        assert_eq!(lines[0]["available"], 1);
        assert_eq!(lines[1]["name"], "gadget");
    }

    #[test]
    fn api_error_delegates_to_service_error_status() {
        let service_err = ServiceError::NotFound("test".into());
        let status = service_err.status_code();
        let api_err = ApiError::ServiceError(service_err);

        let api_status = match &api_err {
            ApiError::ServiceError(se) => se.status_code(),
            _ => panic!("Expected ServiceError variant"),
        };
        assert_eq!(status, api_status);
        assert_eq!(api_status, StatusCode::NOT_FOUND);
    }
}
