use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use idem_guard::{GuardError, codes};
use idem_registry::RiskTier;

/// Route registration failures. These abort startup.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("operation '{0}' is not in the mutation registry")]
    NotRegistered(String),
    #[error("operation '{operation}' is registered as {registered} but gated as {gated}")]
    TierMismatch {
        operation: String,
        registered: RiskTier,
        gated: RiskTier,
    },
}

pub type GateResult<T> = Result<T, GateError>;

/// Error body returned by gated routes: `{"code": ..., "message": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn missing_key() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::MISSING_IDEMPOTENCY_KEY,
            "Idempotency-Key header is required",
        )
    }

    pub fn unauthenticated() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHENTICATED,
            "caller identity is required",
        )
    }

    pub fn forbidden(operation: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            codes::FORBIDDEN,
            format!("caller lacks the permissions required by {operation}"),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut api = ApiError::new(status, err.code(), err.to_string());
        match err {
            GuardError::InProgress => api.retry_after_secs = Some(1),
            GuardError::Execution(handler) => api.message = handler.message,
            _ => {}
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "code": self.code, "message": self.message });
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idem_guard::HandlerError;

    #[test]
    fn in_progress_carries_retry_after() {
        let response = ApiError::from(GuardError::InProgress).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).map(|v| v.as_bytes()),
            Some(&b"1"[..])
        );
    }

    #[test]
    fn handler_errors_keep_their_status_and_message() {
        let api = ApiError::from(GuardError::Execution(HandlerError::new(
            422,
            "INSUFFICIENT_FUNDS",
            "balance too low",
        )));
        assert_eq!(api.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(api.message, "balance too low");
    }

    #[test]
    fn out_of_range_handler_status_becomes_500() {
        let api = ApiError::from(GuardError::Execution(HandlerError::new(42, "ODD", "x")));
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
