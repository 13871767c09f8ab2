use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use botfleet_orchestrator::FleetError;
use serde_json::json;

/// HTTP rendering of [`FleetError`]: `{"detail": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl ApiError {
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self.0 {
            FleetError::NotFound(_) | FleetError::EmptyFleet => StatusCode::NOT_FOUND,
            FleetError::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, %status, "Request failed");
        }
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}
