use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flow_core::FlowError;
use serde_json::json;

pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FlowError::ValidationRule(_) => StatusCode::BAD_REQUEST,
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FlowError::StoreTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::ChannelDispatch(_) | FlowError::InternalInvariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
