use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_shared::CommunicationError;
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Communication(err.into())
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Communication(err) => match err {
                CommunicationError::NotFound(_) => StatusCode::NOT_FOUND,
                CommunicationError::Validation(_) | CommunicationError::Parse(_) => {
                    StatusCode::BAD_REQUEST
                }
                CommunicationError::Network(_) => StatusCode::BAD_GATEWAY,
                CommunicationError::Remote { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
            },
            ServerError::UnknownOperation(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
