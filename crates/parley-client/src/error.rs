use parley_shared::CommunicationError;
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the client gateways.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport, remote, parse or validation failure.
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    /// The gateway was used before `init` or after `close`.
    #[error("Client is not initialized")]
    NotInitialized,

    /// Malformed base URL, template or header value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    pub fn communication(&self) -> Option<&CommunicationError> {
        match self {
            Self::Communication(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.communication().is_some_and(CommunicationError::is_not_found)
    }
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        Self::Communication(err.into())
    }
}

/// Map a transport-level reqwest failure onto the shared taxonomy.
pub(crate) fn from_reqwest(err: reqwest::Error) -> CommunicationError {
    if err.is_decode() {
        CommunicationError::Parse(err.to_string())
    } else if let Some(status) = err.status() {
        CommunicationError::Remote {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        CommunicationError::Network(err.to_string())
    }
}

#[derive(serde::Deserialize)]
struct ErrorBody {
    error: String,
}

/// Pass 2xx responses through; turn anything else into `NotFound` (404)
/// or `Remote` carrying the `{error}` message when the body has one.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, CommunicationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);

    if status == reqwest::StatusCode::NOT_FOUND {
        Err(CommunicationError::NotFound(message))
    } else {
        Err(CommunicationError::Remote {
            status: status.as_u16(),
            message,
        })
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
