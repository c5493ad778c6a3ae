use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("'{url}' returned HTTP code {status}")]
    Status { url: String, status: StatusCode },
    #[error("too many redirects while fetching '{0}'")]
    RedirectLoop(String),
    #[error("blocked by the portal or its edge protection: {0}")]
    Blocked(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("no authentication method configured")]
    NoAuthMethod,
    #[error("empty cmd in create_link response")]
    EmptyLink,
    #[error("{0}")]
    Other(String),
}

impl PortalError {
    /// True for the response shapes that indicate an expired or revoked
    /// session rather than a transport problem. The channel resolver uses
    /// this to decide whether a one-shot reauthentication is worth trying.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, PortalError::Json(_))
    }
}
