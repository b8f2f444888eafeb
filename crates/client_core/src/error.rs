use shared::error::ApiException;
use thiserror::Error;

/// Failure of a call against the hosted service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The service answered and refused; the message is passed through verbatim.
    #[error("{0}")]
    Rejected(#[from] ApiException),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected(ApiException::new(status, message))
    }

    /// Text shown to the user for this failure.
    pub fn user_message(&self) -> String {
        match self {
            Self::Rejected(rejection) => rejection.message.clone(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected(rejection) => Some(rejection.status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            Self::Decode(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Credential exchange refused by the service.
    #[error("{0}")]
    Credential(String),
    /// Registration refused by the service.
    #[error("{0}")]
    SignUp(String),
    /// Remote sign-out failed; local state was cleared regardless.
    #[error("{0}")]
    SignOut(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("session synchronizer has been torn down")]
    Disposed,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid backend url '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("backend url must use http or https, got '{0}'")]
    UnsupportedScheme(String),
    #[error("anon key is required to reach the backend")]
    MissingAnonKey,
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
