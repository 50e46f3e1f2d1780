use thiserror::Error;

/// Failure of a token acquisition. `NotSignedIn` and `Canceled` are the
/// expected outcomes callers branch on; everything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no cached credential is available")]
    NotSignedIn,
    #[error("sign in was canceled by the user")]
    Canceled,
    #[error("{message}")]
    Other {
        message: String,
        inner: Option<String>,
    },
}

impl AuthError {
    pub fn other(message: impl Into<String>) -> Self {
        AuthError::Other {
            message: message.into(),
            inner: None,
        }
    }

    /// Attaches the underlying cause. Has no effect on the expected variants.
    pub fn with_inner(self, cause: impl ToString) -> Self {
        match self {
            AuthError::Other { message, .. } => AuthError::Other {
                message,
                inner: Some(cause.to_string()),
            },
            other => other,
        }
    }

    /// Text shown to the user: the message followed by the inner cause, if any.
    pub fn describe(&self) -> String {
        match self {
            AuthError::Other {
                message,
                inner: Some(inner),
            } => format!("{message} Inner Exception : {inner}"),
            other => other.to_string(),
        }
    }
}

/// Failure of a call against the to-do list API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("HTTP {code} {reason}")]
    Status { code: u16, reason: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError::Request(err.to_string())
    }
}

/// Everything a user action can end with, in the words shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("Please sign in first")]
    NotSignedIn,
    #[error("Sign in was canceled by the user")]
    AuthCanceled,
    #[error("{0}")]
    AuthOtherFailure(String),
    #[error("An error occurred : {0}")]
    HttpFailure(String),
    #[error("{0}")]
    ValidationFailure(String),
    #[error("An unexpected error occurred : {0}")]
    Unexpected(String),
}

impl From<AuthError> for ClientError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::NotSignedIn => ClientError::NotSignedIn,
            AuthError::Canceled => ClientError::AuthCanceled,
            other => ClientError::AuthOtherFailure(other.describe()),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { reason, .. } => ClientError::HttpFailure(reason),
            other => ClientError::Unexpected(other.to_string()),
        }
    }
}
