use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("an account with this email already exists")]
    DuplicateAccount,
    #[error("session token expired or invalid")]
    InvalidToken,
    #[error("not signed in")]
    NotSignedIn,
    #[error("authentication request timed out")]
    Timeout,
    #[error("profile unavailable: {0}")]
    ProfileUnavailable(String),
    #[error("network error: {0}")]
    Network(String),
}

impl From<StoreError> for AuthError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unauthorized(_) => AuthError::InvalidCredentials,
            StoreError::Conflict => AuthError::DuplicateAccount,
            StoreError::NotFound => AuthError::InvalidToken,
            StoreError::Network(message) => AuthError::Network(message),
            StoreError::Closed => AuthError::Network("store connection closed".into()),
        }
    }
}
