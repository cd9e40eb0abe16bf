//! Authentication error types.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown email or wrong password. Carries nothing about which.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Second factor missing or wrong, after the password matched.
    #[error("invalid second factor")]
    InvalidSecondFactor,

    /// Unknown, expired or revoked session.
    #[error("invalid session")]
    InvalidSession,

    #[error("email is already registered")]
    EmailTaken,

    #[error("user not found")]
    UserNotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Timeout, pool exhaustion or network failure in a backing store.
    #[error("store temporarily unavailable: {0}")]
    Transient(StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials | AuthError::InvalidSecondFactor
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Transient(_))
    }

    /// Text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "Invalid email or password",
            AuthError::InvalidSecondFactor => "Invalid verification code",
            AuthError::InvalidSession => "Your session has ended, please sign in again",
            AuthError::EmailTaken => "This email cannot be used",
            AuthError::UserNotFound => "Account not found",
            AuthError::InvalidInput(_) => "The request was not valid",
            AuthError::Transient(_) => "Service temporarily unavailable, please retry",
            AuthError::Configuration(_) | AuthError::Internal(_) => "Something went wrong",
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            AuthError::Transient(err)
        } else {
            AuthError::Internal(err.to_string())
        }
    }
}

impl From<validator::ValidationErrors> for AuthError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AuthError::InvalidInput(errors.to_string())
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        AuthError::Internal(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeouts_are_retryable_not_auth_failures() {
        let err: AuthError = StoreError::Timeout(Duration::from_millis(100)).into();
        assert!(err.is_retryable());
        assert!(!err.is_authentication_failure());
    }

    #[test]
    fn structural_store_errors_are_internal() {
        let err: AuthError = StoreError::Corrupt("bad row".into()).into();
        assert!(matches!(err, AuthError::Internal(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn credential_failures_share_a_message() {
        assert!(AuthError::InvalidCredentials.is_authentication_failure());
        assert!(AuthError::InvalidSecondFactor.is_authentication_failure());
        assert!(!AuthError::InvalidSession.is_authentication_failure());
        assert_eq!(
            AuthError::InvalidCredentials.to_string(),
            "invalid credentials"
        );
    }
}
