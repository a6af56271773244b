use thiserror::Error;

use crate::api::ApiError;

/// Errors from session operations. `Display` is suitable for showing to the user.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Unable to connect to server. Check your internet connection.")]
    Offline(#[source] ApiError),

    #[error("{0}")]
    Registration(RegistrationFailure),

    #[error("Signed in, but your profile could not be loaded. Please try again.")]
    Profile(#[source] ApiError),

    #[error("Login failed: {0}")]
    Api(#[source] ApiError),

    #[error("Could not save your session: {0}")]
    Storage(String),
}

impl AuthError {
    /// Map a failed `POST /auth/login` to what the user should see.
    pub fn from_login_failure(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => AuthError::InvalidCredentials,
            ApiError::NetworkError(e) if e.is_connect() || e.is_timeout() => {
                AuthError::Offline(ApiError::NetworkError(e))
            }
            other => AuthError::Api(other),
        }
    }
}

/// Why a registration was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationFailure {
    #[error("An account with this email already exists.")]
    DuplicateAccount,

    #[error("Some of the details you entered are not valid. Please check them and try again.")]
    Validation,

    #[error("We couldn't create your account right now. Please try again later.")]
    Server,
}

impl RegistrationFailure {
    /// Every failure maps to exactly one variant.
    pub fn classify(error: &ApiError) -> Self {
        match error {
            ApiError::Conflict(_) => RegistrationFailure::DuplicateAccount,
            ApiError::BadRequest { detail, .. } if mentions_existing_account(detail) => {
                RegistrationFailure::DuplicateAccount
            }
            e => match e.status() {
                Some(400..=499) => RegistrationFailure::Validation,
                _ => RegistrationFailure::Server,
            },
        }
    }
}

fn mentions_existing_account(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    lower.contains("already") && (lower.contains("exist") || lower.contains("registered") || lower.contains("in use"))
}
