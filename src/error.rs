//! Login Error Types
//!
//! Every failure inside the authentication and launch pipeline is converted
//! to one of these variants before it reaches the UI. Messages are short and
//! never carry secrets or backend diagnostics.

use thiserror::Error;

/// Result type for login operations
pub type Result<T> = std::result::Result<T, LoginError>;

/// Login error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// Empty username or password, rejected before any backend call
    #[error("{0}")]
    InputError(String),

    /// The backend refused the credential
    #[error("{0}")]
    BackendRejected(String),

    /// Credential was valid but the account may not log in
    #[error("{0}")]
    AccountInvalid(String),

    /// The backend transaction could not start or communicate
    #[error("{0}")]
    BackendUnavailable(String),

    /// Account lookup, process creation or session setup failed
    #[error("{0}")]
    ResourceError(String),

    /// Launch attempted without a successful authentication
    #[error("not authenticated")]
    NotAuthenticated,
}

impl LoginError {
    /// Short tag used in audit records
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InputError(_) => "invalid-input",
            Self::BackendRejected(_) => "rejected",
            Self::AccountInvalid(_) => "account-invalid",
            Self::BackendUnavailable(_) => "backend-error",
            Self::ResourceError(_) => "resource-error",
            Self::NotAuthenticated => "not-authenticated",
        }
    }

    pub(crate) fn resource(reason: impl Into<String>) -> Self {
        Self::ResourceError(reason.into())
    }
}
