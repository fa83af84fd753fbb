//! Authentication backend seam
//!
//! The backend is reached through a fixed transaction lifecycle:
//! `start` → `verify_credential` → `check_account` → `end`, plus a separate
//! credential-less transaction that opens the login session record at
//! launch time. Return codes use the Linux-PAM numbering so the PAM backend
//! can pass them through untouched.

use crate::auth::{ConversationBridge, Identity};

#[cfg(feature = "pam-auth")]
#[allow(unsafe_code)]
pub mod pam;

#[cfg(feature = "pam-auth")]
pub use pam::PamBackend;

/// Backend return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStatus {
    Success,
    OpenError,
    SymbolError,
    ServiceError,
    SystemError,
    BufferError,
    PermissionDenied,
    AuthError,
    CredentialInsufficient,
    AuthInfoUnavailable,
    UserUnknown,
    MaxTries,
    NewAuthTokenRequired,
    AccountExpired,
    SessionError,
    CredentialUnavailable,
    CredentialExpired,
    CredentialError,
    ConversationError,
    AuthTokenError,
    Abort,
    AuthTokenExpired,
    /// Any code without a name above
    Other(i32),
}

impl BackendStatus {
    /// Decode a Linux-PAM return code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::OpenError,
            2 => Self::SymbolError,
            3 => Self::ServiceError,
            4 => Self::SystemError,
            5 => Self::BufferError,
            6 => Self::PermissionDenied,
            7 => Self::AuthError,
            8 => Self::CredentialInsufficient,
            9 => Self::AuthInfoUnavailable,
            10 => Self::UserUnknown,
            11 => Self::MaxTries,
            12 => Self::NewAuthTokenRequired,
            13 => Self::AccountExpired,
            14 => Self::SessionError,
            15 => Self::CredentialUnavailable,
            16 => Self::CredentialExpired,
            17 => Self::CredentialError,
            19 => Self::ConversationError,
            20 => Self::AuthTokenError,
            26 => Self::Abort,
            27 => Self::AuthTokenExpired,
            other => Self::Other(other),
        }
    }

    /// Linux-PAM return code
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::OpenError => 1,
            Self::SymbolError => 2,
            Self::ServiceError => 3,
            Self::SystemError => 4,
            Self::BufferError => 5,
            Self::PermissionDenied => 6,
            Self::AuthError => 7,
            Self::CredentialInsufficient => 8,
            Self::AuthInfoUnavailable => 9,
            Self::UserUnknown => 10,
            Self::MaxTries => 11,
            Self::NewAuthTokenRequired => 12,
            Self::AccountExpired => 13,
            Self::SessionError => 14,
            Self::CredentialUnavailable => 15,
            Self::CredentialExpired => 16,
            Self::CredentialError => 17,
            Self::ConversationError => 19,
            Self::AuthTokenError => 20,
            Self::Abort => 26,
            Self::AuthTokenExpired => 27,
            Self::Other(code) => code,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Pluggable authentication backend
pub trait AuthBackend: Send + Sync {
    /// Start a fresh transaction for `username`
    fn start(&self, username: &str) -> Result<Box<dyn BackendTransaction + '_>, BackendStatus>;

    /// Establish credentials and open a login session for an authenticated account
    fn open_session(&self, identity: &Identity) -> Result<Box<dyn SessionRecord>, BackendStatus>;
}

/// One authentication transaction inside the backend
pub trait BackendTransaction {
    /// Phase (a): verify the credential through the conversation
    fn verify_credential(&mut self, bridge: &ConversationBridge<'_>) -> BackendStatus;

    /// Phase (b): check that the account may log in now
    fn check_account(&mut self, bridge: &ConversationBridge<'_>) -> BackendStatus;

    /// Phase (c): release backend resources; `status` is the last phase result
    fn end(self: Box<Self>, status: BackendStatus);
}

/// Backend bookkeeping for an open login session
pub trait SessionRecord: Send {
    /// Environment the backend wants exported into the session
    fn environment(&self) -> &[(String, String)];

    /// Close the session and release backend resources
    fn close(self: Box<Self>);
}

/// Backend used when no authentication service is compiled in
///
/// Every transaction fails to start, so every login is refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableBackend;

impl AuthBackend for UnavailableBackend {
    fn start(&self, username: &str) -> Result<Box<dyn BackendTransaction + '_>, BackendStatus> {
        tracing::warn!(
            "No authentication backend available - refusing login for '{}'",
            username
        );
        Err(BackendStatus::ServiceError)
    }

    fn open_session(&self, _identity: &Identity) -> Result<Box<dyn SessionRecord>, BackendStatus> {
        Err(BackendStatus::ServiceError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for code in 0..32 {
            assert_eq!(BackendStatus::from_code(code).code(), code);
        }
        assert_eq!(BackendStatus::from_code(7), BackendStatus::AuthError);
        assert_eq!(BackendStatus::from_code(13), BackendStatus::AccountExpired);
        assert_eq!(BackendStatus::from_code(99), BackendStatus::Other(99));
    }

    #[test]
    fn test_unavailable_backend_refuses() {
        assert_eq!(
            UnavailableBackend.start("alice").err(),
            Some(BackendStatus::ServiceError)
        );
    }
}
