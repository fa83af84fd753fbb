//! Authentication
//!
//! Credentials, resolved identities and the typed outcome of one
//! authentication transaction.

use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::error::{LoginError, Result};

pub mod authenticator;
pub mod conversation;

pub use authenticator::{Authenticator, TransactionHandle};
pub use conversation::{
    Answer, ConversationBridge, ConversationError, ConversationMessage, MessageSink,
    TracingMessageSink,
};

/// Username and password for a single authentication transaction
///
/// The secret is zeroed when the credential is dropped, which happens as
/// soon as the transaction that consumed it concludes.
pub struct Credential {
    username: String,
    secret: Zeroizing<String>,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }

    /// Reject unusable input before any backend is involved
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() || self.secret.is_empty() {
            return Err(LoginError::InputError(
                "Username or password cannot be empty".to_string(),
            ));
        }
        if self
            .username
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(LoginError::InputError(
                "Username contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Account record of an authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Username
    pub username: String,

    /// User ID (UID)
    pub uid: u32,

    /// Group ID (GID)
    pub gid: u32,

    /// Home directory
    pub home: PathBuf,

    /// Login shell
    pub shell: PathBuf,

    /// Full name (GECOS)
    pub gecos: String,
}

impl From<nix::unistd::User> for Identity {
    fn from(user: nix::unistd::User) -> Self {
        Self {
            username: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
            shell: user.shell,
            gecos: user.gecos.to_string_lossy().into_owned(),
        }
    }
}

/// System account database
pub trait AccountDatabase: Send + Sync {
    /// Look up an account by name; `Ok(None)` when it does not exist
    fn resolve(&self, username: &str) -> Result<Option<Identity>>;
}

/// Account database backed by the system password database (NSS)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAccounts;

impl AccountDatabase for SystemAccounts {
    fn resolve(&self, username: &str) -> Result<Option<Identity>> {
        nix::unistd::User::from_name(username)
            .map(|user| user.map(Identity::from))
            .map_err(|e| {
                tracing::warn!("Failed to query user database for {}: {}", username, e);
                LoginError::resource("Failed to get user information")
            })
    }
}

/// Outcome of one authentication transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Credential and account accepted
    Authenticated(Identity),

    /// Backend refused the credential
    Rejected(String),

    /// Credential accepted but the account may not log in
    AccountInvalid(String),

    /// Backend could not be reached or failed internally
    BackendError(String),

    /// Empty username or password; backend never called
    InputError(String),
}

impl AuthResult {
    /// Check if authentication succeeded
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    /// Get identity if authentication succeeded
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    /// Convert into the login error taxonomy
    pub fn into_result(self) -> Result<Identity> {
        match self {
            Self::Authenticated(identity) => Ok(identity),
            Self::Rejected(reason) => Err(LoginError::BackendRejected(reason)),
            Self::AccountInvalid(reason) => Err(LoginError::AccountInvalid(reason)),
            Self::BackendError(reason) => Err(LoginError::BackendUnavailable(reason)),
            Self::InputError(reason) => Err(LoginError::InputError(reason)),
        }
    }

    /// Short tag used in audit records and logs
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Authenticated(_) => "authenticated",
            Self::Rejected(_) => "rejected",
            Self::AccountInvalid(_) => "account-invalid",
            Self::BackendError(_) => "backend-error",
            Self::InputError(_) => "invalid-input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identity(username: &str) -> Identity {
        Identity {
            username: username.to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from(format!("/home/{}", username)),
            shell: PathBuf::from("/bin/bash"),
            gecos: "Test User".to_string(),
        }
    }

    #[test]
    fn test_credential_validation() {
        assert!(Credential::new("alice", "secret").validate().is_ok());
        assert!(matches!(
            Credential::new("", "secret").validate(),
            Err(LoginError::InputError(_))
        ));
        assert!(matches!(
            Credential::new("alice", "").validate(),
            Err(LoginError::InputError(_))
        ));
        for username in ["mal lory", "mallory\nroot", "tab\tbed", "nul\0"] {
            assert!(
                matches!(
                    Credential::new(username, "secret").validate(),
                    Err(LoginError::InputError(_))
                ),
                "{:?} accepted",
                username
            );
        }
        // Whitespace in the password is fine
        assert!(Credential::new("alice", "correct horse").validate().is_ok());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("alice", "hunter2");
        let debug = format!("{:?}", credential);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_auth_result_mapping() {
        let identity = test_identity("alice");
        let ok = AuthResult::Authenticated(identity.clone());
        assert!(ok.is_authenticated());
        assert_eq!(ok.identity(), Some(&identity));
        assert_eq!(ok.into_result(), Ok(identity));

        assert_eq!(
            AuthResult::Rejected("nope".into()).into_result(),
            Err(LoginError::BackendRejected("nope".into()))
        );
        assert_eq!(
            AuthResult::BackendError("down".into()).into_result(),
            Err(LoginError::BackendUnavailable("down".into()))
        );
    }

    #[test]
    fn test_user_from_username() {
        // Test with current user
        if let Ok(current_user) = std::env::var("USER") {
            if let Ok(Some(identity)) = SystemAccounts.resolve(&current_user) {
                assert_eq!(identity.username, current_user);
            }
        }

        assert_eq!(
            SystemAccounts.resolve("no-such-user-lamco-login").ok().flatten(),
            None
        );
    }
}
