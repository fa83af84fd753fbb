//! Authentication transactions
//!
//! One call to [`Authenticator::run`] is one attempt: a fresh backend
//! transaction is started, the credential is verified, the account is
//! checked, and the transaction is always torn down. Backend codes are
//! mapped onto [`AuthResult`]; anything unrecognized fails closed.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::{AccountDatabase, AuthResult, ConversationBridge, Credential, MessageSink};
use crate::audit::{AuditEntry, AuditSink};
use crate::backend::{AuthBackend, BackendStatus, BackendTransaction};

const REJECTED: &str = "Invalid username or password";
const SERVICE_UNAVAILABLE: &str = "Authentication service unavailable";
const SERVICE_ERROR: &str = "Authentication service error";

/// A started (or refused) transaction, ready to [`run`](Authenticator::run)
pub struct TransactionHandle<'a> {
    id: Uuid,
    credential: Credential,
    state: TransactionState<'a>,
}

enum TransactionState<'a> {
    /// Input rejected; backend never contacted
    Invalid(String),
    /// Backend refused to start a transaction
    Unavailable(BackendStatus),
    Started(Box<dyn BackendTransaction + 'a>),
}

impl TransactionHandle<'_> {
    /// Transaction id used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        self.credential.username()
    }
}

/// Ends the backend transaction on every exit path, unwinding included
struct Teardown<'a> {
    transaction: Option<Box<dyn BackendTransaction + 'a>>,
    status: BackendStatus,
}

impl Teardown<'_> {
    /// Run one phase and remember its status for `end`
    fn phase(
        &mut self,
        run: impl FnOnce(&mut dyn BackendTransaction) -> BackendStatus,
    ) -> BackendStatus {
        self.status = match self.transaction.as_deref_mut() {
            Some(transaction) => run(transaction),
            None => BackendStatus::Abort,
        };
        self.status
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            debug!("Ending backend transaction with {:?}", self.status);
            transaction.end(self.status);
        }
    }
}

/// Drives authentication transactions against a backend
pub struct Authenticator {
    backend: Arc<dyn AuthBackend>,
    accounts: Arc<dyn AccountDatabase>,
    audit: Arc<dyn AuditSink>,
    messages: Arc<dyn MessageSink>,
}

impl Authenticator {
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        accounts: Arc<dyn AccountDatabase>,
        audit: Arc<dyn AuditSink>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            backend,
            accounts,
            audit,
            messages,
        }
    }

    /// Start a transaction for `credential`
    ///
    /// Empty input never reaches the backend.
    pub fn begin(&self, credential: Credential) -> TransactionHandle<'_> {
        let id = Uuid::new_v4();

        let state = match credential.validate() {
            Err(e) => TransactionState::Invalid(e.to_string()),
            Ok(()) => match self.backend.start(credential.username()) {
                Ok(transaction) => TransactionState::Started(transaction),
                Err(status) => TransactionState::Unavailable(status),
            },
        };

        TransactionHandle {
            id,
            credential,
            state,
        }
    }

    /// Drive a transaction to its outcome
    ///
    /// Exactly one audit record is written per call. The credential is
    /// dropped (and its secret zeroed) before this returns.
    pub fn run(&self, handle: TransactionHandle<'_>) -> AuthResult {
        let TransactionHandle {
            id,
            credential,
            state,
        } = handle;
        let username = credential.username().to_string();

        let span = info_span!("auth", tx = %id, user = %username);
        let _enter = span.enter();

        let result = match state {
            TransactionState::Invalid(reason) => {
                warn!("Rejected login attempt with empty credentials");
                AuthResult::InputError(reason)
            }
            TransactionState::Unavailable(status) => {
                warn!("Failed to start authentication transaction: {:?}", status);
                AuthResult::BackendError(SERVICE_UNAVAILABLE.to_string())
            }
            TransactionState::Started(transaction) => self.drive(transaction, &credential),
        };
        drop(credential);

        match &result {
            AuthResult::Authenticated(identity) => {
                info!("User {} (UID: {}) authenticated successfully", username, identity.uid)
            }
            other => warn!("Authentication failed for user {}: {}", username, other.tag()),
        }

        self.record(&username, &result);
        result
    }

    /// Validate, start and run one transaction
    pub fn authenticate(&self, credential: Credential) -> AuthResult {
        let handle = self.begin(credential);
        self.run(handle)
    }

    fn drive<'a>(
        &self,
        transaction: Box<dyn BackendTransaction + 'a>,
        credential: &Credential,
    ) -> AuthResult {
        let mut teardown = Teardown {
            transaction: Some(transaction),
            status: BackendStatus::Success,
        };
        let bridge = ConversationBridge::new(credential, self.messages.as_ref());

        let verified = teardown.phase(|tx| tx.verify_credential(&bridge));
        if !verified.is_success() {
            debug!("Credential verification returned {:?}", verified);
            return map_verification(verified);
        }

        let account = teardown.phase(|tx| tx.check_account(&bridge));
        if !account.is_success() {
            debug!("Account check returned {:?}", account);
            return map_account_check(account);
        }

        drop(teardown);

        match self.accounts.resolve(credential.username()) {
            Ok(Some(identity)) => AuthResult::Authenticated(identity),
            Ok(None) => AuthResult::AccountInvalid("Account not found".to_string()),
            Err(e) => {
                warn!("Account lookup failed after authentication: {}", e);
                AuthResult::BackendError(SERVICE_ERROR.to_string())
            }
        }
    }

    fn record(&self, username: &str, result: &AuthResult) {
        let entry = AuditEntry::login(username, result, Utc::now());
        if let Err(e) = self.audit.record(&entry) {
            warn!("Failed to write audit record: {:#}", e);
        }
    }
}

/// Phase (a) outcome
fn map_verification(status: BackendStatus) -> AuthResult {
    match status {
        BackendStatus::AuthError
        | BackendStatus::UserUnknown
        | BackendStatus::MaxTries
        | BackendStatus::CredentialInsufficient => AuthResult::Rejected(REJECTED.to_string()),
        _ => AuthResult::BackendError(SERVICE_ERROR.to_string()),
    }
}

/// Phase (b) outcome
fn map_account_check(status: BackendStatus) -> AuthResult {
    let reason = match status {
        BackendStatus::AccountExpired => "Account has expired",
        BackendStatus::NewAuthTokenRequired | BackendStatus::AuthTokenExpired => {
            "Password has expired"
        }
        BackendStatus::PermissionDenied => "Account is not permitted to log in",
        BackendStatus::UserUnknown => "Account not found",
        _ => return AuthResult::BackendError(SERVICE_ERROR.to_string()),
    };
    AuthResult::AccountInvalid(reason.to_string())
}
