//! Login orchestration
//!
//! [`AuthSessionOrchestrator`] is what a greeter talks to. It sequences
//! authentication, session discovery and launch, and holds the single
//! authenticated identity between those calls.
//!
//! All methods take `&mut self`, so at most one authentication or launch
//! is in flight per instance.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, FileAuditLog, NullAuditLog};
use crate::auth::{
    AccountDatabase, AuthResult, Authenticator, Credential, Identity, MessageSink, SystemAccounts,
    TracingMessageSink,
};
use crate::backend::AuthBackend;
use crate::config::LoginConfig;
use crate::error::LoginError;
use crate::session::launcher::CHILD_UNRECORDED_FAILURE_STATUS;
use crate::session::{
    LaunchResult, LaunchedSession, ProcessOps, SessionCatalog, SessionId, SessionLauncher,
    SystemProcessOps,
};

/// External services the orchestrator depends on
pub struct Collaborators {
    pub backend: Arc<dyn AuthBackend>,
    pub accounts: Arc<dyn AccountDatabase>,
    pub audit: Arc<dyn AuditSink>,
    pub processes: Arc<dyn ProcessOps>,
    pub messages: Arc<dyn MessageSink>,
}

impl Collaborators {
    /// Collaborators for a real login on this host
    pub fn system(config: &LoginConfig) -> Result<Self> {
        let audit: Arc<dyn AuditSink> = if config.auth.audit_logging {
            Arc::new(FileAuditLog::new(&config.auth.audit_log)?)
        } else {
            info!("Audit logging disabled");
            Arc::new(NullAuditLog)
        };

        Ok(Self {
            backend: system_backend(config)?,
            accounts: Arc::new(SystemAccounts),
            audit,
            processes: Arc::new(SystemProcessOps),
            messages: Arc::new(TracingMessageSink),
        })
    }
}

#[cfg(feature = "pam-auth")]
fn system_backend(config: &LoginConfig) -> Result<Arc<dyn AuthBackend>> {
    Ok(Arc::new(crate::backend::PamBackend::new(&config.auth.pam_service)?))
}

#[cfg(not(feature = "pam-auth"))]
fn system_backend(config: &LoginConfig) -> Result<Arc<dyn AuthBackend>> {
    warn!(
        "Built without PAM support - PAM service '{}' ignored, all logins will be refused",
        config.auth.pam_service
    );
    Ok(Arc::new(crate::backend::UnavailableBackend))
}

/// Facade used by the greeter
pub struct AuthSessionOrchestrator {
    authenticator: Authenticator,
    catalog: SessionCatalog,
    launcher: SessionLauncher,
    processes: Arc<dyn ProcessOps>,
    identity: Option<Identity>,
    sessions: Vec<LaunchedSession>,
}

impl AuthSessionOrchestrator {
    pub fn new(config: &LoginConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            backend,
            accounts,
            audit,
            processes,
            messages,
        } = collaborators;

        Self {
            authenticator: Authenticator::new(
                backend.clone(),
                accounts.clone(),
                audit.clone(),
                messages,
            ),
            catalog: SessionCatalog::new(&config.sessions),
            launcher: SessionLauncher::new(
                config.sessions.clone(),
                backend,
                accounts,
                audit,
                processes.clone(),
            ),
            processes,
            identity: None,
            sessions: Vec::new(),
        }
    }

    /// Authenticate a user
    ///
    /// Any previously held identity is dropped first, so a failed attempt
    /// always leaves the orchestrator unauthenticated.
    pub fn authenticate(&mut self, username: &str, password: &str) -> AuthResult {
        if let Some(previous) = self.identity.take() {
            debug!("Discarding identity of {} for new attempt", previous.username);
        }

        let result = self
            .authenticator
            .authenticate(Credential::new(username, password));

        if let AuthResult::Authenticated(identity) = &result {
            self.identity = Some(identity.clone());
        }

        result
    }

    /// Launchable sessions; never empty
    pub fn available_sessions(&self) -> Vec<SessionId> {
        self.catalog.list()
    }

    /// Launch a session for the authenticated user
    pub fn launch(&mut self, session: &SessionId) -> LaunchResult {
        let Some(identity) = self.identity.as_ref() else {
            warn!("Launch of {} refused: not authenticated", session);
            return LaunchResult::LaunchFailed(LoginError::NotAuthenticated);
        };

        let entry = match self.catalog.resolve(session) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot launch {}: {}", session, e);
                return LaunchResult::LaunchFailed(e);
            }
        };

        match self.launcher.launch(Some(identity), &entry) {
            Ok(launched) => {
                self.sessions.push(launched);
                LaunchResult::Launched
            }
            Err(e) => {
                warn!("Launch of {} failed: {}", session, e);
                LaunchResult::LaunchFailed(e)
            }
        }
    }

    /// Close the backend record of every session whose process has exited
    ///
    /// Never blocks. Returns the number of sessions reaped.
    pub fn reap_sessions(&mut self) -> usize {
        let mut reaped = 0;
        let mut running = Vec::with_capacity(self.sessions.len());

        for session in self.sessions.drain(..) {
            match self.processes.try_reap(session.pid) {
                Ok(None) => running.push(session),
                Ok(Some(status)) => {
                    info!(
                        "Session {} of {} exited (PID: {}, status: {})",
                        session.session, session.username, session.pid, status
                    );
                    if status == CHILD_UNRECORDED_FAILURE_STATUS {
                        warn!(
                            "Session child {} may have failed before exec without an audit record",
                            session.pid
                        );
                    }
                    session.close();
                    reaped += 1;
                }
                Err(nix::errno::Errno::ECHILD) => {
                    debug!("Session process {} already reaped", session.pid);
                    session.close();
                    reaped += 1;
                }
                Err(e) => {
                    warn!("Failed to poll session process {}: {}", session.pid, e);
                    running.push(session);
                }
            }
        }

        self.sessions = running;
        reaped
    }

    pub fn has_active_sessions(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn active_sessions(&self) -> &[LaunchedSession] {
        &self.sessions
    }

    /// Close every backend session record and forget the identity
    pub fn logout(&mut self) {
        for session in self.sessions.drain(..) {
            session.close();
        }

        if let Some(identity) = self.identity.take() {
            info!("User {} logged out", identity.username);
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

impl Drop for AuthSessionOrchestrator {
    fn drop(&mut self) {
        self.logout();
    }
}
