//! Session launcher
//!
//! Moves an authenticated account from the privileged login process into
//! its own session:
//!
//! ```text
//! NotStarted → BackendSessionOpened → Forked → PrivilegeDropped
//!            → EnvironmentPrepared → Execed
//! ```
//!
//! Failures before the fork are returned to the caller with no process
//! created. After the fork the parent has already returned, so the child
//! reports its own failure through the audit log and exits non-zero. It
//! never reaches exec with partial privileges.

use chrono::Utc;
use nix::errno::Errno;
use nix::unistd::{Gid, Pid, Uid};
use std::ffi::CString;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::catalog::{SessionEntry, SessionId};
use super::process::ProcessOps;
use crate::audit::{AuditEntry, AuditSink, StepFailure};
use crate::auth::{AccountDatabase, Identity};
use crate::backend::{AuthBackend, SessionRecord};
use crate::config::SessionConfig;
use crate::error::{LoginError, Result};

/// Exit status of a session child that failed before exec
pub const CHILD_FAILURE_STATUS: i32 = 1;

/// Exit status of a session child that failed before exec and could not
/// write its audit record either
pub const CHILD_UNRECORDED_FAILURE_STATUS: i32 = 2;

/// Shell used when an account has none configured
const DEFAULT_SHELL: &str = "/bin/sh";

/// Variables that always carry the account's own values
const ACCOUNT_VARIABLES: [&str; 4] = ["HOME", "SHELL", "USER", "LOGNAME"];

/// Launch state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    NotStarted,
    BackendSessionOpened,
    Forked,
    PrivilegeDropped,
    EnvironmentPrepared,
    Execed,
}

impl LaunchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::BackendSessionOpened => "backend-session-opened",
            Self::Forked => "forked",
            Self::PrivilegeDropped => "privilege-dropped",
            Self::EnvironmentPrepared => "environment-prepared",
            Self::Execed => "execed",
        }
    }
}

/// Outcome of a launch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchResult {
    /// Session process created
    Launched,

    /// Nothing was started
    LaunchFailed(LoginError),
}

impl LaunchResult {
    pub fn is_launched(&self) -> bool {
        matches!(self, Self::Launched)
    }
}

/// A session process created by the launcher
///
/// Owns the backend session record, which must be closed once the session
/// process is gone.
pub struct LaunchedSession {
    pub pid: Pid,
    pub session: SessionId,
    pub username: String,
    record: Box<dyn SessionRecord>,
}

impl LaunchedSession {
    /// Close the backend session record
    pub fn close(self) {
        debug!("Closing backend session for {} (PID: {})", self.username, self.pid);
        self.record.close();
    }
}

impl fmt::Debug for LaunchedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedSession")
            .field("pid", &self.pid)
            .field("session", &self.session)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Everything the child needs, prepared before the fork
///
/// The child only fills in and writes the prepared failure record, so it
/// never allocates between fork and exec.
struct ChildPlan {
    failure: AuditEntry,
    user: CString,
    uid: Uid,
    gid: Gid,
    home: CString,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl ChildPlan {
    fn prepare(
        account: &Identity,
        entry: &SessionEntry,
        environment: &[(String, String)],
    ) -> Result<Self> {
        let shell = login_shell(account);
        let program = path_cstring(Path::new(&shell))?;
        let argv = entry_point_argv(&shell, entry)
            .into_iter()
            .map(cstring)
            .collect::<Result<Vec<_>>>()?;
        let envp = environment
            .iter()
            .map(|(name, value)| cstring(format!("{}={}", name, value)))
            .collect::<Result<Vec<_>>>()?;

        let failure = AuditEntry::launch_failure(
            &account.username,
            entry.id.as_str(),
            LaunchState::Forked.as_str(),
            StepFailure {
                step: "fork",
                errno: Errno::UnknownErrno,
            },
            Utc::now(),
        );

        Ok(Self {
            failure,
            user: cstring(account.username.clone())?,
            uid: Uid::from_raw(account.uid),
            gid: Gid::from_raw(account.gid),
            home: path_cstring(&account.home)?,
            program,
            argv,
            envp,
        })
    }
}

fn cstring(value: String) -> Result<CString> {
    CString::new(value).map_err(|_| LoginError::resource("Session setup contains a NUL byte"))
}

fn path_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LoginError::resource("Session setup contains a NUL byte"))
}

fn login_shell(account: &Identity) -> String {
    let shell = account.shell.to_string_lossy();
    if shell.is_empty() {
        DEFAULT_SHELL.to_string()
    } else {
        shell.into_owned()
    }
}

/// Arguments for the session entry point
///
/// The login shell always runs as a login shell (`argv[0]` = `-<name>`).
/// Descriptor sessions hand their `Exec` line to it.
pub fn entry_point_argv(shell: &str, entry: &SessionEntry) -> Vec<String> {
    let name = Path::new(shell)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sh".to_string());
    let argv0 = format!("-{}", name);

    match &entry.exec {
        None => vec![argv0],
        Some(exec) => vec![argv0, "-c".to_string(), format!("exec {}", exec)],
    }
}

/// Environment handed to the session process
///
/// Later entries replace earlier ones of the same name, except the account
/// variables, which nothing can override.
pub fn session_environment(
    account: &Identity,
    entry: &SessionEntry,
    config: &SessionConfig,
    backend: &[(String, String)],
) -> Vec<(String, String)> {
    fn set(env: &mut Vec<(String, String)>, name: &str, value: String, forced: bool) {
        if !forced && ACCOUNT_VARIABLES.contains(&name) {
            return;
        }
        match env.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => env.push((name.to_string(), value)),
        }
    }

    let mut env: Vec<(String, String)> = Vec::new();

    set(&mut env, "HOME", account.home.to_string_lossy().into_owned(), true);
    set(&mut env, "SHELL", login_shell(account), true);
    set(&mut env, "USER", account.username.clone(), true);
    set(&mut env, "LOGNAME", account.username.clone(), true);
    set(&mut env, "PATH", config.search_path.clone(), false);
    set(&mut env, "DESKTOP_SESSION", entry.id.to_string(), false);
    set(&mut env, "XDG_SESSION_DESKTOP", entry.id.to_string(), false);
    set(&mut env, "XDG_SESSION_TYPE", entry.session_type.as_str().to_string(), false);

    for (name, value) in backend {
        set(&mut env, name, value.clone(), false);
    }
    for var in &config.environment {
        set(&mut env, &var.name, var.value.clone(), false);
    }

    env
}

/// Performs the privilege transition into a user session
pub struct SessionLauncher {
    config: SessionConfig,
    backend: Arc<dyn AuthBackend>,
    accounts: Arc<dyn AccountDatabase>,
    audit: Arc<dyn AuditSink>,
    ops: Arc<dyn ProcessOps>,
}

impl SessionLauncher {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn AuthBackend>,
        accounts: Arc<dyn AccountDatabase>,
        audit: Arc<dyn AuditSink>,
        ops: Arc<dyn ProcessOps>,
    ) -> Self {
        Self {
            config,
            backend,
            accounts,
            audit,
            ops,
        }
    }

    /// Launch `entry` for an authenticated account
    ///
    /// Returns once the session process exists; the caller never waits on
    /// the child here.
    pub fn launch(&self, identity: Option<&Identity>, entry: &SessionEntry) -> Result<LaunchedSession> {
        let identity = identity.ok_or(LoginError::NotAuthenticated)?;

        info!("Launching session {} for user {}", entry.id, identity.username);
        debug!("Launch state: {}", LaunchState::NotStarted.as_str());

        let account = match self.accounts.resolve(&identity.username) {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!("Account {} disappeared before launch", identity.username);
                return Err(LoginError::resource("Account not found"));
            }
            Err(e) => return Err(e),
        };

        let record = self.backend.open_session(&account).map_err(|status| {
            warn!("Failed to open backend session: {:?}", status);
            LoginError::resource("Failed to open login session")
        })?;
        debug!("Launch state: {}", LaunchState::BackendSessionOpened.as_str());

        let environment = session_environment(&account, entry, &self.config, record.environment());
        let mut plan = match ChildPlan::prepare(&account, entry, &environment) {
            Ok(plan) => plan,
            Err(e) => {
                record.close();
                return Err(e);
            }
        };

        let spawned = self.ops.spawn(&mut || self.become_session(&mut plan));

        match spawned {
            Ok(pid) => {
                debug!("Launch state: {}", LaunchState::Forked.as_str());
                info!(
                    "Session {} started for user {} (PID: {})",
                    entry.id, account.username, pid
                );
                Ok(LaunchedSession {
                    pid,
                    session: entry.id.clone(),
                    username: account.username,
                    record,
                })
            }
            Err(e) => {
                warn!("Failed to create session process: {}", e);
                record.close();
                Err(LoginError::resource("Failed to create session process"))
            }
        }
    }

    /// Child side of the launch; returns only on failure
    fn become_session(&self, plan: &mut ChildPlan) -> i32 {
        let forked = LaunchState::Forked;

        if let Err(e) = self.ops.init_groups(&plan.user, plan.gid) {
            return self.child_failed(plan, forked, "initgroups", e);
        }
        if let Err(e) = self.ops.set_gid(plan.gid) {
            return self.child_failed(plan, forked, "setgid", e);
        }
        if let Err(e) = self.ops.set_uid(plan.uid) {
            return self.child_failed(plan, forked, "setuid", e);
        }

        let dropped = LaunchState::PrivilegeDropped;

        if let Err(e) = self.ops.change_dir(&plan.home) {
            return self.child_failed(plan, dropped, "chdir", e);
        }

        // Environment is the prepared envp only; nothing is inherited
        let prepared = LaunchState::EnvironmentPrepared;

        let errno = self.ops.exec(&plan.program, &plan.argv, &plan.envp);
        self.child_failed(plan, prepared, "exec", errno)
    }

    fn child_failed(
        &self,
        plan: &mut ChildPlan,
        state: LaunchState,
        step: &'static str,
        errno: Errno,
    ) -> i32 {
        plan.failure.set_failure(state.as_str(), StepFailure { step, errno });
        match self.audit.record_detached(&plan.failure) {
            Ok(()) => CHILD_FAILURE_STATUS,
            Err(_) => CHILD_UNRECORDED_FAILURE_STATUS,
        }
    }
}
