//! Shared stubs for integration tests
//!
//! Every collaborator of the orchestrator, in memory. Nothing here needs
//! root, a PAM stack or a real fork.

#![allow(dead_code)]

use lamco_login::audit::{AuditEntry, AuditOutcome, AuditSink};
use lamco_login::auth::{
    AccountDatabase, ConversationBridge, ConversationMessage, Identity, TracingMessageSink,
};
use lamco_login::backend::{AuthBackend, BackendStatus, BackendTransaction, SessionRecord};
use lamco_login::config::LoginConfig;
use lamco_login::session::ProcessOps;
use lamco_login::{AuthSessionOrchestrator, Collaborators};
use nix::errno::Errno;
use nix::unistd::{Gid, Pid, Uid};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type Events = Arc<Mutex<Vec<String>>>;

pub fn alice() -> Identity {
    Identity {
        username: "alice".to_string(),
        uid: 1000,
        gid: 1000,
        home: PathBuf::from("/home/alice"),
        shell: PathBuf::from("/bin/bash"),
        gecos: "Alice".to_string(),
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Backend that checks the answered secret against a fixed password
pub struct ScriptedBackend {
    pub password: String,
    pub start_status: BackendStatus,
    pub account_status: BackendStatus,
    pub session_status: BackendStatus,
    pub session_env: Vec<(String, String)>,
    pub events: Events,
}

impl ScriptedBackend {
    pub fn accepting(password: &str) -> Self {
        Self {
            password: password.to_string(),
            start_status: BackendStatus::Success,
            account_status: BackendStatus::Success,
            session_status: BackendStatus::Success,
            session_env: vec![("XDG_SEAT".to_string(), "seat0".to_string())],
            events: Events::default(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct ScriptedTransaction {
    password: String,
    account_status: BackendStatus,
    events: Events,
}

impl AuthBackend for ScriptedBackend {
    fn start(&self, username: &str) -> Result<Box<dyn BackendTransaction + '_>, BackendStatus> {
        self.events.lock().push(format!("start:{}", username));
        if !self.start_status.is_success() {
            return Err(self.start_status);
        }
        Ok(Box::new(ScriptedTransaction {
            password: self.password.clone(),
            account_status: self.account_status,
            events: self.events.clone(),
        }))
    }

    fn open_session(&self, identity: &Identity) -> Result<Box<dyn SessionRecord>, BackendStatus> {
        self.events
            .lock()
            .push(format!("open_session:{}", identity.username));
        if !self.session_status.is_success() {
            return Err(self.session_status);
        }
        Ok(Box::new(ScriptedSession {
            env: self.session_env.clone(),
            events: self.events.clone(),
        }))
    }
}

impl BackendTransaction for ScriptedTransaction {
    fn verify_credential(&mut self, bridge: &ConversationBridge<'_>) -> BackendStatus {
        self.events.lock().push("verify".to_string());
        let batch = [
            ConversationMessage::InfoText("Welcome".to_string()),
            ConversationMessage::SecretPrompt("Password: ".to_string()),
        ];
        match bridge.respond(&batch) {
            Ok(answers) if answers.len() == 1 && answers[0].expose() == self.password => {
                BackendStatus::Success
            }
            Ok(_) => BackendStatus::AuthError,
            Err(_) => BackendStatus::ConversationError,
        }
    }

    fn check_account(&mut self, _bridge: &ConversationBridge<'_>) -> BackendStatus {
        self.events.lock().push("account".to_string());
        self.account_status
    }

    fn end(self: Box<Self>, status: BackendStatus) {
        self.events.lock().push(format!("end:{:?}", status));
    }
}

struct ScriptedSession {
    env: Vec<(String, String)>,
    events: Events,
}

impl SessionRecord for ScriptedSession {
    fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    fn close(self: Box<Self>) {
        self.events.lock().push("close_session".to_string());
    }
}

// =============================================================================
// Accounts and audit
// =============================================================================

#[derive(Default)]
pub struct MemoryAccounts(pub HashMap<String, Identity>);

impl MemoryAccounts {
    pub fn with(identity: Identity) -> Self {
        let mut accounts = Self::default();
        accounts.0.insert(identity.username.clone(), identity);
        accounts
    }
}

impl AccountDatabase for MemoryAccounts {
    fn resolve(&self, username: &str) -> lamco_login::Result<Option<Identity>> {
        Ok(self.0.get(username).cloned())
    }
}

#[derive(Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
    refuse_detached: AtomicBool,
}

impl MemoryAudit {
    /// Make every write from a session child fail
    pub fn refuse_detached_writes(&self) {
        self.refuse_detached.store(true, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn logins(&self) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| matches!(e.outcome, AuditOutcome::Login { .. }))
            .collect()
    }

    pub fn launch_failures(&self) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| matches!(e.outcome, AuditOutcome::LaunchFailed { .. }))
            .collect()
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn record_detached(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if self.refuse_detached.load(Ordering::SeqCst) {
            return Err(std::io::Error::from(Errno::ENOSPC));
        }
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

// =============================================================================
// Process operations
// =============================================================================

/// Records every process step in order
///
/// `spawn` runs the child side in-process. `exec` cannot replace the test
/// process, so it records the call and reports ENOEXEC, which the launcher
/// audits like any failed exec.
#[derive(Default)]
pub struct RecordingOps {
    pub steps: Mutex<Vec<String>>,
    pub fail_at: Option<&'static str>,
    pub exit_statuses: Mutex<Vec<i32>>,
    pub exec_env: Mutex<Vec<String>>,
    pub exec_argv: Mutex<Vec<String>>,
    pub exited: Mutex<HashSet<i32>>,
    next_pid: Mutex<i32>,
}

impl RecordingOps {
    pub fn failing_at(step: &'static str) -> Self {
        Self {
            fail_at: Some(step),
            ..Default::default()
        }
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().clone()
    }

    /// Step names without arguments
    pub fn step_names(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .map(|s| s.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    pub fn mark_exited(&self, pid: Pid) {
        self.exited.lock().insert(pid.as_raw());
    }

    fn step(&self, name: &'static str, detail: String) -> nix::Result<()> {
        self.steps.lock().push(format!("{}:{}", name, detail));
        if self.fail_at == Some(name) {
            return Err(Errno::EPERM);
        }
        Ok(())
    }
}

impl ProcessOps for RecordingOps {
    fn spawn(&self, child: &mut dyn FnMut() -> i32) -> nix::Result<Pid> {
        self.steps.lock().push("fork:".to_string());
        if self.fail_at == Some("fork") {
            return Err(Errno::EAGAIN);
        }

        let status = child();
        self.exit_statuses.lock().push(status);

        let mut next = self.next_pid.lock();
        *next += 1;
        Ok(Pid::from_raw(4000 + *next))
    }

    fn init_groups(&self, user: &CStr, group: Gid) -> nix::Result<()> {
        self.step("initgroups", format!("{}/{}", user.to_string_lossy(), group))
    }

    fn set_gid(&self, gid: Gid) -> nix::Result<()> {
        self.step("setgid", gid.to_string())
    }

    fn set_uid(&self, uid: Uid) -> nix::Result<()> {
        self.step("setuid", uid.to_string())
    }

    fn change_dir(&self, dir: &CStr) -> nix::Result<()> {
        self.step("chdir", dir.to_string_lossy().into_owned())
    }

    fn exec(&self, program: &CStr, argv: &[CString], envp: &[CString]) -> Errno {
        *self.exec_argv.lock() = argv
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        *self.exec_env.lock() = envp
            .iter()
            .map(|e| e.to_string_lossy().into_owned())
            .collect();

        match self.step("exec", program.to_string_lossy().into_owned()) {
            Err(errno) => errno,
            Ok(()) => Errno::ENOEXEC,
        }
    }

    fn try_reap(&self, pid: Pid) -> nix::Result<Option<i32>> {
        Ok(self.exited.lock().contains(&pid.as_raw()).then_some(0))
    }
}

// =============================================================================
// Assembly
// =============================================================================

pub struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub audit: Arc<MemoryAudit>,
    pub ops: Arc<RecordingOps>,
    pub orchestrator: AuthSessionOrchestrator,
}

/// Configuration scanning only `dirs`
pub fn config_with_dirs(dirs: &[&Path]) -> LoginConfig {
    let mut config = LoginConfig::default();
    config.sessions.directories = dirs.iter().map(|d| d.to_path_buf()).collect();
    config
}

pub fn harness(config: &LoginConfig, backend: ScriptedBackend, ops: RecordingOps) -> Harness {
    let backend = Arc::new(backend);
    let audit = Arc::new(MemoryAudit::default());
    let ops = Arc::new(ops);

    let orchestrator = AuthSessionOrchestrator::new(
        config,
        Collaborators {
            backend: backend.clone(),
            accounts: Arc::new(MemoryAccounts::with(alice())),
            audit: audit.clone(),
            processes: ops.clone(),
            messages: Arc::new(TracingMessageSink),
        },
    );

    Harness {
        backend,
        audit,
        ops,
        orchestrator,
    }
}

/// Write a session descriptor
pub fn write_descriptor(dir: &Path, name: &str, content: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{}.desktop", name)), content).unwrap();
}
