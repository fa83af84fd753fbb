//! Audit trail of login attempts and session launch failures
//!
//! Append-only and best-effort: a failed write is logged by the caller and
//! never changes the outcome of the login it describes.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::ffi::CString;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::auth::AuthResult;

/// What happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    /// Authentication attempt; `outcome` is the result tag
    Login { success: bool, outcome: &'static str },

    /// The session child failed before its image was replaced
    LaunchFailed {
        session: String,
        stage: &'static str,
        failure: StepFailure,
    },
}

/// The child step that failed and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFailure {
    pub step: &'static str,
    pub errno: Errno,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.errno)
    }
}

/// Longest line a detached write will produce
const DETACHED_LINE_MAX: usize = 4096;

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub username: String,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Record for an authentication attempt
    pub fn login(username: &str, result: &AuthResult, timestamp: DateTime<Utc>) -> Self {
        Self {
            username: username.to_string(),
            outcome: AuditOutcome::Login {
                success: result.is_authenticated(),
                outcome: result.tag(),
            },
            timestamp,
        }
    }

    /// Record for a session child that could not start
    pub fn launch_failure(
        username: &str,
        session: &str,
        stage: &'static str,
        failure: StepFailure,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.to_string(),
            outcome: AuditOutcome::LaunchFailed {
                session: session.to_string(),
                stage,
                failure,
            },
            timestamp,
        }
    }

    /// Set where a prepared launch failure record stopped. Does not allocate.
    pub fn set_failure(&mut self, at: &'static str, what: StepFailure) {
        if let AuditOutcome::LaunchFailed { stage, failure, .. } = &mut self.outcome {
            *stage = at;
            *failure = what;
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Login { success: true, .. })
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = &self.timestamp;
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z ",
            ts.year(),
            ts.month(),
            ts.day(),
            ts.hour(),
            ts.minute(),
            ts.second()
        )?;
        match &self.outcome {
            AuditOutcome::Login { success, outcome } => write!(
                f,
                "Login attempt: user={} success={} outcome={} ip=localhost",
                Field(&self.username),
                if *success { "yes" } else { "no" },
                outcome
            ),
            AuditOutcome::LaunchFailed {
                session,
                stage,
                failure,
            } => write!(
                f,
                "Session launch: user={} session={} success=no stage={} error={}",
                Field(&self.username),
                Field(session),
                stage,
                failure
            ),
        }
    }
}

/// Caller-supplied value inside an audit line
///
/// Written bare when it is a plain token, otherwise quoted and escaped so a
/// value can never end the line or add fields.
struct Field<'a>(&'a str);

impl fmt::Display for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plain = !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | '='));
        if plain {
            f.write_str(self.0)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Audit collaborator
pub trait AuditSink: Send + Sync {
    /// Append one record
    fn record(&self, entry: &AuditEntry) -> Result<()>;

    /// Append one record from a forked child
    ///
    /// Must not allocate or wait on locks that another thread of the parent
    /// may have held at fork time.
    fn record_detached(&self, entry: &AuditEntry) -> io::Result<()> {
        self.record(entry).map_err(io::Error::other)
    }
}

/// Audit log file, one line per record
pub struct FileAuditLog {
    path: PathBuf,
    c_path: CString,
    lock: Mutex<()>,
}

impl FileAuditLog {
    /// Create audit log writer; parent directory is created if missing
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create audit log directory: {:?}", parent)
                })?;
            }
        }

        let c_path = CString::new(path.as_os_str().as_bytes())
            .context("Audit log path contains a NUL byte")?;

        tracing::info!("Audit log: {:?}", path);

        Ok(Self {
            path,
            c_path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = format!("{}\n", entry);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .context("Failed to open audit log")?;

        // Single write so lines from parent and session child never interleave
        file.write_all(line.as_bytes())
            .context("Failed to write to audit log")?;

        file.sync_all().context("Failed to sync audit log")?;

        Ok(())
    }
}

impl AuditSink for FileAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        let _guard = self.lock.lock();
        self.append(entry)
    }

    #[allow(unsafe_code)]
    fn record_detached(&self, entry: &AuditEntry) -> io::Result<()> {
        use std::os::unix::io::FromRawFd;

        let mut line = [0u8; DETACHED_LINE_MAX];
        let len = {
            let mut cursor = io::Cursor::new(&mut line[..]);
            writeln!(cursor, "{}", entry)?;
            cursor.position() as usize
        };

        // SAFETY: c_path is NUL-terminated and outlives the call
        let fd = unsafe {
            libc::open(
                self.c_path.as_ptr(),
                libc::O_WRONLY | libc::O_APPEND | libc::O_CREAT | libc::O_CLOEXEC,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just opened and nothing else owns it
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };

        file.write_all(&line[..len])?;
        file.sync_all()
    }
}

/// Audit sink used when audit logging is disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditLog;

impl AuditSink for NullAuditLog {
    fn record(&self, _entry: &AuditEntry) -> Result<()> {
        Ok(())
    }
}
