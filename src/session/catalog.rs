//! Session catalog
//!
//! Sessions are described by desktop entry files in a fixed, ordered list
//! of provisioning directories. The identifier of a session is the file
//! name without its extension.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{LoginError, Result};

/// Opaque name of a launchable session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Display server a session expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    X11,
    Wayland,
    /// Plain login shell
    Tty,
    Unspecified,
}

impl SessionType {
    /// Infer from the provisioning directory a descriptor was found in
    fn from_directory(dir: &Path) -> Self {
        match dir.file_name().and_then(|n| n.to_str()) {
            Some("xsessions") => Self::X11,
            Some("wayland-sessions") => Self::Wayland,
            _ => Self::Unspecified,
        }
    }

    /// Value for `XDG_SESSION_TYPE`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X11 => "x11",
            Self::Wayland => "wayland",
            Self::Tty => "tty",
            Self::Unspecified => "unspecified",
        }
    }
}

/// Parsed `[Desktop Entry]` group of a session descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesktopEntry {
    pub name: Option<String>,
    pub exec: Option<String>,
    pub try_exec: Option<String>,
    pub hidden: bool,
}

impl DesktopEntry {
    /// Parse descriptor contents
    ///
    /// Only the `[Desktop Entry]` group is read. Localized keys are ignored
    /// and field codes (`%f`, `%U`, ...) are stripped from `Exec`.
    pub fn parse(content: &str) -> Self {
        let mut entry = Self::default();
        let mut in_group = false;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') {
                in_group = line == "[Desktop Entry]";
                continue;
            }

            if !in_group {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "Name" => entry.name = Some(value.to_string()),
                "Exec" => entry.exec = Some(strip_field_codes(value)).filter(|v| !v.is_empty()),
                "TryExec" => entry.try_exec = Some(value.to_string()).filter(|v| !v.is_empty()),
                "Hidden" => entry.hidden = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        entry
    }
}

fn strip_field_codes(exec: &str) -> String {
    let mut out = String::with_capacity(exec.len());
    let mut chars = exec.chars();

    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.next() {
                Some('%') => out.push('%'),
                Some(_) | None => {}
            }
        } else {
            out.push(c);
        }
    }

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A session resolved to something that can be launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub id: SessionId,

    /// Human-readable name
    pub name: String,

    /// Command line run through the login shell; `None` runs the shell itself
    pub exec: Option<String>,

    pub session_type: SessionType,

    /// Descriptor the entry came from
    pub source: Option<PathBuf>,
}

impl SessionEntry {
    /// Plain login shell session
    pub fn failsafe(id: SessionId) -> Self {
        Self {
            name: id.to_string(),
            id,
            exec: None,
            session_type: SessionType::Tty,
            source: None,
        }
    }

    pub fn is_failsafe(&self) -> bool {
        self.exec.is_none()
    }
}

/// Discovers launchable sessions
#[derive(Debug, Clone)]
pub struct SessionCatalog {
    directories: Vec<PathBuf>,
    extension: String,
    fallback: SessionId,
    search_path: String,
}

impl SessionCatalog {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            directories: config.directories.clone(),
            extension: config.extension.clone(),
            fallback: SessionId::new(config.fallback.clone()),
            search_path: config.search_path.clone(),
        }
    }

    /// Fallback identifier offered when nothing else is available
    pub fn fallback(&self) -> &SessionId {
        &self.fallback
    }

    /// List launchable session identifiers
    ///
    /// Rebuilt on every call. Identifiers are deduplicated across
    /// directories, keeping discovery order. Never empty.
    pub fn list(&self) -> Vec<SessionId> {
        let mut seen = HashSet::new();
        let mut sessions = Vec::new();

        for (id, path, _) in self.scan() {
            // First descriptor for an identifier shadows the rest
            if !seen.insert(id.clone()) {
                debug!("Duplicate session descriptor ignored: {:?}", path);
                continue;
            }

            match self.load(&path) {
                Ok(entry) if entry.hidden => {
                    debug!("Hidden session skipped: {}", id);
                }
                Ok(entry) if !self.is_available(&entry) => {
                    debug!("Session {} skipped: TryExec not found", id);
                }
                Ok(_) => sessions.push(id),
                Err(e) => warn!("Failed to read session descriptor {:?}: {}", path, e),
            }
        }

        if sessions.is_empty() {
            debug!("No session descriptors found, offering {}", self.fallback);
            sessions.push(self.fallback.clone());
        }

        sessions
    }

    /// Resolve an identifier to its launchable entry
    ///
    /// The first descriptor in directory order wins, and only if [`list`]
    /// would offer it. The fallback identifier resolves to the login shell
    /// when it has no offered descriptor.
    ///
    /// [`list`]: SessionCatalog::list
    pub fn resolve(&self, id: &SessionId) -> Result<SessionEntry> {
        let mut withheld = false;

        for (found, path, session_type) in self.scan() {
            if &found != id {
                continue;
            }

            let entry = self.load(&path).map_err(|e| {
                warn!("Failed to read session descriptor {:?}: {}", path, e);
                LoginError::resource("Session descriptor unreadable")
            })?;

            if entry.hidden || !self.is_available(&entry) {
                debug!("Session {} is not offered: {:?}", id, path);
                withheld = true;
                break;
            }

            let Some(exec) = entry.exec else {
                warn!("Session descriptor {:?} has no Exec line", path);
                return Err(LoginError::resource("Session has no entry point"));
            };

            return Ok(SessionEntry {
                name: entry.name.unwrap_or_else(|| id.to_string()),
                id: id.clone(),
                exec: Some(exec),
                session_type,
                source: Some(path),
            });
        }

        if id == &self.fallback {
            return Ok(SessionEntry::failsafe(id.clone()));
        }

        if withheld {
            return Err(LoginError::resource(format!("Session not available: {}", id)));
        }
        Err(LoginError::resource(format!("Unknown session: {}", id)))
    }

    /// Every descriptor in every directory, directories in configured order
    fn scan(&self) -> Vec<(SessionId, PathBuf, SessionType)> {
        let mut found = Vec::new();

        for dir in &self.directories {
            let mut names = match read_descriptor_names(dir, &self.extension) {
                Ok(names) => names,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Session directory not present: {:?}", dir);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read session directory {:?}: {}", dir, e);
                    continue;
                }
            };

            // read_dir order is unspecified
            names.sort();

            let session_type = SessionType::from_directory(dir);
            for (id, path) in names {
                found.push((id, path, session_type));
            }
        }

        found
    }

    fn load(&self, path: &Path) -> io::Result<DesktopEntry> {
        std::fs::read_to_string(path).map(|content| DesktopEntry::parse(&content))
    }

    fn is_available(&self, entry: &DesktopEntry) -> bool {
        match &entry.try_exec {
            None => true,
            Some(program) if program.contains('/') => is_executable(Path::new(program)),
            Some(program) => self
                .search_path
                .split(':')
                .filter(|dir| !dir.is_empty())
                .any(|dir| is_executable(&Path::new(dir).join(program))),
        }
    }
}

fn read_descriptor_names(dir: &Path, extension: &str) -> io::Result<Vec<(SessionId, PathBuf)>> {
    let mut names = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if !stem.is_empty() {
                names.push((SessionId::from(stem), path.clone()));
            }
        }
    }

    Ok(names)
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
