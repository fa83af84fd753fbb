//! User sessions
//!
//! Discovery of launchable sessions and the privilege transition into one.
//!
//! # Architecture
//!
//! ```text
//! SessionCatalog
//!   └─> scans provisioning directories for *.desktop descriptors
//!
//! SessionLauncher
//!   ├─> AccountDatabase   (re-resolve uid/gid/home/shell)
//!   ├─> AuthBackend       (open backend session record)
//!   └─> ProcessOps        (fork, initgroups → setgid → setuid, chdir, execve)
//! ```

pub mod catalog;
pub mod launcher;
pub mod process;

pub use catalog::{DesktopEntry, SessionCatalog, SessionEntry, SessionId, SessionType};
pub use launcher::{LaunchResult, LaunchState, LaunchedSession, SessionLauncher};
pub use process::{ProcessOps, SystemProcessOps};
