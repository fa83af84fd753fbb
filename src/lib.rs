//! # lamco-login
//!
//! Authentication and session-launch core of a login manager.
//!
//! # Architecture
//!
//! ```text
//! AuthSessionOrchestrator
//!   ├─> Authenticator        (one backend transaction per attempt)
//!   │     └─> ConversationBridge ↔ AuthBackend (PAM)
//!   ├─> SessionCatalog       (*.desktop descriptors, "failsafe" fallback)
//!   └─> SessionLauncher      (backend session, fork, privilege drop, exec)
//! ```
//!
//! # Data Flow
//!
//! **Login:** Greeter → `authenticate` → Authenticator ↔ backend → `AuthResult` → Greeter
//!
//! **Launch:** Greeter → `launch` → SessionCatalog → SessionLauncher → session process
//!
//! Every external service (backend, account database, audit log, process
//! primitives) is a trait object handed in through
//! [`orchestrator::Collaborators`], so the whole pipeline runs in tests
//! without root or a real PAM stack.

#![warn(clippy::all)]

/// Audit trail of login attempts
pub mod audit;

/// Credentials, identities and authentication transactions
pub mod auth;

/// Authentication backends
pub mod backend;

/// Configuration
pub mod config;

/// Login error taxonomy
pub mod error;

/// Terminal front end
pub mod greeter;

/// Facade used by the greeter
pub mod orchestrator;

/// Session discovery and launch
pub mod session;

/// Utility functions
pub mod utils;

pub use auth::{AuthResult, Credential, Identity};
pub use error::{LoginError, Result};
pub use orchestrator::{AuthSessionOrchestrator, Collaborators};
pub use session::{LaunchResult, SessionId};
