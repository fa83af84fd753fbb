//! Utility Functions
//!
//! User-friendly error formatting for startup failures.

pub mod errors;

pub use errors::format_user_error;
