//! Error handling utils.
//!
//! Recoverable failures of this crate are represented by [`Error`] and
//! travel through the usual [`Result`] channel. Invariant violations
//! (a fiber reset in the wrong state, a failed context switch, a scheduler
//! stopped from the wrong thread) are **not** recoverable errors: they log
//! the failed predicate together with a captured backtrace and abort the
//! process.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration variable was first registered with a different type.
    #[error("config variable '{name}' is already registered with type {type_name}")]
    ConfigTypeMismatch { name: String, type_name: &'static str },

    /// Configuration variable names are restricted to lowercase ascii
    /// alphanumerics, `.` and `_`.
    #[error("invalid config variable name: '{0}'")]
    InvalidConfigName(String),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
