//! Shared configuration, error types, and IDs for Quiver crates.
//!
//! Architecture role:
//! - defines planner configuration passed across layers
//! - provides common [`QvError`] / [`Result`] contracts and the positioned
//!   compile-error group used for user-facing diagnostics
//! - hosts typed identifiers used by the IR graph and distributed planner
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]

pub mod config;
pub mod error;
pub mod ids;

pub use config::PlannerConfig;
pub use error::{compile_err, CompileError, ErrorGroup, QvError, Result, SourceSpan};
pub use ids::*;
