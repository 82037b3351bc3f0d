//! # Passage Platform
//!
//! Shared types and service contracts for the Passage SSH gateway.
//!
//! This crate provides:
//! - Unified error types ([`PassageError`], [`PassageResult`])
//! - The spawn-service contract for running channel children
//!   ([`SpawnService`], [`PreparedChildProcess`])
//! - Access-control and credential contracts ([`AccessController`],
//!   [`CredentialChecker`])
//! - The delegated file-open contract ([`DelegatedOpen`])
//!
//! # Examples
//!
//! ```
//! use passage_platform::{PassageError, PassageResult};
//!
//! fn example_function() -> PassageResult<String> {
//!     Ok("Hello, Passage!".to_string())
//! }
//!
//! # fn main() -> PassageResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Passage!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
pub mod delegate;
pub mod error;
pub mod spawn;

pub use access::{
    AccessController, AccessDecision, AllowAll, CredentialChecker, RejectAllPasswords,
    SessionProfile,
};
pub use delegate::{DelegatedOpen, LocalDelegatedOpen};
pub use error::{PassageError, PassageResult};
pub use spawn::{
    ChildProcessHandle, ChildReader, ChildWriter, ExitOutcome, LocalSpawnService,
    PreparedChildProcess, PtyParams, SpawnService, SpawnedChild, StdioMode,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
