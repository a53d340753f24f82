//! HL7 Loader Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error taxonomy and logging setup for the HL7 loader workspace.
//!
//! - **Error Handling**: [`IngestError`] classifies every failure the loader can
//!   hit (decode, schema conflict, transient and permanent remote errors)
//! - **Logging**: [`logging::init_logging`] installs the `tracing` subscriber
//!
//! # Example
//!
//! ```no_run
//! use hl7_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!("loader started");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{IngestError, Result};
