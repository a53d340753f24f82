//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function returning the
//! process exit status.

pub mod inspect;
pub mod load;

/// Exit status when a run could not start or was aborted
pub const EXIT_ABORTED: i32 = 2;
