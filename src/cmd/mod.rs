//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                                  |
//! |------------|---------------------------------------------------|
//! | `project`  | `Init`, `Status`, `Reset`                         |
//! | `phase`    | `Advance`, `Rollback`, `Transition`, `Gate`       |
//! | `audit`    | `Audit`                                           |
//! | `records`  | `Decide`, `Error`, `Context`                      |
//! | `drift`    | `Drift`, `Checksums`, `Breaker`                   |
//! | `config`   | `Config`                                          |

pub mod audit;
pub mod config;
pub mod drift;
pub mod logging;
pub mod phase;
pub mod project;
pub mod records;
pub mod session;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use drift::{cmd_breaker, cmd_checksums, cmd_drift};
pub use phase::{cmd_gate, cmd_transition};
pub use project::{cmd_init, cmd_reset, cmd_status};
pub use records::{cmd_context, cmd_decide, cmd_error};

use anyhow::{Context, Result};
use serde::Serialize;

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}
