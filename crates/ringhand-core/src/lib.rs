//! Ambient pieces shared by the ringhand workspace.
//!
//! - `config`: process-wide backoff tuning, loaded from file/env once
//! - `logging`: tracing subscriber bootstrap
//! - `error`: configuration errors

pub mod config;
pub mod error;
pub mod logging;

pub use self::config::*;
pub use error::*;
pub use logging::init_tracing;
