//! Core error taxonomy for the tend reconciliation engine.
//!
//! Every fallible operation in the workspace returns [`Result`]. Errors are
//! explicit, typed, and recoverable - no panics allowed.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
