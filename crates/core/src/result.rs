//! Result type definition for tend operations.

use crate::error::Error;

/// The standard Result type for tend operations.
///
/// All fallible operations in the workspace return this type. Use the `?`
/// operator, `match`, or combinator methods to handle results.
pub type Result<T> = std::result::Result<T, Error>;
