//! Everything related to the `build.ninja` file format.
//!
//! > `ninja.build` file → [`read()`][self::read()] → [`crate::graph::State`]

mod eat;

// Visible within the crate (not re-exported) so `dyndep` can expand
// variable references the same way `read` does, without a separate copy
// of the expansion logic.
pub(crate) mod eval;

pub mod error;
pub mod parse;
pub mod read;

pub use self::read::{read, read_from};
