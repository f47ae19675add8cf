//! Common functionality for the courier crates.
#![warn(missing_docs)]

mod macros;
pub mod time;

#[doc(hidden)]
pub use serde as __serde;
