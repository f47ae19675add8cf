//! Deterministic sampling of telemetry items.
//!
//! The [`Sampler`] decides whether an item is kept for a configured percentage. The decision is
//! based on a [score](score) computed from a correlation key of the item, so that all items of
//! the same user or operation are either kept or dropped together.
//!
//! # Example
//!
//! ```
//! use courier_protocol::TelemetryItem;
//! use courier_sampling::Sampler;
//!
//! let sampler = Sampler::new(Some(100.0));
//! assert!(sampler.is_sampled_in(&TelemetryItem::event("checkout")));
//! ```
#![warn(missing_docs)]

mod hash;
mod sampler;

pub use self::hash::*;
pub use self::sampler::*;
