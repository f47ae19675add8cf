//! Telemetry items and the envelope wire format.
//!
//! Producers create a [`TelemetryItem`], which travels through the plugin chain and may be
//! amended on the way. The sender converts it into an [`Envelope`] by checking its `baseData`
//! against the static [`Contract`] of its [`BaseType`], truncating oversized values and mapping
//! context extensions onto flat tags. Envelopes are serialized individually and joined into
//! batches according to a [`BatchFormat`].
//!
//! Contract checks never fail hard. [`Envelope::from_item`] returns [`ContractViolations`] with
//! the partially built envelope, and the caller decides whether to proceed.
#![warn(missing_docs)]

mod batch;
mod contract;
mod envelope;
mod item;
mod sanitize;
mod tags;

pub use self::batch::*;
pub use self::contract::*;
pub use self::envelope::*;
pub use self::item::*;
pub use self::sanitize::*;
pub use self::tags::*;
