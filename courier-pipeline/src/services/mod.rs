//! The components behind the sender plugin.

pub mod buffer;
pub mod sender;
pub mod transport;
