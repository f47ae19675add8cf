//! Foundational system components for the courier services.
//!
//! A service runs as a tokio task and receives messages from an inbox. Callers hold an [`Addr`]
//! and send messages that are converted into the service's [`Interface`] enum through
//! [`FromMessage`]. Messages either expect no response ([`NoResponse`]) or resolve a future once
//! the service answers ([`AsyncResponse`]).
#![warn(missing_docs)]

mod service;

pub use self::service::*;
