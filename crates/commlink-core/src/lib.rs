//! # commlink-core
//!
//! Outbound scheduling and transport arbitration for a multi-transport
//! messaging node (network, radio, email, SMS, modem data link).
//!
//! ## Crate structure
//!
//! - [`message`] — Message value, transport tags, delivery states
//! - [`scheduler`] — Bounded priority queue feeding the transmitter
//! - [`transmitter`] — Fallback delivery loop, delivery reports and counters
//! - [`health`] — Periodic availability probing and status snapshots
//! - [`arbiter`] — Exclusive lease over the shared cellular modem
//! - [`adapter`] — Transport adapter trait
//! - [`reception`] — Bounded inbound buffer
//! - [`contacts`] — Receiver directory
//! - [`config`] — TOML configuration
//! - [`runtime`] — Context object owning everything above

pub mod adapter;
pub mod arbiter;
pub mod config;
pub mod contacts;
pub mod error;
pub mod health;
pub mod logging;
pub mod message;
pub mod reception;
pub mod runtime;
pub mod scheduler;
pub mod transmitter;

pub use adapter::{ResolvedPayload, TransportAdapter};
pub use config::CommlinkConfig;
pub use error::{ConfigError, DeliveryError, EnqueueError};
pub use message::{DeliveryState, Message, MessageDefaults, Payload, TransportKind};
pub use runtime::{CommlinkRuntime, SendRequest};
