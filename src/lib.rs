//! # hvbusd
//!
//! Core library for a daemon that bridges a multi-master serial automation
//! bus (heating/ventilation controllers) to TCP clients.
//!
//! ## Features
//!
//! - **Bus protocol engine**: framing, checksum validation, multi-master
//!   arbitration with byte-echo collision detection, bounded retries
//! - **Command codec**: typed encode/decode against a CSV-loaded dictionary
//! - **Cyclic polling**: per-entry intervals with a stale-tolerant value cache
//! - **Request bridge**: two-class bounded FIFO queue funneling all client
//!   and poll traffic into a single stream of bus transactions
//!
//! ## Architecture
//!
//! - [`frame`] - telegram layout, CRC, sync/escape handling
//! - [`registry`] - immutable command dictionary
//! - [`loader`] - CSV command-definition loading
//! - [`codec`] - parameter/reply field encoding rules
//! - [`transport`] - serial/TCP byte transports and the scripted test mock
//! - [`engine`] - per-transaction bus state machine
//! - [`bridge`] - request queue and dispatch loop
//! - [`cyclic`] - background poll scheduler and cache
//!
//! The protocol core is synchronous; the daemon binary runs the dispatch
//! loop on a dedicated thread and keeps tokio at the network edge.

#![deny(warnings)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod cyclic;
pub mod dump;
pub mod engine;
pub mod error;
pub mod frame;
pub mod loader;
pub mod registry;
pub mod transport;

// Re-export main public types for convenience
pub use bridge::{Bridge, RequestOrigin, RequestQueue, TransactionResult};
pub use cyclic::{CyclicCache, PollScheduler};
pub use engine::{BusEngine, Transaction};
pub use error::BusError;
pub use registry::{CommandDefinition, CommandRegistry, ReplyValues, Value};
