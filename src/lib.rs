//! tagrelay – relays RFID tag reads from an AMQP queue to per-cabin topics.
//!
//! This crate exports
//!  * `core`   – message model, destination resolution, error taxonomy
//!  * `store`  – SQLite record store and sample seeding
//!  * `broker` – broker channel trait, AMQP and in-process implementations,
//!               topology setup
//!  * `relay`  – the consume → lookup → publish → ack engine
//!  * `config` – TOML + environment runtime configuration
//!
//! Downstream applications can embed the relay (`serve`) against any
//! [`broker::BrokerChannel`] or run the full daemon (`run`).

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod daemon;
pub mod logging;
pub mod relay;
pub mod store;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use config::{Config, ConfigError};
pub use daemon::{run, serve};
pub use relay::{Relay, RelayConfig, RejectPolicy};
