//! RelayQ
//!
//! An asynchronous HTTP-to-queue-to-HTTP router. Requests submitted to the
//! ingress API are buffered through a pluggable message broker, forwarded
//! to configurable upstream endpoints by a worker pool, and their results
//! retrieved by correlation id from a TTL-bound state store.
//!
//! # Architecture
//!
//! ```text
//! Client ──▶ Ingress ──▶ Queue ──▶ Worker ──▶ Processor ──▶ Upstream
//!                                                │
//!              Client ◀── Query API ◀── State store
//! ```
//!
//! # Modules
//!
//! - [`config`] - layered configuration (defaults, file, environment)
//! - [`queue`] - broker abstraction and the concrete drivers
//! - [`store`] - correlation-id-keyed state store
//! - [`routing`] - route matching and payload transformation
//! - [`partition`] - partition assignment and sticky sessions
//! - [`processor`] - routing + partitioning + HTTP forwarding
//! - [`worker`] - consume loop, retries, DLQ, shutdown
//! - [`handlers`] - REST API
//! - [`models`] - queue messages, persisted records, API bodies
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - crate error type

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod partition;
pub mod processor;
pub mod queue;
pub mod routing;
pub mod store;
pub mod util;
pub mod worker;

pub use error::{RelayError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
