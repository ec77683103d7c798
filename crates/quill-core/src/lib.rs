//! quill-core library.
//!
//! The session event pipeline: capture ([`recorder`]), delivery
//! ([`upload`]), the durable ledger ([`store`]), reconstruction
//! ([`replay`]) and derived behaviour signals ([`metrics`]).
//!
//! # Conventions
//!
//! - **Errors**: module-level `thiserror` enums; `anyhow::Result` at the
//!   configuration and application edges.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod recorder;
pub mod replay;
pub mod scheduler;
pub mod store;
pub mod upload;

/// Identifier of one student's work session against one assignment.
pub type AttemptId = i64;

/// Per-file content map, keyed by file path.
pub type FileMap = std::collections::BTreeMap<String, String>;
