//! Crate-local error types.
//!
//! Per the propagation policy: these are the broadcaster's *synchronous*,
//! producer-facing failures only. Session-scoped failures (auth, protocol,
//! capacity, permission, replay) never become a Rust `Error` that crosses
//! a task boundary — they're modeled as wire values in `fabric_protocol`
//! and handled locally to the session, per §7.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("unknown event type: {0}")]
    InvalidEventType(String),
    #[error("broadcaster ingest channel is closed")]
    QueueClosed,
    #[error("config: {0}")]
    Config(String),
}

pub type FabricResult<T> = Result<T, FabricError>;
