//! Correlation and decryption-assist engine.
//!
//! Reconciles two independently timed streams: finished transactions from a protocol-level
//! inspector (real timing and headers, ciphertext bodies) and send/receive events captured
//! inside the page itself (plaintext bodies, page-clock timestamps). Plaintext events are
//! matched to records by method + URL and nearest timestamp; bodies that still look like
//! ciphertext can be handed to a page-supplied decryption function.

pub mod bridge;
pub mod config;
pub mod decrypt;
pub mod engine;
pub mod eval;
pub mod index;
pub mod metrics;
pub mod model;
pub mod store;

use thiserror::Error;

pub use config::CaptureConfig;
pub use engine::{Correlator, CorrelatorHandle, Session, StoreEvent};
pub use eval::{EvalError, PageEvaluator};
pub use model::{BodySide, PlainEvent, ProtocolRecord, RecordId};

/// Errors surfaced by the correlator control handle.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("correlator stopped")]
    ChannelClosed,
    #[error("export failed: {0}")]
    Export(#[source] serde_json::Error),
}
