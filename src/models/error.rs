//! Error types for captionsieve.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad config, missing column, bad input)
//! - I^B materialized: Provider failures (forward pass, tokenizer, disk)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! Missing or corrupted images are deliberately absent from this taxonomy:
//! the pipeline recovers from them locally and never propagates them.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for captionsieve.
#[derive(Debug, Error)]
pub enum SieveError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (misconfiguration, bad input)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Column not found in dataset: '{0}'")]
    MissingColumn(String),

    #[error("Cannot resolve answer token for {literal:?}: {reason}")]
    AnswerToken { literal: &'static str, reason: String },

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Provider or disk failure, aborts the run
    // ═══════════════════════════════════════════════════════════════════

    #[error("Model error: {0}")]
    Model(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Dataset error: {0}")]
    Dataset(#[from] csv::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model weights not found in {0}")]
    WeightsNotFound(PathBuf),

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SieveError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a tokenizer error from any displayable failure.
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }

    /// Check if this error is a caller contract violation.
    ///
    /// These are raised before the first row is classified.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingColumn(_) | Self::AnswerToken { .. }
        )
    }
}

/// Result type alias for captionsieve.
pub type Result<T> = std::result::Result<T, SieveError>;
