//! captionsieve - Confidence-gated dataset filtering with local language models.
//!
//! ## Architecture
//!
//! captionsieve asks a model a yes/no question about every row of a
//! delimited dataset (optionally with the row's image) and keeps the rows
//! the model answers "yes" to with enough confidence:
//! - **Provider**: `LanguageModel` + `Processor` traits, with a bundled
//!   candle Llama backend for text mode
//! - **Classifier**: Logit-space threshold with a top-k readiness gate
//! - **Pipeline**: Per-row driver with image recovery and checkpoints
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Model and disk uncertainties (fallback decisions, checkpoints)

pub mod checkpoint;
pub mod classifier;
pub mod models;
pub mod pipeline;
pub mod provider;

// Re-exports for convenience
pub use checkpoint::{CheckpointManager, CheckpointState, RunSignature, write_kept_rows};
pub use classifier::{ConfidenceClassifier, Decision, Readiness, required_logit_diff};
pub use models::{Config, ConfigError, Dataset, PromptTemplate, Result, RunStats, SieveError, TableFormat};
pub use pipeline::{FilterOutcome, FilterPipeline, FilterSettings};
pub use provider::{AnswerTokens, EncodedInput, LanguageModel, Processor};
