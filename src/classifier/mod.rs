//! Classifier module - confidence-gated yes/no decisions for single samples.

mod confidence;

pub use confidence::*;
