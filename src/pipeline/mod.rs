//! Pipeline module - confidence-gated dataset filtering.

mod filter;

pub use filter::*;
