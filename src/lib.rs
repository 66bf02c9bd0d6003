//! Agora – a quiescence-driven actor runtime
//!
//! This crate implements areas: processes that
//! - publish broadcasts on named slots and follow other areas' broadcasts
//! - receive remote trigger calls as fire-and-forget command frames
//! - batch everything that arrives in a burst into one scheduling round
//! - keep a bounded, round-stamped history of what they received
//!
//! On top of the area contract sit two patterns: a harmonic clock and a
//! director that runs a multi-rate barrier over subordinate areas.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core: node, area, transport and history
pub mod runtime;

/// Clock and director patterns
pub mod patterns;

// Re-export key types for convenience
pub use runtime::{Area, RuntimeConfig};

/// Current version of the Agora runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
