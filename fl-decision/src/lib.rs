//! Decision-engine client for Fareline.
//!
//! Pure HTTP client; the engine's intent extraction and response
//! generation are opaque to this crate.

mod client;
mod error;
mod types;

pub use client::{DecisionClient, DecisionEngine};
pub use error::{DecisionError, Result};
pub use types::{Decision, DecisionContext, SideEffect, Turn, TurnRole};
