//! ledger-invariants - Cross-validation of a lending protocol's ledger service
//!
//! The ledger service indexes protocol events into balances, liabilities and
//! supply figures. This crate recomputes the same quantities from chain state
//! and reports where they disagree. For account balances it also narrows a
//! disagreement down to the pair of ledger records that bracket it and lists
//! the chain-side changes in between.

pub mod config;
pub mod error;

/// Service clients
pub mod chain_client;
pub mod estimator_client;
pub mod ledger_client;

/// Height handling and height-indexed values
pub mod epoch;
pub mod series;

/// Divergence search
pub mod locator;
pub mod transitions;

/// Termination penalty estimates
pub mod estimates;
pub mod variance;

pub mod checks;
pub mod selection;

/// In-memory service fakes (feature-gated)
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use error::{CheckError, Result};
