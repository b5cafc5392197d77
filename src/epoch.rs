//! Settlement-lag height normalization
//!
//! The chain commits the effects of a message one block after the height the
//! ledger attributes it to. State "as of height H" is therefore read at the
//! first produced tipset at or after H + 1, which may be further ahead when
//! rounds were skipped.

use crate::chain_client::ChainQuery;
use crate::error::{CheckError, Result};
use std::sync::Arc;
use tracing::debug;

/// Maps a requested height to the evaluable block height.
///
/// Normalize exactly once per logical height: every call adds at least one
/// block of lag, so feeding the output back in drifts forward.
#[derive(Clone)]
pub struct EpochNormalizer {
    chain: Arc<dyn ChainQuery>,
}

impl EpochNormalizer {
    pub fn new(chain: Arc<dyn ChainQuery>) -> Self {
        Self { chain }
    }

    /// Evaluable height for state as of `requested`
    pub async fn normalize(&self, requested: u64) -> Result<u64> {
        let next = requested.saturating_add(1);
        let height = self
            .chain
            .tipset_after_height(next)
            .await
            .map_err(|e| CheckError::ChainUnavailable(format!("tipset after {}: {}", next, e)))?;
        debug!(requested, evaluable = height, "normalized height");
        Ok(height)
    }

    /// Current head height
    pub async fn head_height(&self) -> Result<u64> {
        self.chain
            .head_height()
            .await
            .map_err(|e| CheckError::ChainUnavailable(format!("chain head: {}", e)))
    }

    /// Default check height: `lag` blocks behind head, so the ledger has
    /// had time to index it.
    pub async fn height_behind_head(&self, lag: u64) -> Result<u64> {
        Ok(self.head_height().await?.saturating_sub(lag))
    }

    pub fn chain(&self) -> &Arc<dyn ChainQuery> {
        &self.chain
    }
}
