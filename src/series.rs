//! Height-indexed series
//!
//! A [`HeightSeries`] answers "what is the value at height H". Chain-backed
//! series normalize H for settlement lag before reading; ledger-backed series
//! read what the ledger reports for H.

use crate::chain_client::EthAddress;
use crate::epoch::EpochNormalizer;
use crate::error::Result;
use crate::ledger_client::{balance_at, Ledger, TransactionRecord};
use async_trait::async_trait;
use num_bigint::BigInt;
use std::sync::Arc;
use tracing::trace;

/// Value of some quantity as a function of height. Need not be total.
#[async_trait]
pub trait HeightSeries: Send + Sync {
    async fn value_at(&self, height: u64) -> Result<BigInt>;
}

#[async_trait]
impl<S: HeightSeries + ?Sized> HeightSeries for Arc<S> {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        (**self).value_at(height).await
    }
}

/// An agent's liquid assets, recomputed on chain
pub struct LiquidAssetsSeries {
    normalizer: EpochNormalizer,
    agent: EthAddress,
}

impl LiquidAssetsSeries {
    pub fn new(normalizer: EpochNormalizer, agent: EthAddress) -> Self {
        Self { normalizer, agent }
    }
}

#[async_trait]
impl HeightSeries for LiquidAssetsSeries {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        let block = self.normalizer.normalize(height).await?;
        let value = self
            .normalizer
            .chain()
            .agent_liquid_assets(&self.agent, block)
            .await?;
        trace!(agent = %self.agent, height, block, %value, "liquid assets");
        Ok(value)
    }
}

/// iFIL total supply, recomputed on chain
pub struct TokenSupplySeries {
    normalizer: EpochNormalizer,
}

impl TokenSupplySeries {
    pub fn new(normalizer: EpochNormalizer) -> Self {
        Self { normalizer }
    }
}

#[async_trait]
impl HeightSeries for TokenSupplySeries {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        let block = self.normalizer.normalize(height).await?;
        self.normalizer.chain().ifil_total_supply(block).await
    }
}

/// Ledger-reported balance from an already fetched transaction log
pub struct LedgerBalanceSeries {
    records: Vec<TransactionRecord>,
}

impl LedgerBalanceSeries {
    pub fn new(records: Vec<TransactionRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl HeightSeries for LedgerBalanceSeries {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        Ok(balance_at(&self.records, height))
    }
}

/// Ledger-reported iFIL total supply, one request per height
pub struct LedgerSupplySeries {
    ledger: Arc<dyn Ledger>,
}

impl LedgerSupplySeries {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl HeightSeries for LedgerSupplySeries {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        Ok(self.ledger.ifil_total_supply(height).await?.total_supply)
    }
}
