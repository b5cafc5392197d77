//! iFIL total supply check, with an optional search for the highest height
//! at which the ledger still agrees with the chain.

use super::{compare, CheckContext, Finding};
use crate::error::Result;
use crate::series::{HeightSeries, LedgerSupplySeries, TokenSupplySeries};
use tracing::{debug, info};

/// Blocks behind head used when no height is given
pub const DEFAULT_LAG: u64 = 2;

/// Heights examined per step of the backward search
pub const SEARCH_WINDOW: u64 = 10_000;

pub async fn check_at(ctx: &CheckContext, height: u64) -> Result<Vec<Finding>> {
    let ledger = LedgerSupplySeries::new(ctx.ledger.clone()).value_at(height).await?;
    let chain = TokenSupplySeries::new(ctx.normalizer.clone()).value_at(height).await?;
    Ok(compare("iFIL", "total supply", Some(height), ledger, chain)
        .into_iter()
        .collect())
}

/// Highest height at or below `max_height` where the ledger supply matches
/// the chain, assuming the ledger stays wrong once it goes wrong.
///
/// Walks backward in windows of [`SEARCH_WINDOW`]; the first window whose
/// lowest height passes is bisected. `None` when no height down to zero
/// passes.
pub async fn find_highest_passing(ctx: &CheckContext, max_height: u64) -> Result<Option<u64>> {
    let ledger = LedgerSupplySeries::new(ctx.ledger.clone());
    let chain = TokenSupplySeries::new(ctx.normalizer.clone());

    let mut top = max_height;
    loop {
        let bottom = top.saturating_sub(SEARCH_WINDOW - 1);
        info!(bottom, top, "searching for passing height");

        if agrees(&ledger, &chain, bottom).await? {
            let highest = bisect(&ledger, &chain, bottom, top).await?;
            info!(height = highest, "highest passing height");
            return Ok(Some(highest));
        }
        if bottom == 0 {
            return Ok(None);
        }
        top = bottom - 1;
    }
}

/// `good` is known to pass; find the last passing height up to `top`
async fn bisect(
    ledger: &dyn HeightSeries,
    chain: &dyn HeightSeries,
    good: u64,
    top: u64,
) -> Result<u64> {
    if good == top || agrees(ledger, chain, top).await? {
        return Ok(top);
    }
    let (mut lo, mut hi) = (good, top);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if agrees(ledger, chain, mid).await? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

async fn agrees(ledger: &dyn HeightSeries, chain: &dyn HeightSeries, height: u64) -> Result<bool> {
    let pass = ledger.value_at(height).await? == chain.value_at(height).await?;
    debug!(height, pass, "supply probe");
    Ok(pass)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, FakeLedger};
    use std::sync::Arc;

    fn context() -> CheckContext {
        // the ledger misses a mint at 15_000
        let ledger = FakeLedger::new().with_supply(&[(100, 5), (20_000, 9)]);
        let chain = FakeChain::new(30_000).with_supply(&[(101, 5), (15_001, 7), (20_001, 16)]);
        CheckContext::new(Arc::new(ledger), Arc::new(chain))
    }

    #[tokio::test]
    async fn test_check_at() {
        let ctx = context();
        assert!(check_at(&ctx, 14_000).await.unwrap().is_empty());
        assert_eq!(check_at(&ctx, 25_000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_highest_passing_across_windows() {
        let ctx = context();
        assert_eq!(find_highest_passing(&ctx, 25_000).await.unwrap(), Some(14_999));
    }

    #[tokio::test]
    async fn test_nothing_passes() {
        let ledger = FakeLedger::new().with_supply(&[(0, 1)]);
        let chain = FakeChain::new(30_000).with_supply(&[(0, 2)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));
        assert_eq!(find_highest_passing(&ctx, 12_000).await.unwrap(), None);
    }
}
