//! Protocol metrics check: pool total assets, pool total borrowed and agent
//! count, all at one height.

use super::{compare, CheckContext, Finding};
use crate::error::Result;
use num_bigint::BigInt;

/// Blocks behind head used when no height is given
pub const DEFAULT_LAG: u64 = 2;

pub async fn check_at(ctx: &CheckContext, height: u64) -> Result<Vec<Finding>> {
    let reported = ctx.ledger.metrics_at(height).await?;
    let block = ctx.normalizer.normalize(height).await?;
    let chain = ctx.chain();
    let (assets, borrowed, agents) = futures::try_join!(
        chain.pool_total_assets(block),
        chain.pool_total_borrowed(block),
        chain.agent_count(block),
    )?;

    let comparisons = [
        ("pool total assets", reported.pool_total_assets, assets),
        ("pool total borrowed", reported.pool_total_borrowed, borrowed),
        (
            "agent count",
            BigInt::from(reported.total_agent_count),
            BigInt::from(agents),
        ),
    ];

    Ok(comparisons
        .into_iter()
        .filter_map(|(quantity, ledger, node)| {
            compare("Pool", quantity, Some(height), ledger, node)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, FakeLedger};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_each_metric_reported_separately() {
        let ledger = FakeLedger::new().with_metrics(&[(0, 100)], &[(0, 40)], &[(0, 7)]);
        let chain = FakeChain::new(1_000)
            .with_pool(&[(0, 100)], &[(0, 41)])
            .with_agent_count(&[(0, 8)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));

        let findings = check_at(&ctx, 998).await.unwrap();
        let quantities: Vec<&str> = findings
            .iter()
            .filter_map(|f| match f {
                Finding::Mismatch { quantity, .. } => Some(*quantity),
                _ => None,
            })
            .collect();
        assert_eq!(quantities, vec!["pool total borrowed", "agent count"]);
    }

    #[tokio::test]
    async fn test_compares_normalized_chain_state() {
        // ledger attributes the deposit to 500; the chain commits it at 501
        let ledger = FakeLedger::new().with_metrics(&[(500, 10)], &[], &[]);
        let chain = FakeChain::new(1_000).with_pool(&[(501, 10)], &[]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));
        assert!(check_at(&ctx, 500).await.unwrap().is_empty());
    }
}
