//! Agent available balance check
//!
//! Without a height, compare the ledger's stored latest balance with its own
//! recomputation from the node; on mismatch, locate where the transaction
//! log diverges from the chain and list the chain changes around it. With a
//! height, compare the log's balance at that height with the agent's liquid
//! assets on chain.

use super::{compare, CheckContext, Finding};
use crate::chain_client::EthAddress;
use crate::error::Result;
use crate::ledger_client::Agent;
use crate::locator::DivergenceLocator;
use crate::series::{HeightSeries, LedgerBalanceSeries, LiquidAssetsSeries};
use crate::transitions::explain_bracket;
use tracing::info;

pub async fn check_agent(
    ctx: &CheckContext,
    agent: &Agent,
    height: Option<u64>,
) -> Result<Vec<Finding>> {
    match height {
        None => check_latest(ctx, agent).await,
        Some(h) => check_at(ctx, agent, h).await,
    }
}

async fn check_latest(ctx: &CheckContext, agent: &Agent) -> Result<Vec<Finding>> {
    let subject = format!("Agent {}", agent.id);
    let snapshot = ctx.ledger.available_balance(agent.id).await?;
    let Some(mismatch) = compare(
        &subject,
        "latest available balance",
        None,
        snapshot.stored,
        snapshot.recomputed,
    ) else {
        return Ok(Vec::new());
    };

    let mut findings = vec![mismatch];
    findings.extend(examine_history(ctx, agent).await?);
    Ok(findings)
}

async fn check_at(ctx: &CheckContext, agent: &Agent, height: u64) -> Result<Vec<Finding>> {
    let subject = format!("Agent {}", agent.id);
    let records = ctx.ledger.transactions(agent.id).await?;
    let ledger = LedgerBalanceSeries::new(records).value_at(height).await?;
    let chain = liquid_assets(ctx, agent)?.value_at(height).await?;
    Ok(compare(&subject, "available balance", Some(height), ledger, chain)
        .into_iter()
        .collect())
}

/// Bisect the agent's transaction log against its liquid assets on chain.
///
/// Returns a [`Finding::Divergence`] when a bracket is found; `None` when the
/// log agrees with the chain at every record and at head.
pub async fn examine_history(ctx: &CheckContext, agent: &Agent) -> Result<Option<Finding>> {
    let records = ctx.ledger.transactions(agent.id).await?;
    info!(agent = agent.id, count = records.len(), "examining transaction history");

    let head = ctx.normalizer.head_height().await?;
    let series = liquid_assets(ctx, agent)?;
    let Some(bracket) = DivergenceLocator::new(&series, agent.height, head)
        .locate(&records)
        .await?
    else {
        info!(agent = agent.id, "transaction log agrees with node");
        return Ok(None);
    };

    let transitions = explain_bracket(&series, &bracket).await?;
    Ok(Some(Finding::Divergence {
        agent_id: agent.id,
        bracket,
        transitions,
    }))
}

fn liquid_assets(ctx: &CheckContext, agent: &Agent) -> Result<LiquidAssetsSeries> {
    let address: EthAddress = agent.address_native.parse()?;
    Ok(LiquidAssetsSeries::new(ctx.normalizer.clone(), address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::BracketOrigin;
    use crate::testing::{agent, FakeChain, FakeLedger};
    use num_bigint::BigInt;
    use std::sync::Arc;

    fn addr() -> EthAddress {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[tokio::test]
    async fn test_latest_match_skips_history() {
        let ledger = FakeLedger::new().with_agent(agent(1, addr(), 90)).with_snapshot(1, 50, 50);
        let chain = Arc::new(FakeChain::new(1_000));
        let ctx = CheckContext::new(Arc::new(ledger), chain.clone());
        let findings = check_agent(&ctx, &agent(1, addr(), 90), None).await.unwrap();
        assert!(findings.is_empty());
        assert_eq!(chain.evaluations(), 0);
    }

    #[tokio::test]
    async fn test_latest_mismatch_is_explained() {
        // chain moved at 159 (normalized reads see it from height 158); the log missed it
        let ledger = FakeLedger::new()
            .with_snapshot(1, 50, 75)
            .with_transactions(1, &[(100, 0), (200, 50)]);
        let chain = FakeChain::new(1_000).with_liquid_assets(addr(), &[(0, 0), (159, 75)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));

        let findings = check_agent(&ctx, &agent(1, addr(), 90), None).await.unwrap();
        assert_eq!(findings.len(), 2);
        match &findings[1] {
            Finding::Divergence {
                bracket, transitions, ..
            } => {
                assert_eq!(bracket.origin, BracketOrigin::WithinLog);
                assert_eq!((bracket.good.height, bracket.bad.height), (100, 200));
                assert_eq!(transitions.len(), 1);
                assert_eq!(transitions[0].height, 158);
                assert_eq!(transitions[0].value, BigInt::from(75));
            }
            other => panic!("expected divergence, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_at_height() {
        let ledger = FakeLedger::new().with_transactions(1, &[(100, 10), (200, 20)]);
        let chain = FakeChain::new(1_000).with_liquid_assets(addr(), &[(101, 10), (201, 21)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));
        let a = agent(1, addr(), 90);
        assert!(check_agent(&ctx, &a, Some(150)).await.unwrap().is_empty());
        let findings = check_agent(&ctx, &a, Some(250)).await.unwrap();
        assert!(matches!(findings[0], Finding::Mismatch { height: Some(250), .. }));
    }

    #[tokio::test]
    async fn test_at_height_reads_piecewise_log() {
        // before the first record the ledger reports zero; between records the earlier one holds
        let ledger = FakeLedger::new().with_transactions(1, &[(100, 10), (200, 20)]);
        let chain = FakeChain::new(1_000).with_liquid_assets(addr(), &[(101, 10), (160, 12)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(chain));
        let a = agent(1, addr(), 90);
        assert!(check_agent(&ctx, &a, Some(50)).await.unwrap().is_empty());
        let findings = check_agent(&ctx, &a, Some(199)).await.unwrap();
        match &findings[..] {
            [Finding::Mismatch { ledger, chain, .. }] => {
                assert_eq!(*ledger, BigInt::from(10));
                assert_eq!(*chain, BigInt::from(12));
            }
            other => panic!("unexpected findings {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_address_is_an_error() {
        let ledger = FakeLedger::new().with_transactions(1, &[(100, 10)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(FakeChain::new(1_000)));
        let mut a = agent(1, addr(), 90);
        a.address_native = "0x12".to_string();
        assert!(check_agent(&ctx, &a, Some(150)).await.is_err());
    }
}
