//! Miner liquidation check
//!
//! Computes each miner's termination penalty three ways, checks them against
//! the full computation and, when the miner comes from the ledger, checks the
//! ledger-reported penalty too.

use super::{CheckContext, Finding};
use crate::error::Result;
use crate::estimates::{
    run_estimates, EstimateOutcome, LogProgress, PenaltyEstimator, ProgressSink, TimedEstimate,
};
use crate::ledger_client::{Agent, MinerDetails};
use crate::selection::pick_random;
use crate::variance::{reconcile, to_fil_string};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Blocks behind head used when no height is given
pub const DEFAULT_LAG: u64 = 3;

/// Partitions between progress log lines
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct LiquidationOptions {
    pub height: u64,
    /// Deadline for all three estimates of one miner
    pub timeout: Duration,
    pub max_pct_variance: f64,
    pub show_progress: bool,
}

/// A miner to check and, when known, who owns it
#[derive(Debug, Clone)]
pub struct MinerTarget {
    /// Filecoin address, e.g. `f01234`
    pub miner: String,
    pub agent: Option<Agent>,
    /// Ledger entry; provides the API-reported penalty
    pub details: Option<MinerDetails>,
    /// Position within the agent's miners, e.g. `2/5`
    pub position: Option<String>,
}

impl MinerTarget {
    pub fn standalone(miner: impl Into<String>) -> Self {
        Self {
            miner: miner.into(),
            agent: None,
            details: None,
            position: None,
        }
    }

    pub fn subject(&self) -> String {
        let mut subject = String::new();
        if let Some(agent) = &self.agent {
            subject.push_str(&format!("Agent {}: ", agent.id));
        }
        subject.push_str("Miner ");
        if let Some(position) = &self.position {
            subject.push_str(&format!("{} ", position));
        }
        subject.push_str(&self.miner);
        subject
    }
}

/// Every miner of one agent, in ledger order
pub async fn targets_for_agent(ctx: &CheckContext, agent: &Agent) -> Result<Vec<MinerTarget>> {
    info!(
        agent = agent.id,
        height = agent.height,
        miners = agent.miners,
        borrowed_fil = %to_fil_string(&agent.principal_balance),
        "loading agent miners"
    );
    let miners = ctx.ledger.miners(agent.id).await?;
    let count = miners.len();
    Ok(miners
        .into_iter()
        .enumerate()
        .map(|(i, details)| MinerTarget {
            miner: details.miner_addr.clone(),
            agent: Some(agent.clone()),
            details: Some(details),
            position: Some(format!("{}/{}", i + 1, count)),
        })
        .collect())
}

/// Up to `n` miners drawn uniformly from every agent's miners.
///
/// Draws from the miner counts on the agent summaries, then fetches only the
/// chosen agents' miner lists. A slot past the end of a shorter list is
/// skipped.
pub async fn random_targets<R: Rng + ?Sized>(
    ctx: &CheckContext,
    n: usize,
    rng: &mut R,
) -> Result<Vec<MinerTarget>> {
    let agents = ctx.ledger.agents().await?;
    let slots: Vec<(usize, usize)> = agents
        .iter()
        .enumerate()
        .flat_map(|(a, agent)| (0..agent.miners as usize).map(move |m| (a, m)))
        .collect();
    info!(agents = agents.len(), miners = slots.len(), "miners loaded");

    let mut targets = Vec::new();
    for (a, m) in pick_random(slots, n, rng) {
        let agent = &agents[a];
        let mut miners = targets_for_agent(ctx, agent).await?;
        if m < miners.len() {
            targets.push(miners.swap_remove(m));
        } else {
            warn!(
                agent = agent.id,
                slot = m,
                listed = miners.len(),
                "miner count changed, skipping"
            );
        }
    }
    Ok(targets)
}

/// Run and reconcile the three estimates for one miner
pub async fn check_miner(
    estimator: Arc<dyn PenaltyEstimator>,
    target: &MinerTarget,
    options: &LiquidationOptions,
) -> Result<Vec<Finding>> {
    let subject = target.subject();
    info!(%subject, height = options.height, "checking termination burn");

    let deadline = Instant::now() + options.timeout;
    let mut sink: Box<dyn ProgressSink + Send> = if options.show_progress {
        Box::new(LogProgress::new(target.miner.clone(), PROGRESS_EVERY))
    } else {
        Box::new(())
    };

    let outcome = run_estimates(
        estimator,
        &target.miner,
        options.height,
        deadline,
        sink.as_mut(),
    )
    .await?;
    let set = match outcome {
        EstimateOutcome::Completed(set) => set,
        EstimateOutcome::TimedOut { elapsed, .. } => {
            warn!(%subject, ?elapsed, "estimates timed out");
            return Ok(vec![Finding::EstimateTimedOut {
                miner: subject,
                elapsed,
            }]);
        }
    };

    log_tier(&subject, "quick", &set.quick);
    log_tier(&subject, "sampled", &set.sampled);
    log_tier(&subject, "full", &set.full);

    let api = target.details.as_ref().map(|d| &d.termination_penalty);
    if let Some(penalty) = api {
        info!(%subject, penalty_fil = %to_fil_string(penalty), "termination penalty via API");
    }
    let principal = target.agent.as_ref().map(|a| &a.principal_balance);
    let reconciliation = reconcile(&set.triple(), api, principal, options.max_pct_variance);

    if !reconciliation.quick_matches_sampled {
        info!(%subject, "quick and sampled methods don't match");
    }
    for (tier, result) in reconciliation.results() {
        info!(%subject, "{} method {}", tier, result);
    }

    if reconciliation.passed() {
        Ok(Vec::new())
    } else {
        for breach in &reconciliation.breaches {
            warn!(%subject, "assertion failed: {}", breach);
        }
        Ok(vec![Finding::VarianceExceeded {
            miner: subject,
            breaches: reconciliation.breaches,
        }])
    }
}

fn log_tier(subject: &str, tier: &str, timed: &TimedEstimate) {
    info!(
        subject,
        tier,
        penalty_fil = %to_fil_string(&timed.estimate.termination_penalty),
        sectors_terminated = timed.estimate.sectors_terminated,
        sectors = timed.estimate.sectors_count,
        elapsed = ?timed.elapsed,
        "estimate"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{agent, miner, FakeChain, FakeEstimator, FakeLedger};
    use crate::variance::Tier;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn options() -> LiquidationOptions {
        LiquidationOptions {
            height: 997,
            timeout: Duration::from_secs(5),
            max_pct_variance: 5.0,
            show_progress: false,
        }
    }

    #[tokio::test]
    async fn test_small_variance_passes() {
        let estimator = Arc::new(FakeEstimator::new(1000, 1000, 1050));
        let findings = check_miner(estimator, &MinerTarget::standalone("f01234"), &options())
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_large_variance_fails() {
        let estimator = Arc::new(FakeEstimator::new(1000, 1000, 1200));
        let findings = check_miner(estimator, &MinerTarget::standalone("f01234"), &options())
            .await
            .unwrap();
        match &findings[..] {
            [Finding::VarianceExceeded { breaches, .. }] => {
                assert_eq!(breaches[0].tier, Tier::Quick);
            }
            other => panic!("unexpected findings {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_penalty_checked_against_full() {
        let address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let target = MinerTarget {
            miner: "f01234".to_string(),
            agent: Some(agent(1, address, 10)),
            details: Some(miner(1, "f01234", 2000)),
            position: Some("1/1".to_string()),
        };
        let estimator = Arc::new(FakeEstimator::new(1000, 1000, 1000));
        let findings = check_miner(estimator, &target, &options()).await.unwrap();
        match &findings[..] {
            [Finding::VarianceExceeded { miner, breaches }] => {
                assert_eq!(miner, "Agent 1: Miner 1/1 f01234");
                assert_eq!(breaches.len(), 1);
                assert_eq!(breaches[0].tier, Tier::Api);
            }
            other => panic!("unexpected findings {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_distinct_finding() {
        let estimator =
            Arc::new(FakeEstimator::new(1, 1, 1).with_full_delay(Duration::from_secs(3600)));
        let findings = check_miner(estimator, &MinerTarget::standalone("f01234"), &options())
            .await
            .unwrap();
        assert!(matches!(findings[..], [Finding::EstimateTimedOut { .. }]));
    }

    #[tokio::test]
    async fn test_random_targets() {
        let address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let mut one = agent(1, address, 10);
        one.miners = 2;
        let mut two = agent(2, address, 10);
        two.miners = 1;
        let ledger = FakeLedger::new()
            .with_agent(one)
            .with_agent(two)
            .with_miners(1, vec![miner(1, "f0101", 0), miner(1, "f0102", 0)])
            .with_miners(2, vec![miner(2, "f0201", 0)]);
        let ctx = CheckContext::new(Arc::new(ledger), Arc::new(FakeChain::new(1_000)));
        let mut rng = StdRng::seed_from_u64(1);

        let targets = random_targets(&ctx, 10, &mut rng).await.unwrap();
        let mut miners: Vec<String> = targets.iter().map(|t| t.miner.clone()).collect();
        miners.sort();
        assert_eq!(miners, vec!["f0101", "f0102", "f0201"]);
        assert_eq!(random_targets(&ctx, 1, &mut rng).await.unwrap().len(), 1);
    }
}
