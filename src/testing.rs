//! In-memory collaborators for tests
//!
//! Each fake implements one of the service traits over step functions, so a
//! check can be driven end to end without a network.

use crate::chain_client::{ChainQuery, EthAddress};
use crate::error::{CheckError, Result};
use crate::estimates::{Cancellation, PartitionProgress, PenaltyEstimator, TerminationEstimate};
use crate::ledger_client::{
    Agent, AgentEcon, AvailableBalanceSnapshot, Ledger, MinerDetails, ProtocolMetrics, TokenSupply,
    TransactionRecord,
};
use crate::series::HeightSeries;
use async_trait::async_trait;
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Piecewise-constant function of height: each point sets the value from
/// its height onward. Zero before the first point.
#[derive(Debug, Clone, Default)]
pub struct Steps(BTreeMap<u64, BigInt>);

impl Steps {
    pub fn new(points: &[(u64, i64)]) -> Self {
        Steps(points.iter().map(|(h, v)| (*h, BigInt::from(*v))).collect())
    }

    pub fn at(&self, height: u64) -> BigInt {
        self.0
            .range(..=height)
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| BigInt::from(0))
    }
}

/// A bare [`HeightSeries`] over [`Steps`] that counts evaluations
pub struct StepSeries {
    steps: Steps,
    failing: BTreeSet<u64>,
    evaluations: AtomicUsize,
}

impl StepSeries {
    pub fn new(points: &[(u64, i64)]) -> Self {
        Self {
            steps: Steps::new(points),
            failing: BTreeSet::new(),
            evaluations: AtomicUsize::new(0),
        }
    }

    /// Evaluating exactly `height` returns a transport error
    pub fn failing_at(mut self, height: u64) -> Self {
        self.failing.insert(height);
        self
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeightSeries for StepSeries {
    async fn value_at(&self, height: u64) -> Result<BigInt> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&height) {
            return Err(CheckError::transport("chain", format!("injected failure at {}", height)));
        }
        Ok(self.steps.at(height))
    }
}

/// Chain with a fixed head, optional null rounds and step-function state
pub struct FakeChain {
    head: u64,
    null_rounds: BTreeSet<u64>,
    liquid_assets: HashMap<EthAddress, Steps>,
    principals: HashMap<u64, Steps>,
    supply: Steps,
    pool_assets: Steps,
    pool_borrowed: Steps,
    agent_count: Steps,
    evaluations: AtomicUsize,
}

impl FakeChain {
    pub fn new(head: u64) -> Self {
        Self {
            head,
            null_rounds: BTreeSet::new(),
            liquid_assets: HashMap::new(),
            principals: HashMap::new(),
            supply: Steps::default(),
            pool_assets: Steps::default(),
            pool_borrowed: Steps::default(),
            agent_count: Steps::default(),
            evaluations: AtomicUsize::new(0),
        }
    }

    pub fn with_null_rounds(mut self, heights: impl IntoIterator<Item = u64>) -> Self {
        self.null_rounds.extend(heights);
        self
    }

    pub fn with_liquid_assets(mut self, agent: EthAddress, points: &[(u64, i64)]) -> Self {
        self.liquid_assets.insert(agent, Steps::new(points));
        self
    }

    pub fn with_principal(mut self, agent_id: u64, points: &[(u64, i64)]) -> Self {
        self.principals.insert(agent_id, Steps::new(points));
        self
    }

    pub fn with_supply(mut self, points: &[(u64, i64)]) -> Self {
        self.supply = Steps::new(points);
        self
    }

    pub fn with_pool(mut self, assets: &[(u64, i64)], borrowed: &[(u64, i64)]) -> Self {
        self.pool_assets = Steps::new(assets);
        self.pool_borrowed = Steps::new(borrowed);
        self
    }

    pub fn with_agent_count(mut self, points: &[(u64, i64)]) -> Self {
        self.agent_count = Steps::new(points);
        self
    }

    /// Number of state reads (tipset lookups excluded)
    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    fn read(&self, steps: Option<&Steps>, block: u64) -> Result<BigInt> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        if block > self.head {
            return Err(CheckError::Rpc {
                method: "eth_call".to_string(),
                message: format!("block {} is beyond head {}", block, self.head),
            });
        }
        Ok(steps.map(|s| s.at(block)).unwrap_or_else(|| BigInt::from(0)))
    }
}

#[async_trait]
impl ChainQuery for FakeChain {
    async fn head_height(&self) -> Result<u64> {
        Ok(self.head)
    }

    async fn tipset_after_height(&self, height: u64) -> Result<u64> {
        (height..=self.head)
            .find(|h| !self.null_rounds.contains(h))
            .ok_or_else(|| CheckError::Rpc {
                method: "Filecoin.ChainGetTipSetAfterHeight".to_string(),
                message: format!(
                    "looking for tipset with height greater than head ({})",
                    self.head
                ),
            })
    }

    async fn agent_liquid_assets(&self, agent: &EthAddress, block: u64) -> Result<BigInt> {
        self.read(self.liquid_assets.get(agent), block)
    }

    async fn agent_principal(&self, agent_id: u64, block: u64) -> Result<BigInt> {
        self.read(self.principals.get(&agent_id), block)
    }

    async fn ifil_total_supply(&self, block: u64) -> Result<BigInt> {
        self.read(Some(&self.supply), block)
    }

    async fn pool_total_assets(&self, block: u64) -> Result<BigInt> {
        self.read(Some(&self.pool_assets), block)
    }

    async fn pool_total_borrowed(&self, block: u64) -> Result<BigInt> {
        self.read(Some(&self.pool_borrowed), block)
    }

    async fn agent_count(&self, block: u64) -> Result<u64> {
        let count = self.read(Some(&self.agent_count), block)?;
        u64::try_from(count).map_err(|e| CheckError::decode("agentCount()", e))
    }
}

/// Agent summary with just the fields the checks read
pub fn agent(id: u64, address: EthAddress, created: u64) -> Agent {
    Agent {
        id,
        address: format!("f0{}", 1000 + id),
        address_native: address.to_string(),
        height: created,
        available_balance: BigInt::from(0),
        balance: BigInt::from(0),
        miners: 0,
        principal_balance: BigInt::from(0),
        tx_hash: String::new(),
    }
}

/// Miner entry as the ledger lists it
pub fn miner(agent_id: u64, miner_addr: &str, termination_penalty: i64) -> MinerDetails {
    MinerDetails {
        miner: miner_addr.trim_start_matches(['f', 't', '0']).parse().unwrap_or(0),
        agent_id,
        miner_addr: miner_addr.to_string(),
        available_balance: BigInt::from(0),
        equity: BigInt::from(0),
        termination_penalty: BigInt::from(termination_penalty),
        liquidation_value: BigInt::from(0),
    }
}

/// Ledger service backed by maps and step functions
#[derive(Default)]
pub struct FakeLedger {
    agents: Vec<Agent>,
    snapshots: HashMap<u64, (BigInt, BigInt)>,
    transactions: HashMap<u64, Vec<TransactionRecord>>,
    liabilities: HashMap<u64, BigInt>,
    miners: HashMap<u64, Vec<MinerDetails>>,
    pool_assets: Steps,
    pool_borrowed: Steps,
    agent_count: Steps,
    supply: Steps,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_snapshot(mut self, agent_id: u64, stored: i64, recomputed: i64) -> Self {
        self.snapshots
            .insert(agent_id, (BigInt::from(stored), BigInt::from(recomputed)));
        self
    }

    pub fn with_transactions(mut self, agent_id: u64, points: &[(u64, i64)]) -> Self {
        let records = points.iter().map(|(h, b)| TransactionRecord::new(*h, *b)).collect();
        self.transactions.insert(agent_id, records);
        self
    }

    pub fn with_liability(mut self, agent_id: u64, liability: i64) -> Self {
        self.liabilities.insert(agent_id, BigInt::from(liability));
        self
    }

    pub fn with_miners(mut self, agent_id: u64, miners: Vec<MinerDetails>) -> Self {
        self.miners.insert(agent_id, miners);
        self
    }

    pub fn with_metrics(
        mut self,
        assets: &[(u64, i64)],
        borrowed: &[(u64, i64)],
        agents: &[(u64, i64)],
    ) -> Self {
        self.pool_assets = Steps::new(assets);
        self.pool_borrowed = Steps::new(borrowed);
        self.agent_count = Steps::new(agents);
        self
    }

    pub fn with_supply(mut self, points: &[(u64, i64)]) -> Self {
        self.supply = Steps::new(points);
        self
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.clone())
    }

    async fn available_balance(&self, agent_id: u64) -> Result<AvailableBalanceSnapshot> {
        let (stored, recomputed) = self
            .snapshots
            .get(&agent_id)
            .cloned()
            .ok_or(CheckError::HttpStatus {
                service: "ledger",
                status: 404,
            })?;
        Ok(AvailableBalanceSnapshot { stored, recomputed })
    }

    async fn transactions(&self, agent_id: u64) -> Result<Vec<TransactionRecord>> {
        Ok(self.transactions.get(&agent_id).cloned().unwrap_or_default())
    }

    async fn econ(&self, agent_id: u64) -> Result<AgentEcon> {
        let liability = self
            .liabilities
            .get(&agent_id)
            .cloned()
            .ok_or(CheckError::AccountNotFound(agent_id))?;
        Ok(AgentEcon {
            id: agent_id,
            assets: BigInt::from(0),
            liability,
            equity: BigInt::from(0),
            borrow_max: BigInt::from(0),
            dte: 0.0,
        })
    }

    async fn miners(&self, agent_id: u64) -> Result<Vec<MinerDetails>> {
        Ok(self.miners.get(&agent_id).cloned().unwrap_or_default())
    }

    async fn metrics_at(&self, height: u64) -> Result<ProtocolMetrics> {
        let agents = self.agent_count.at(height);
        Ok(ProtocolMetrics {
            height,
            timestamp: 0,
            pool_total_assets: self.pool_assets.at(height),
            pool_total_borrowed: self.pool_borrowed.at(height),
            total_agent_count: u64::try_from(agents)
                .map_err(|e| CheckError::decode("totalAgentCount", e))?,
            total_miners_count: 0,
        })
    }

    async fn ifil_total_supply(&self, height: u64) -> Result<TokenSupply> {
        Ok(TokenSupply {
            height,
            total_supply: self.supply.at(height),
        })
    }
}

/// Estimator returning fixed penalties, with optional slowness and failures
pub struct FakeEstimator {
    quick: BigInt,
    sampled: BigInt,
    full: BigInt,
    per_miner: HashMap<String, (BigInt, BigInt, BigInt)>,
    partitions: usize,
    full_delay: Duration,
    sampled_error: Option<String>,
    last_cancel: Mutex<Option<Cancellation>>,
}

impl FakeEstimator {
    pub fn new(quick: i64, sampled: i64, full: i64) -> Self {
        Self {
            quick: quick.into(),
            sampled: sampled.into(),
            full: full.into(),
            per_miner: HashMap::new(),
            partitions: 1,
            full_delay: Duration::ZERO,
            sampled_error: None,
            last_cancel: Mutex::new(None),
        }
    }

    pub fn with_miner(mut self, miner: &str, quick: i64, sampled: i64, full: i64) -> Self {
        self.per_miner
            .insert(miner.to_string(), (quick.into(), sampled.into(), full.into()));
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Total time the full computation takes, spread over its partitions
    pub fn with_full_delay(mut self, delay: Duration) -> Self {
        self.full_delay = delay;
        self
    }

    pub fn failing_sampled(mut self, message: &str) -> Self {
        self.sampled_error = Some(message.to_string());
        self
    }

    /// Whether the last cancellation handed to a background estimate fired
    pub fn saw_cancellation(&self) -> bool {
        self.last_cancel
            .lock()
            .map(|c| c.as_ref().map(|c| c.is_cancelled()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn values(&self, miner: &str) -> (BigInt, BigInt, BigInt) {
        self.per_miner
            .get(miner)
            .cloned()
            .unwrap_or_else(|| (self.quick.clone(), self.sampled.clone(), self.full.clone()))
    }

    fn remember(&self, cancel: &Cancellation) {
        if let Ok(mut slot) = self.last_cancel.lock() {
            *slot = Some(cancel.clone());
        }
    }
}

#[async_trait]
impl PenaltyEstimator for FakeEstimator {
    async fn quick(&self, miner: &str, _height: u64) -> Result<TerminationEstimate> {
        Ok(TerminationEstimate::new(self.values(miner).0))
    }

    async fn sampled(
        &self,
        miner: &str,
        _height: u64,
        cancel: Cancellation,
    ) -> Result<TerminationEstimate> {
        self.remember(&cancel);
        if let Some(message) = &self.sampled_error {
            return Err(CheckError::Rpc {
                method: "sampled".to_string(),
                message: message.clone(),
            });
        }
        Ok(TerminationEstimate::new(self.values(miner).1))
    }

    async fn full(
        &self,
        miner: &str,
        _height: u64,
        progress: mpsc::Sender<PartitionProgress>,
        mut cancel: Cancellation,
    ) -> Result<TerminationEstimate> {
        self.remember(&cancel);
        let step = self.full_delay / self.partitions as u32;
        for index in 0..self.partitions {
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = cancel.cancelled() => return Err(CheckError::Cancelled),
            }
            let _ = progress
                .send(PartitionProgress {
                    index,
                    count: self.partitions,
                })
                .await;
        }
        Ok(TerminationEstimate::new(self.values(miner).2))
    }
}
