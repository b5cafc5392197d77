//! Termination penalty estimates under a deadline
//!
//! The quick estimate runs inline. The sampled and full computations run as
//! background tasks and report back over channels; the full computation
//! also streams per-partition progress. A single wall-clock deadline covers
//! the whole run, and on expiry both background tasks are cancelled.

use crate::error::{CheckError, Result};
use crate::ledger_client::decimal;
use crate::variance::EstimateTriple;
use async_trait::async_trait;
use num_bigint::BigInt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Penalty for terminating a miner's sectors at a height
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationEstimate {
    #[serde(deserialize_with = "decimal::deserialize")]
    pub termination_penalty: BigInt,
    #[serde(default)]
    pub sectors_terminated: u64,
    #[serde(default)]
    pub sectors_count: u64,
}

impl TerminationEstimate {
    pub fn new(termination_penalty: impl Into<BigInt>) -> Self {
        Self {
            termination_penalty: termination_penalty.into(),
            sectors_terminated: 0,
            sectors_count: 0,
        }
    }
}

/// One partition of the full computation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionProgress {
    /// Zero-based index of the partition just finished
    pub index: usize,
    pub count: usize,
}

/// Cooperative cancellation signal handed to background estimates
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling: never resolves
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CheckError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Owner side of a [`Cancellation`]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Linked cancel handle and signal
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Computes termination penalties three ways.
#[async_trait]
pub trait PenaltyEstimator: Send + Sync {
    /// Cheap approximation; runs inline
    async fn quick(&self, miner: &str, height: u64) -> Result<TerminationEstimate>;

    /// Statistical estimate from a sample of sectors
    async fn sampled(
        &self,
        miner: &str,
        height: u64,
        cancel: Cancellation,
    ) -> Result<TerminationEstimate>;

    /// Exact value, computed partition by partition. Sends one progress
    /// message per finished partition.
    async fn full(
        &self,
        miner: &str,
        height: u64,
        progress: mpsc::Sender<PartitionProgress>,
        cancel: Cancellation,
    ) -> Result<TerminationEstimate>;
}

/// Receives full-computation progress while estimates run
pub trait ProgressSink {
    fn on_progress(&mut self, _progress: &PartitionProgress) {}
}

impl ProgressSink for () {}

/// Logs progress at most every `every` partitions
pub struct LogProgress {
    label: String,
    every: usize,
}

impl LogProgress {
    pub fn new(label: impl Into<String>, every: usize) -> Self {
        Self {
            label: label.into(),
            every: every.max(1),
        }
    }
}

impl ProgressSink for LogProgress {
    fn on_progress(&mut self, p: &PartitionProgress) {
        let done = p.index + 1;
        if done % self.every == 0 || done == p.count {
            info!(miner = %self.label, done, count = p.count, "full estimate progress");
        }
    }
}

/// A finished estimate and how long it took
#[derive(Debug, Clone)]
pub struct TimedEstimate {
    pub estimate: TerminationEstimate,
    pub elapsed: Duration,
}

/// All three tiers completed within the deadline
#[derive(Debug, Clone)]
pub struct EstimateSet {
    pub quick: TimedEstimate,
    pub sampled: TimedEstimate,
    pub full: TimedEstimate,
}

impl EstimateSet {
    pub fn triple(&self) -> EstimateTriple {
        EstimateTriple {
            quick: self.quick.estimate.termination_penalty.clone(),
            sampled: self.sampled.estimate.termination_penalty.clone(),
            full: self.full.estimate.termination_penalty.clone(),
        }
    }
}

/// Result of [`run_estimates`]. A timeout is an outcome, not an error.
#[derive(Debug, Clone)]
pub enum EstimateOutcome {
    Completed(EstimateSet),
    TimedOut {
        elapsed: Duration,
        /// Whatever finished before the deadline, for diagnostics only
        quick: Option<TimedEstimate>,
        sampled: Option<TimedEstimate>,
    },
}

/// Run all three estimates for `miner` at `height`, giving up at `deadline`.
///
/// Errors from any tier are returned as errors; the other background task is
/// cancelled first. On timeout both background tasks are cancelled and
/// [`EstimateOutcome::TimedOut`] is returned.
pub async fn run_estimates(
    estimator: Arc<dyn PenaltyEstimator>,
    miner: &str,
    height: u64,
    deadline: Instant,
    progress: &mut (dyn ProgressSink + Send),
) -> Result<EstimateOutcome> {
    let start = Instant::now();

    let quick = match tokio::time::timeout_at(deadline, estimator.quick(miner, height)).await {
        Ok(result) => TimedEstimate {
            estimate: result?,
            elapsed: start.elapsed(),
        },
        Err(_) => {
            warn!(miner, "quick estimate timed out");
            return Ok(EstimateOutcome::TimedOut {
                elapsed: start.elapsed(),
                quick: None,
                sampled: None,
            });
        }
    };
    debug!(miner, penalty = %quick.estimate.termination_penalty, "quick estimate done");

    let (cancel_handle, cancel) = cancellation();
    let (sampled_tx, mut sampled_rx) = mpsc::channel(1);
    let (full_tx, mut full_rx) = mpsc::channel(1);
    let (progress_tx, mut progress_rx) = mpsc::channel(64);

    let sampled_task = {
        let estimator = estimator.clone();
        let miner = miner.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let begun = Instant::now();
            let result = estimator.sampled(&miner, height, cancel).await;
            let _ = sampled_tx.send((result, begun.elapsed())).await;
        })
    };

    let full_task = {
        let estimator = estimator.clone();
        let miner = miner.to_string();
        tokio::spawn(async move {
            let begun = Instant::now();
            let result = estimator.full(&miner, height, progress_tx, cancel).await;
            let _ = full_tx.send((result, begun.elapsed())).await;
        })
    };

    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut sampled: Option<TimedEstimate> = None;
    let mut full: Option<TimedEstimate> = None;
    let mut progress_open = true;

    let outcome = loop {
        // drain progress before reporting so the sink sees every partition
        if let (Some(s), Some(f), false) = (&sampled, &full, progress_open) {
            break Ok(EstimateOutcome::Completed(EstimateSet {
                quick: quick.clone(),
                sampled: s.clone(),
                full: f.clone(),
            }));
        }

        tokio::select! {
            _ = &mut sleep => {
                warn!(miner, elapsed = ?start.elapsed(), "estimates timed out");
                break Ok(EstimateOutcome::TimedOut {
                    elapsed: start.elapsed(),
                    quick: Some(quick.clone()),
                    sampled: sampled.clone(),
                });
            }
            msg = sampled_rx.recv(), if sampled.is_none() => match msg {
                Some((Ok(estimate), elapsed)) => {
                    debug!(
                        miner,
                        penalty = %estimate.termination_penalty,
                        ?elapsed,
                        "sampled estimate done"
                    );
                    sampled = Some(TimedEstimate { estimate, elapsed });
                }
                Some((Err(e), _)) => break Err(e),
                None => break Err(CheckError::TaskEnded("sampled")),
            },
            msg = full_rx.recv(), if full.is_none() => match msg {
                Some((Ok(estimate), elapsed)) => {
                    debug!(
                        miner,
                        penalty = %estimate.termination_penalty,
                        ?elapsed,
                        "full estimate done"
                    );
                    full = Some(TimedEstimate { estimate, elapsed });
                }
                Some((Err(e), _)) => break Err(e),
                None => break Err(CheckError::TaskEnded("full")),
            },
            p = progress_rx.recv(), if progress_open => match p {
                Some(p) => progress.on_progress(&p),
                None => progress_open = false,
            },
        }
    };

    cancel_handle.cancel();
    sampled_task.abort();
    full_task.abort();
    outcome
}
