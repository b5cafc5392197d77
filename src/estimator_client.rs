//! Penalty estimator client
//!
//! JSON-RPC adapter for the termination penalty estimator service. Quick and
//! sampled estimates are single calls. The full computation is driven from
//! here one partition at a time so it can report progress and stop early.

use crate::chain_client::JsonRpcClient;
use crate::config::RpcConfig;
use crate::error::{CheckError, Result};
use crate::estimates::{Cancellation, PartitionProgress, PenaltyEstimator, TerminationEstimate};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Sectors per batch when sampling
const SAMPLE_BATCH_SIZE: u64 = 40;
/// Gas ceiling for each simulated termination message
const SAMPLE_GAS_LIMIT: u64 = 270_000_000_000;
/// Partitions the sampled estimate may visit
const SAMPLE_MAX_PARTITIONS: u64 = 21;

pub struct RpcEstimatorClient {
    rpc: JsonRpcClient,
}

impl RpcEstimatorClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new("estimator", config)?,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.rpc.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| CheckError::decode(format!("{} result", method), e))
    }

    /// Run `call` unless `cancel` fires first
    async fn call_cancellable<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        cancel: &mut Cancellation,
    ) -> Result<T> {
        tokio::select! {
            result = self.call(method, params) => result,
            _ = cancel.cancelled() => Err(CheckError::Cancelled),
        }
    }
}

fn tipset_ref(height: u64) -> String {
    format!("@{}", height)
}

#[async_trait]
impl PenaltyEstimator for RpcEstimatorClient {
    async fn quick(&self, miner: &str, height: u64) -> Result<TerminationEstimate> {
        self.call(
            "Estimator.TerminateQuick",
            serde_json::json!([miner, tipset_ref(height)]),
        )
        .await
    }

    async fn sampled(
        &self,
        miner: &str,
        height: u64,
        mut cancel: Cancellation,
    ) -> Result<TerminationEstimate> {
        let params = serde_json::json!([{
            "miner": miner,
            "tipset": tipset_ref(height),
            "batchSize": SAMPLE_BATCH_SIZE,
            "gasLimit": SAMPLE_GAS_LIMIT,
            "useSampling": true,
            "optimize": true,
            "maxPartitions": SAMPLE_MAX_PARTITIONS,
        }]);
        self.call_cancellable("Estimator.TerminateSampled", params, &mut cancel)
            .await
    }

    async fn full(
        &self,
        miner: &str,
        height: u64,
        progress: mpsc::Sender<PartitionProgress>,
        mut cancel: Cancellation,
    ) -> Result<TerminationEstimate> {
        let tipset = tipset_ref(height);
        let count: usize = self
            .call_cancellable(
                "Estimator.DeadlinePartitionCount",
                serde_json::json!([miner, tipset]),
                &mut cancel,
            )
            .await?;
        debug!(miner, count, "full estimate partitions");

        let mut total = TerminationEstimate::new(0);
        for index in 0..count {
            cancel.check()?;
            let part: TerminationEstimate = self
                .call_cancellable(
                    "Estimator.TerminatePartition",
                    serde_json::json!([miner, tipset, index]),
                    &mut cancel,
                )
                .await?;
            total.termination_penalty += part.termination_penalty;
            total.sectors_terminated += part.sectors_terminated;
            total.sectors_count += part.sectors_count;
            // a dropped receiver only means nobody is watching
            let _ = progress.send(PartitionProgress { index, count }).await;
        }
        Ok(total)
    }
}
