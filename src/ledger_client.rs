//! Ledger service client
//!
//! Read-only wrapper around the events REST API. Token amounts are encoded
//! as base-10 strings and decoded into [`BigInt`].

use crate::error::{CheckError, Result};
use async_trait::async_trait;
use num_bigint::BigInt;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;

/// Decimal-string big integers. Empty strings decode to zero.
pub mod decimal {
    use super::*;

    pub fn parse(s: &str) -> std::result::Result<BigInt, String> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(BigInt::from(0));
        }
        trimmed
            .parse::<BigInt>()
            .map_err(|e| format!("invalid integer {:?}: {}", s, e))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<BigInt, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim().is_empty() {
            return Ok(0.0);
        }
        s.trim().parse().map_err(serde::de::Error::custom)
    }
}

/// Account ("agent") summary as reported by the ledger
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: u64,
    /// Filecoin-form address
    #[serde(default)]
    pub address: String,
    /// 0x address of the agent contract
    pub address_native: String,
    /// Creation height
    pub height: u64,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub available_balance: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub balance: BigInt,
    #[serde(default)]
    pub miners: u64,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub principal_balance: BigInt,
    #[serde(default)]
    pub tx_hash: String,
}

/// Latest available balance: stored by the ledger vs. recomputed by the ledger from the node
#[derive(Debug, Clone, Deserialize)]
pub struct AvailableBalanceSnapshot {
    #[serde(rename = "availableBalanceDB", deserialize_with = "decimal::deserialize")]
    pub stored: BigInt,
    #[serde(rename = "availableBalanceNd", deserialize_with = "decimal::deserialize")]
    pub recomputed: BigInt,
}

/// One entry of an account's transaction log.
///
/// `balance_after` is the available balance the ledger reports from this
/// height until the next record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub height: u64,
    #[serde(rename = "availableBalance", deserialize_with = "decimal::deserialize")]
    pub balance_after: BigInt,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub amount: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub principal: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub interest: BigInt,
    #[serde(default)]
    pub timestamp: u64,
}

impl TransactionRecord {
    /// Bare record with only a height and the balance after it
    pub fn new(height: u64, balance_after: impl Into<BigInt>) -> Self {
        Self {
            height,
            balance_after: balance_after.into(),
            id: 0,
            tx_hash: String::new(),
            kind: String::new(),
            amount: BigInt::from(0),
            principal: BigInt::from(0),
            interest: BigInt::from(0),
            timestamp: 0,
        }
    }
}

/// Ledger-reported balance at `height` from a height-ascending log.
///
/// Piecewise constant: the balance after the last record at or below
/// `height`, zero before the first record.
pub fn balance_at(records: &[TransactionRecord], height: u64) -> BigInt {
    let idx = records.partition_point(|r| r.height <= height);
    if idx == 0 {
        BigInt::from(0)
    } else {
        records[idx - 1].balance_after.clone()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEcon {
    pub id: u64,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub assets: BigInt,
    #[serde(deserialize_with = "decimal::deserialize")]
    pub liability: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub equity: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub borrow_max: BigInt,
    /// Debt-to-equity ratio
    #[serde(deserialize_with = "decimal::deserialize_f64", default)]
    pub dte: f64,
}

/// Storage provider owned by an agent
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinerDetails {
    pub miner: u64,
    pub agent_id: u64,
    /// Filecoin address, e.g. `f01234`
    pub miner_addr: String,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub available_balance: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub equity: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub termination_penalty: BigInt,
    #[serde(deserialize_with = "decimal::deserialize", default)]
    pub liquidation_value: BigInt,
}

/// Protocol-wide metrics at a height
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMetrics {
    pub height: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(deserialize_with = "decimal::deserialize")]
    pub pool_total_assets: BigInt,
    #[serde(deserialize_with = "decimal::deserialize")]
    pub pool_total_borrowed: BigInt,
    pub total_agent_count: u64,
    #[serde(default)]
    pub total_miners_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSupply {
    pub height: u64,
    #[serde(rename = "iFILTotalSupply", deserialize_with = "decimal::deserialize")]
    pub total_supply: BigInt,
}

/// Read-only view of the ledger service.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn agents(&self) -> Result<Vec<Agent>>;

    async fn agent(&self, agent_id: u64) -> Result<Agent> {
        self.agents()
            .await?
            .into_iter()
            .find(|a| a.id == agent_id)
            .ok_or(CheckError::AccountNotFound(agent_id))
    }

    async fn available_balance(&self, agent_id: u64) -> Result<AvailableBalanceSnapshot>;

    /// Transaction log, ascending by height
    async fn transactions(&self, agent_id: u64) -> Result<Vec<TransactionRecord>>;

    async fn econ(&self, agent_id: u64) -> Result<AgentEcon>;

    async fn miners(&self, agent_id: u64) -> Result<Vec<MinerDetails>>;

    async fn metrics_at(&self, height: u64) -> Result<ProtocolMetrics>;

    async fn ifil_total_supply(&self, height: u64) -> Result<TokenSupply>;
}

/// HTTP implementation of [`Ledger`]
pub struct LedgerClient {
    client: Client,
    base_url: String,
}

impl LedgerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "ledger request");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| CheckError::transport("ledger", e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(CheckError::HttpStatus {
                service: "ledger",
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CheckError::transport("ledger", e))?;
        serde_json::from_slice(&body).map_err(|e| CheckError::decode(path, e))
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn agents(&self) -> Result<Vec<Agent>> {
        self.get("/agent").await
    }

    async fn available_balance(&self, agent_id: u64) -> Result<AvailableBalanceSnapshot> {
        self.get(&format!("/agent/{}/available-balance", agent_id)).await
    }

    async fn transactions(&self, agent_id: u64) -> Result<Vec<TransactionRecord>> {
        let mut records: Vec<TransactionRecord> =
            self.get(&format!("/agent/{}/tx", agent_id)).await?;
        // The API returns ascending order; keep the invariant even if it doesn't
        records.sort_by_key(|r| r.height);
        Ok(records)
    }

    async fn econ(&self, agent_id: u64) -> Result<AgentEcon> {
        self.get(&format!("/agent/{}/econ", agent_id)).await
    }

    async fn miners(&self, agent_id: u64) -> Result<Vec<MinerDetails>> {
        self.get(&format!("/agent/{}/miners", agent_id)).await
    }

    async fn metrics_at(&self, height: u64) -> Result<ProtocolMetrics> {
        self.get(&format!("/metrics/{}", height)).await
    }

    async fn ifil_total_supply(&self, height: u64) -> Result<TokenSupply> {
        self.get(&format!("/ifil/{}/total-supply", height)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_parse() {
        assert_eq!(decimal::parse("").unwrap(), BigInt::from(0));
        assert_eq!(
            decimal::parse("1000000000000000000000000").unwrap().to_string(),
            "1000000000000000000000000"
        );
        assert!(decimal::parse("12abc").is_err());
    }

    #[test]
    fn test_agent_json() {
        let json = r#"[{
            "address": "f410fabc",
            "addressNative": "0x00000000000000000000000000000000000000aa",
            "availableBalance": "5000000000000000000",
            "balance": "6000000000000000000",
            "height": 3100000,
            "id": 12,
            "miners": 2,
            "principalBalance": "",
            "txHash": "0xdead"
        }]"#;
        let agents: Vec<Agent> = serde_json::from_str(json).unwrap();
        assert_eq!(agents[0].id, 12);
        assert_eq!(agents[0].miners, 2);
        assert_eq!(agents[0].principal_balance, BigInt::from(0));
        assert_eq!(agents[0].available_balance.to_string(), "5000000000000000000");
    }

    #[test]
    fn test_malformed_amount_is_rejected() {
        let json = r#"{"availableBalanceDB": "1.5", "availableBalanceNd": "2"}"#;
        assert!(serde_json::from_str::<AvailableBalanceSnapshot>(json).is_err());
    }

    #[test]
    fn test_transaction_json() {
        let json = r#"{
            "amount": "10", "availableBalance": "40", "balance": "50",
            "height": 200, "id": 3, "interest": "1", "principal": "9",
            "timestamp": 1700000000, "txHash": "0xbeef", "type": "borrow"
        }"#;
        let tx: TransactionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(tx.height, 200);
        assert_eq!(tx.balance_after, BigInt::from(40));
        assert_eq!(tx.kind, "borrow");
    }

    #[test]
    fn test_balance_at_is_piecewise_constant() {
        let records = vec![
            TransactionRecord::new(100, 10),
            TransactionRecord::new(200, 25),
            TransactionRecord::new(300, 5),
        ];
        assert_eq!(balance_at(&records, 99), BigInt::from(0));
        assert_eq!(balance_at(&records, 100), BigInt::from(10));
        assert_eq!(balance_at(&records, 199), BigInt::from(10));
        assert_eq!(balance_at(&records, 250), BigInt::from(25));
        assert_eq!(balance_at(&records, 10_000), BigInt::from(5));
        assert_eq!(balance_at(&[], 10), BigInt::from(0));
    }
}
