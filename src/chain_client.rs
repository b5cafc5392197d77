//! Chain query client
//!
//! This module wraps a Lotus node's JSON-RPC interface: tipset lookups go
//! through the `Filecoin.*` namespace, protocol contract reads go through
//! `eth_call` at an explicit block number.

use crate::config::{ContractAddresses, RpcConfig};
use crate::error::{CheckError, Result};
use async_trait::async_trait;
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use reqwest::Client;
use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// 20-byte EVM address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddress(pub [u8; 20]);

impl FromStr for EthAddress {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| CheckError::InvalidAddress(format!("{}: {}", s, e)))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| CheckError::InvalidAddress(format!("{}: expected 20 bytes", s)))?;
        Ok(EthAddress(array))
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Authoritative chain queries used by the checks.
///
/// Every read takes an explicit block number; callers are responsible for
/// normalizing heights first (see [`crate::epoch::EpochNormalizer`]).
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Height of the current chain head
    async fn head_height(&self) -> Result<u64>;

    /// Height of the first produced tipset at or after `height`
    async fn tipset_after_height(&self, height: u64) -> Result<u64>;

    async fn agent_liquid_assets(&self, agent: &EthAddress, block: u64) -> Result<BigInt>;

    async fn agent_principal(&self, agent_id: u64, block: u64) -> Result<BigInt>;

    async fn ifil_total_supply(&self, block: u64) -> Result<BigInt>;

    async fn pool_total_assets(&self, block: u64) -> Result<BigInt>;

    async fn pool_total_borrowed(&self, block: u64) -> Result<BigInt>;

    async fn agent_count(&self, block: u64) -> Result<u64>;
}

/// Minimal JSON-RPC 2.0 client shared by the chain and estimator adapters
pub struct JsonRpcClient {
    client: Client,
    config: RpcConfig,
    service: &'static str,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Create a new client for `service` (used in error messages)
    pub fn new(service: &'static str, config: RpcConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CheckError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            service,
            next_id: AtomicU64::new(1),
        })
    }

    /// Make an RPC call and return its `result` member
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id
        });

        let mut request = self.client.post(&self.config.url).json(&body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CheckError::transport(self.service, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckError::HttpStatus {
                service: self.service,
                status: status.as_u16(),
            });
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| CheckError::decode(format!("{} response", method), e))?;

        if let Some(error) = json.get("error") {
            if !error.is_null() {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| error.to_string());
                return Err(CheckError::Rpc {
                    method: method.to_string(),
                    message,
                });
            }
        }

        json.get("result")
            .cloned()
            .ok_or_else(|| CheckError::decode(format!("{} response", method), "missing result"))
    }
}

/// Lotus-backed [`ChainQuery`]
pub struct RpcChainClient {
    rpc: JsonRpcClient,
    contracts: ContractAddresses,
}

impl RpcChainClient {
    pub fn new(config: RpcConfig, contracts: ContractAddresses) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new("chain", config)?,
            contracts,
        })
    }

    /// `eth_call` at `block` and return the raw return data
    async fn eth_call(&self, to: &EthAddress, data: Vec<u8>, block: u64) -> Result<Vec<u8>> {
        let params = serde_json::json!([
            { "to": to.to_string(), "data": format!("0x{}", hex::encode(&data)) },
            format!("0x{:x}", block)
        ]);
        debug!(to = %to, block, "eth_call");
        let result = self.rpc.call("eth_call", params).await?;
        let encoded = result
            .as_str()
            .ok_or_else(|| CheckError::decode("eth_call result", "not a string"))?;
        hex::decode(encoded.trim_start_matches("0x"))
            .map_err(|e| CheckError::decode("eth_call result", e))
    }

    async fn call_uint(
        &self,
        to: &EthAddress,
        data: Vec<u8>,
        block: u64,
        word: usize,
    ) -> Result<BigInt> {
        let output = self.eth_call(to, data, block).await?;
        decode_uint_word(&output, word)
    }
}

#[async_trait]
impl ChainQuery for RpcChainClient {
    async fn head_height(&self) -> Result<u64> {
        let head = self.rpc.call("Filecoin.ChainHead", serde_json::json!([])).await?;
        tipset_height(&head)
    }

    async fn tipset_after_height(&self, height: u64) -> Result<u64> {
        let params = serde_json::json!([height, Value::Null]);
        let tipset = self.rpc.call("Filecoin.ChainGetTipSetAfterHeight", params).await?;
        tipset_height(&tipset)
    }

    async fn agent_liquid_assets(&self, agent: &EthAddress, block: u64) -> Result<BigInt> {
        self.call_uint(agent, encode_call("liquidAssets()", &[]), block, 0)
            .await
    }

    async fn agent_principal(&self, agent_id: u64, block: u64) -> Result<BigInt> {
        // Account { startEpoch, principal, epochsPaid, defaulted }
        let data = encode_call("getAccount(uint256,uint256)", &[agent_id, self.contracts.pool_id]);
        self.call_uint(&self.contracts.router, data, block, 1).await
    }

    async fn ifil_total_supply(&self, block: u64) -> Result<BigInt> {
        self.call_uint(&self.contracts.ifil, encode_call("totalSupply()", &[]), block, 0)
            .await
    }

    async fn pool_total_assets(&self, block: u64) -> Result<BigInt> {
        self.call_uint(&self.contracts.pool, encode_call("totalAssets()", &[]), block, 0)
            .await
    }

    async fn pool_total_borrowed(&self, block: u64) -> Result<BigInt> {
        self.call_uint(&self.contracts.pool, encode_call("totalBorrowed()", &[]), block, 0)
            .await
    }

    async fn agent_count(&self, block: u64) -> Result<u64> {
        let count = self
            .call_uint(&self.contracts.agent_factory, encode_call("agentCount()", &[]), block, 0)
            .await?;
        count
            .to_u64()
            .ok_or_else(|| CheckError::decode("agentCount()", format!("{} overflows u64", count)))
    }
}

/// First four bytes of `keccak256(signature)`
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// ABI-encode a call whose arguments are all `uint256`
pub fn encode_call(signature: &str, args: &[u64]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(&[0u8; 24]);
        data.extend_from_slice(&arg.to_be_bytes());
    }
    data
}

/// Decode the `index`-th 32-byte word of ABI return data as an unsigned integer
pub fn decode_uint_word(output: &[u8], index: usize) -> Result<BigInt> {
    let start = index * 32;
    let word = output.get(start..start + 32).ok_or_else(|| {
        CheckError::decode(
            "eth_call result",
            format!("{} bytes, need word {}", output.len(), index),
        )
    })?;
    Ok(BigInt::from_bytes_be(Sign::Plus, word))
}

fn tipset_height(tipset: &Value) -> Result<u64> {
    tipset
        .get("Height")
        .and_then(|h| h.as_u64().or_else(|| h.as_i64().map(|i| i as u64)))
        .ok_or_else(|| CheckError::decode("tipset", "missing Height"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        // ERC-20 totalSupply() and ERC-4626 totalAssets()
        assert_eq!(selector("totalSupply()"), [0x18, 0x16, 0x0d, 0xdd]);
        assert_eq!(selector("totalAssets()"), [0x01, 0xe1, 0xd1, 0x14]);
    }

    #[test]
    fn test_encode_uint_args() {
        let data = encode_call("getAccount(uint256,uint256)", &[7, 0]);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(data[4 + 31], 7);
        assert!(data[4 + 32..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_second_word() {
        let mut output = vec![0u8; 96];
        output[63] = 0x2a;
        assert_eq!(decode_uint_word(&output, 1).unwrap(), BigInt::from(42));
        assert!(decode_uint_word(&output, 3).is_err());
    }

    #[test]
    fn test_address_roundtrip() {
        let text = "0x00000000000000000000000000000000000000ff";
        let addr: EthAddress = text.parse().unwrap();
        assert_eq!(addr.0[19], 0xff);
        assert_eq!(addr.to_string(), text);
        assert!("0xabc".parse::<EthAddress>().is_err());
        assert!("not-hex".parse::<EthAddress>().is_err());
    }

    #[test]
    fn test_tipset_height() {
        let tipset = serde_json::json!({ "Cids": [], "Height": 4200000 });
        assert_eq!(tipset_height(&tipset).unwrap(), 4_200_000);
        assert!(tipset_height(&serde_json::json!({})).is_err());
    }
}
