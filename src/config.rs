//! Process configuration
//!
//! Settings come from environment variables, optionally seeded from an env
//! file (`mainnet.env`, `calibnet.env`, ...) that the binary loads with
//! `dotenvy` before clap parses. Every key may also be given with the
//! `INVARIANTS_` prefix, which takes precedence.

use crate::chain_client::EthAddress;
use crate::error::{CheckError, Result};
use std::time::Duration;

/// Prefix accepted in front of every key.
pub const ENV_PREFIX: &str = "INVARIANTS_";

const DEFAULT_RPC_TIMEOUT_SECS: u64 = 120;

/// Connection settings for a JSON-RPC or REST endpoint
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Endpoint URL (e.g., "https://api.node.glif.io/rpc/v1")
    pub url: String,
    /// Bearer token, if the endpoint requires one
    pub token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

impl RpcConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS),
        }
    }
}

/// Protocol contract addresses read through `eth_call`
#[derive(Debug, Clone)]
pub struct ContractAddresses {
    pub pool: EthAddress,
    pub router: EthAddress,
    pub agent_factory: EthAddress,
    pub ifil: EthAddress,
    /// Pool id passed to `getAccount(agentId, poolId)`
    pub pool_id: u64,
}

/// Full configuration for a run
#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    /// Ledger service base URL
    pub events_api: String,
    /// Lotus node (archive or private, depending on `--archive`)
    pub chain: RpcConfig,
    /// Termination penalty estimator endpoint
    pub estimator: RpcConfig,
    pub contracts: ContractAddresses,
}

impl Config {
    /// Build from the process environment.
    pub fn from_env(use_archive: bool) -> Result<Self> {
        Self::from_lookup(use_archive, |key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(use_archive: bool, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<String> {
            lookup(&format!("{}{}", ENV_PREFIX, key.to_uppercase()))
                .or_else(|| lookup(&key.to_uppercase()))
                .filter(|v| !v.trim().is_empty())
        };
        let require = |key: &str| -> Result<String> {
            get(key).ok_or_else(|| CheckError::Config(format!("{} is not set", key.to_uppercase())))
        };
        let address = |key: &str| -> Result<EthAddress> {
            require(key)?.parse().map_err(|e: CheckError| {
                CheckError::Config(format!("{}: {}", key.to_uppercase(), e))
            })
        };
        let number = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(v) => v.trim().parse().map_err(|_| {
                    CheckError::Config(format!("{} is not a number: {}", key.to_uppercase(), v))
                }),
                None => Ok(default),
            }
        };

        let timeout = Duration::from_secs(number("rpc_timeout_secs", DEFAULT_RPC_TIMEOUT_SECS)?);

        let (addr_key, token_key) = if use_archive {
            ("lotus_archive_addr", "lotus_archive_token")
        } else {
            ("lotus_private_addr", "lotus_private_token")
        };
        let chain = RpcConfig {
            url: require(addr_key)?,
            token: get(token_key),
            timeout,
        };

        // The estimator runs next to the node unless configured separately
        let estimator = match get("estimator_url") {
            Some(url) => RpcConfig {
                url,
                token: get("estimator_token"),
                timeout,
            },
            None => chain.clone(),
        };

        Ok(Self {
            chain_id: number("chain_id", 314)?,
            events_api: require("events_api")?.trim_end_matches('/').to_string(),
            chain,
            estimator,
            contracts: ContractAddresses {
                pool: address("pool_address")?,
                router: address("router_address")?,
                agent_factory: address("agent_factory_address")?,
                ifil: address("ifil_address")?,
                pool_id: number("pool_id", 0)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("EVENTS_API".into(), "https://events.example/".into());
        env.insert("LOTUS_PRIVATE_ADDR".into(), "http://private:1234/rpc/v1".into());
        env.insert("LOTUS_ARCHIVE_ADDR".into(), "http://archive:1234/rpc/v1".into());
        env.insert("LOTUS_ARCHIVE_TOKEN".into(), "secret".into());
        for key in ["POOL_ADDRESS", "ROUTER_ADDRESS", "AGENT_FACTORY_ADDRESS", "IFIL_ADDRESS"] {
            env.insert(key.into(), format!("0x{}", "11".repeat(20)));
        }
        env
    }

    #[test]
    fn test_archive_selects_archive_endpoint() {
        let env = base();
        let config = Config::from_lookup(true, |k| env.get(k).cloned()).unwrap();
        assert_eq!(config.chain.url, "http://archive:1234/rpc/v1");
        assert_eq!(config.chain.token.as_deref(), Some("secret"));
        assert_eq!(config.events_api, "https://events.example");
        assert_eq!(config.chain_id, 314);
        // no ESTIMATOR_URL: falls back to the node
        assert_eq!(config.estimator.url, config.chain.url);
    }

    #[test]
    fn test_prefixed_key_wins() {
        let mut env = base();
        env.insert("INVARIANTS_CHAIN_ID".into(), "314159".into());
        env.insert("CHAIN_ID".into(), "314".into());
        let config = Config::from_lookup(false, |k| env.get(k).cloned()).unwrap();
        assert_eq!(config.chain_id, 314159);
        assert_eq!(config.chain.url, "http://private:1234/rpc/v1");
        assert!(config.chain.token.is_none());
    }

    #[test]
    fn test_missing_events_api() {
        let mut env = base();
        env.remove("EVENTS_API");
        let err = Config::from_lookup(false, |k| env.get(k).cloned()).unwrap_err();
        assert!(matches!(err, CheckError::Config(ref m) if m.contains("EVENTS_API")));
    }

    #[test]
    fn test_bad_contract_address() {
        let mut env = base();
        env.insert("POOL_ADDRESS".into(), "0x1234".into());
        assert!(Config::from_lookup(false, |k| env.get(k).cloned()).is_err());
    }
}
