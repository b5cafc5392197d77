//! Invariant checks
//!
//! Each check compares what the ledger reports with what the chain says and
//! produces [`Finding`]s. Findings are data: a mismatch never aborts a run.
//! Errors abort only the entity being checked and are recorded as
//! [`Finding::Aborted`].

pub mod agent_balances;
pub mod agent_econ;
pub mod ifil_supply;
pub mod metrics;
pub mod miner_liquidation;

use crate::chain_client::ChainQuery;
use crate::epoch::EpochNormalizer;
use crate::error::Result;
use crate::ledger_client::Ledger;
use crate::locator::Bracket;
use crate::transitions::Transition;
use crate::variance::{to_fil_string, VarianceBreach};
use num_bigint::BigInt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Collaborators shared by every check
#[derive(Clone)]
pub struct CheckContext {
    pub ledger: Arc<dyn Ledger>,
    pub normalizer: EpochNormalizer,
}

impl CheckContext {
    pub fn new(ledger: Arc<dyn Ledger>, chain: Arc<dyn ChainQuery>) -> Self {
        Self {
            ledger,
            normalizer: EpochNormalizer::new(chain),
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainQuery> {
        self.normalizer.chain()
    }

    /// `height` if given, otherwise `lag` blocks behind head
    pub async fn height_or_behind_head(&self, height: Option<u64>, lag: u64) -> Result<u64> {
        match height {
            Some(h) => Ok(h),
            None => self.normalizer.height_behind_head(lag).await,
        }
    }
}

/// Something a check found wrong
#[derive(Debug, Clone)]
pub enum Finding {
    /// Ledger and chain disagree on a value
    Mismatch {
        subject: String,
        quantity: &'static str,
        /// Height compared, `None` for the latest value
        height: Option<u64>,
        ledger: BigInt,
        chain: BigInt,
    },
    /// Where a balance mismatch starts, and the chain changes leading up to it
    Divergence {
        agent_id: u64,
        bracket: Bracket,
        transitions: Vec<Transition>,
    },
    /// An estimate strayed too far from the full computation
    VarianceExceeded {
        miner: String,
        breaches: Vec<VarianceBreach>,
    },
    /// The estimates did not finish before the deadline
    EstimateTimedOut { miner: String, elapsed: Duration },
    /// The check could not be completed
    Aborted { subject: String, error: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::Mismatch {
                subject,
                quantity,
                height,
                ledger,
                chain,
            } => {
                write!(f, "❌ {}", subject)?;
                if let Some(h) = height {
                    write!(f, " @{}", h)?;
                }
                write!(
                    f,
                    ": {} from ledger doesn't match node\n  Node: {}\n   API: {}",
                    quantity, chain, ledger
                )
            }
            Finding::Divergence {
                agent_id,
                bracket,
                transitions,
            } => {
                write!(f, "❌ Agent {}: {}", agent_id, bracket)?;
                if transitions.is_empty() {
                    write!(f, "\n  no node balance changes inside the bracket")?;
                }
                for t in transitions {
                    write!(
                        f,
                        "\n  Node balance changed @{}: {} FIL ({})",
                        t.height,
                        to_fil_string(&t.value),
                        t.value
                    )?;
                }
                Ok(())
            }
            Finding::VarianceExceeded { miner, breaches } => {
                write!(f, "❌ {}: assertion failed", miner)?;
                for b in breaches {
                    write!(f, "\n  {}", b)?;
                }
                Ok(())
            }
            Finding::EstimateTimedOut { miner, elapsed } => {
                write!(f, "⏱ {}: estimates timed out after {:?}", miner, elapsed)
            }
            Finding::Aborted { subject, error } => {
                write!(f, "⚠️ {}: aborted: {}", subject, error)
            }
        }
    }
}

/// Per-run tally, decided after every entity has been checked
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub name: &'static str,
    pub checked: usize,
    pub failed: usize,
    pub findings: Vec<Finding>,
}

impl CheckReport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            checked: 0,
            failed: 0,
            findings: Vec::new(),
        }
    }

    /// Record one entity's findings; any finding fails it
    pub fn record(&mut self, findings: Vec<Finding>) {
        self.checked += 1;
        if !findings.is_empty() {
            self.failed += 1;
            self.findings.extend(findings);
        }
    }

    /// Record one entity's outcome, turning an error into a failure
    pub fn record_result(&mut self, subject: impl Into<String>, result: Result<Vec<Finding>>) {
        match result {
            Ok(findings) => self.record(findings),
            Err(e) => {
                let subject = subject.into();
                warn!(%subject, error = %e, "check aborted");
                self.record(vec![Finding::Aborted {
                    subject,
                    error: e.to_string(),
                }]);
            }
        }
    }

    pub fn passed(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(f, "✅ PASS: {}: {} checked", self.name, self.checked)
        } else {
            write!(
                f,
                "❌ FAIL: {}: {} of {} checked had errors",
                self.name, self.failed, self.checked
            )
        }
    }
}

/// Compare one ledger value with one chain value
pub(crate) fn compare(
    subject: &str,
    quantity: &'static str,
    height: Option<u64>,
    ledger: BigInt,
    chain: BigInt,
) -> Option<Finding> {
    if ledger == chain {
        tracing::info!(subject, quantity, ?height, value = %ledger, "✅ match");
        None
    } else {
        warn!(subject, quantity, ?height, %ledger, %chain, "❌ mismatch");
        Some(Finding::Mismatch {
            subject: subject.to_string(),
            quantity,
            height,
            ledger,
            chain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CheckError;

    #[test]
    fn test_report_counts_entities_not_findings() {
        let mut report = CheckReport::new("agent-balances");
        report.record(vec![]);
        report.record(vec![
            compare("Agent 1", "available balance", None, 1.into(), 2.into()).unwrap(),
            Finding::Aborted {
                subject: "Agent 1".into(),
                error: "x".into(),
            },
        ]);
        report.record_result("Agent 2", Err(CheckError::AccountNotFound(2)));
        assert_eq!(report.checked, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.findings.len(), 3);
        assert!(!report.passed());
        assert!(report.to_string().starts_with("❌ FAIL"));
    }

    #[test]
    fn test_equal_values_are_not_findings() {
        assert!(compare("pool", "total assets", Some(5), 7.into(), 7.into()).is_none());
        let report = CheckReport::new("metrics");
        assert!(report.passed());
    }
}
