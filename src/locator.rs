//! Divergence localization
//!
//! Given an account's ledger transaction log and the authoritative series,
//! find the adjacent pair of points where the ledger is last known to agree
//! with the chain and first known to disagree. The search runs over the
//! sparse record index, so it costs `⌈log2(n)⌉` authoritative evaluations
//! plus a constant number of boundary probes.

use crate::error::Result;
use crate::ledger_client::TransactionRecord;
use crate::series::HeightSeries;
use num_bigint::BigInt;
use std::fmt;
use tracing::{debug, info};

/// Where the bracket was found relative to the real records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketOrigin {
    /// No records at all; the chain moved anyway
    EmptyLog,
    /// The first record already disagrees
    BeforeFirstRecord,
    /// Between two real records
    WithinLog,
    /// After the last record: a trailing ledger entry is missing
    AfterLastRecord,
}

/// One side of a [`Bracket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketPoint {
    /// Index into the transaction log, `None` for synthesized points
    pub index: Option<usize>,
    pub height: u64,
    /// What the ledger reports at `height`
    pub ledger_value: BigInt,
    /// What the chain reports at `height`
    pub authoritative_value: BigInt,
}

impl BracketPoint {
    pub fn is_synthetic(&self) -> bool {
        self.index.is_none()
    }
}

/// Ledger and chain agree at `good` and disagree at `bad`. Nothing is
/// claimed about the heights in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bracket {
    pub good: BracketPoint,
    pub bad: BracketPoint,
    pub origin: BracketOrigin,
    /// Authoritative evaluations spent finding it
    pub evaluations: usize,
}

impl fmt::Display for Bracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = |p: &BracketPoint| match p.index {
            Some(i) => format!("tx idx:{}", i),
            None => "synthetic".to_string(),
        };
        write!(
            f,
            "last good ({}) @{}: {} / first bad ({}) @{}: ledger {} node {}",
            label(&self.good),
            self.good.height,
            self.good.ledger_value,
            label(&self.bad),
            self.bad.height,
            self.bad.ledger_value,
            self.bad.authoritative_value
        )
    }
}

/// Counts authoritative evaluations for one locate call
struct Prober<'a> {
    series: &'a dyn HeightSeries,
    evaluations: usize,
}

impl Prober<'_> {
    async fn eval(&mut self, height: u64) -> Result<BigInt> {
        self.evaluations += 1;
        self.series.value_at(height).await
    }
}

/// Finds where a ledger log stops matching the authoritative series.
pub struct DivergenceLocator<'a> {
    authoritative: &'a dyn HeightSeries,
    /// Account creation height; the balance is zero here by definition
    creation_height: u64,
    head_height: u64,
}

impl<'a> DivergenceLocator<'a> {
    pub fn new(
        authoritative: &'a dyn HeightSeries,
        creation_height: u64,
        head_height: u64,
    ) -> Self {
        Self {
            authoritative,
            creation_height,
            head_height,
        }
    }

    /// Locate the divergence bracket, or `None` when the log is consistent
    /// with the chain at every record height and at head.
    ///
    /// Any evaluation error aborts the search and is returned unchanged.
    pub async fn locate(&self, records: &[TransactionRecord]) -> Result<Option<Bracket>> {
        let mut probe = Prober {
            series: self.authoritative,
            evaluations: 0,
        };
        let zero = BigInt::from(0);

        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => {
                let height = self.head_height.saturating_sub(2);
                let value = probe.eval(height).await?;
                debug!(height, %value, "empty log, probing near head");
                if value == zero {
                    return Ok(None);
                }
                let good = self.creation_point();
                let bad = BracketPoint {
                    index: None,
                    height,
                    ledger_value: zero,
                    authoritative_value: value,
                };
                return Ok(Some(self.finish(good, bad, BracketOrigin::EmptyLog, &probe)));
            }
        };

        let first_value = probe.eval(first.height).await?;
        debug!(
            idx = 0,
            height = first.height,
            node = %first_value,
            ledger = %first.balance_after,
            "first tx"
        );
        if first_value != first.balance_after {
            let bad = record_point(records, 0, first_value);
            let good = self.creation_point();
            return Ok(Some(self.finish(good, bad, BracketOrigin::BeforeFirstRecord, &probe)));
        }

        let last_idx = records.len() - 1;
        let last_value = if last_idx == 0 {
            first_value.clone()
        } else {
            probe.eval(last.height).await?
        };
        debug!(
            idx = last_idx,
            height = last.height,
            node = %last_value,
            ledger = %last.balance_after,
            "last tx"
        );

        if last_value == last.balance_after {
            // Every recorded point may still be right; only the live value can disagree
            let height = self.head_height.saturating_sub(1).max(last.height);
            let value = if height == last.height {
                last_value.clone()
            } else {
                probe.eval(height).await?
            };
            if value == last.balance_after {
                debug!(height, "log consistent through head");
                return Ok(None);
            }
            let good = record_point(records, last_idx, last_value);
            let bad = BracketPoint {
                index: None,
                height,
                ledger_value: last.balance_after.clone(),
                authoritative_value: value,
            };
            return Ok(Some(self.finish(good, bad, BracketOrigin::AfterLastRecord, &probe)));
        }

        let (mut good_idx, mut good_value) = (0usize, first_value);
        let (mut bad_idx, mut bad_value) = (last_idx, last_value);
        while bad_idx - good_idx > 1 {
            let mid = good_idx + (bad_idx - good_idx) / 2;
            let record = &records[mid];
            let value = probe.eval(record.height).await?;
            if value == record.balance_after {
                debug!(idx = mid, height = record.height, %value, "matches");
                good_idx = mid;
                good_value = value;
            } else {
                debug!(
                    idx = mid,
                    height = record.height,
                    node = %value,
                    ledger = %record.balance_after,
                    "mismatch"
                );
                bad_idx = mid;
                bad_value = value;
            }
        }

        let good = record_point(records, good_idx, good_value);
        let bad = record_point(records, bad_idx, bad_value);
        Ok(Some(self.finish(good, bad, BracketOrigin::WithinLog, &probe)))
    }

    fn creation_point(&self) -> BracketPoint {
        BracketPoint {
            index: None,
            height: self.creation_height,
            ledger_value: BigInt::from(0),
            authoritative_value: BigInt::from(0),
        }
    }

    fn finish(
        &self,
        good: BracketPoint,
        bad: BracketPoint,
        origin: BracketOrigin,
        probe: &Prober<'_>,
    ) -> Bracket {
        let bracket = Bracket {
            good,
            bad,
            origin,
            evaluations: probe.evaluations,
        };
        info!(?origin, evaluations = bracket.evaluations, "divergence bracket: {}", bracket);
        bracket
    }
}

fn record_point(
    records: &[TransactionRecord],
    index: usize,
    authoritative_value: BigInt,
) -> BracketPoint {
    BracketPoint {
        index: Some(index),
        height: records[index].height,
        ledger_value: records[index].balance_after.clone(),
        authoritative_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StepSeries;

    fn log(points: &[(u64, i64)]) -> Vec<TransactionRecord> {
        points.iter().map(|(h, b)| TransactionRecord::new(*h, *b)).collect()
    }

    #[tokio::test]
    async fn test_adjacent_records() {
        // ledger: 0 @100, 50 @200; chain: 75 from 160
        let records = log(&[(100, 0), (200, 50)]);
        let chain = StepSeries::new(&[(0, 0), (160, 75)]);
        let bracket = DivergenceLocator::new(&chain, 90, 1_000)
            .locate(&records)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bracket.origin, BracketOrigin::WithinLog);
        assert_eq!((bracket.good.height, bracket.bad.height), (100, 200));
        assert_eq!(bracket.good.index, Some(0));
        assert_eq!(bracket.bad.index, Some(1));
        assert_eq!(bracket.bad.ledger_value, BigInt::from(50));
        assert_eq!(bracket.bad.authoritative_value, BigInt::from(75));
        assert_eq!(bracket.evaluations, 2);
    }

    #[tokio::test]
    async fn test_consistent_log_has_no_bracket() {
        let records = log(&[(100, 10), (200, 20), (300, 30)]);
        let chain = StepSeries::new(&[(100, 10), (200, 20), (300, 30)]);
        let found = DivergenceLocator::new(&chain, 50, 1_000).locate(&records).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_first_record_wrong() {
        let records = log(&[(100, 10), (200, 20)]);
        let chain = StepSeries::new(&[(100, 11), (200, 21)]);
        let bracket = DivergenceLocator::new(&chain, 42, 1_000)
            .locate(&records)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bracket.origin, BracketOrigin::BeforeFirstRecord);
        assert!(bracket.good.is_synthetic());
        assert_eq!(bracket.good.height, 42);
        assert_eq!(bracket.bad.index, Some(0));
        assert_eq!(bracket.evaluations, 1);
    }

    #[tokio::test]
    async fn test_missing_trailing_record() {
        let records = log(&[(100, 10), (200, 20)]);
        let chain = StepSeries::new(&[(100, 10), (200, 20), (500, 7)]);
        let bracket = DivergenceLocator::new(&chain, 42, 1_000)
            .locate(&records)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bracket.origin, BracketOrigin::AfterLastRecord);
        assert_eq!(bracket.good.index, Some(1));
        assert_eq!(bracket.bad.height, 999);
        assert_eq!(bracket.bad.ledger_value, BigInt::from(20));
        assert_eq!(bracket.bad.authoritative_value, BigInt::from(7));
    }

    #[tokio::test]
    async fn test_single_matching_record_checks_head() {
        let records = log(&[(100, 10)]);
        let chain = StepSeries::new(&[(100, 10)]);
        let found = DivergenceLocator::new(&chain, 42, 1_000).locate(&records).await.unwrap();
        assert!(found.is_none());
        // first and last are the same record: one probe for it, one for head
        assert_eq!(chain.evaluations(), 2);
    }

    #[tokio::test]
    async fn test_empty_log() {
        let chain = StepSeries::new(&[(0, 0), (300, 5)]);
        let bracket = DivergenceLocator::new(&chain, 42, 1_000)
            .locate(&[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bracket.origin, BracketOrigin::EmptyLog);
        assert_eq!((bracket.good.height, bracket.bad.height), (42, 998));

        let quiet = StepSeries::new(&[(0, 0)]);
        assert!(DivergenceLocator::new(&quiet, 42, 1_000).locate(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evaluation_error_aborts() {
        let records = log(&[(100, 10), (200, 20), (300, 30), (400, 40)]);
        let chain = StepSeries::new(&[(0, 0)]).failing_at(100);
        assert!(DivergenceLocator::new(&chain, 42, 1_000).locate(&records).await.is_err());
    }
}
