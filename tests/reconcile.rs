//! Estimate reconciliation and the estimate runner end to end

use ledger_invariants::checks::miner_liquidation::{check_miner, LiquidationOptions, MinerTarget};
use ledger_invariants::checks::{CheckReport, Finding};
use ledger_invariants::estimates::{run_estimates, EstimateOutcome};
use ledger_invariants::testing::FakeEstimator;
use ledger_invariants::variance::{reconcile, Direction, EstimateTriple, Tier};
use num_bigint::BigInt;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn triple(quick: i64, sampled: i64, full: i64) -> EstimateTriple {
    EstimateTriple {
        quick: BigInt::from(quick),
        sampled: BigInt::from(sampled),
        full: BigInt::from(full),
    }
}

#[test]
fn test_quick_underestimate_within_limit() {
    let r = reconcile(&triple(1000, 1000, 1050), None, None, 5.0);
    assert_eq!(r.quick.direction(), Direction::Underestimated);
    assert!((r.quick.pct_of_reference.unwrap() - 4.76).abs() < 0.01);
    assert!(r.quick.to_string().starts_with("UNDERESTIMATED"));
    assert!(r.passed());
}

#[test]
fn test_quick_underestimate_over_limit() {
    let r = reconcile(&triple(1000, 1000, 1200), None, None, 5.0);
    assert!(!r.passed());
    assert!(r.breaches.iter().any(|b| b.tier == Tier::Quick && b.pct > 16.0));
}

proptest! {
    /// Negating every input keeps magnitudes and the verdict, and flips direction
    #[test]
    fn prop_symmetric_under_negation(
        quick in -1_000_000i64..1_000_000,
        sampled in -1_000_000i64..1_000_000,
        full in -1_000_000i64..1_000_000,
        api in -1_000_000i64..1_000_000,
        max in 0.0f64..50.0,
    ) {
        let pos = reconcile(&triple(quick, sampled, full), Some(&BigInt::from(api)), None, max);
        let neg = reconcile(&triple(-quick, -sampled, -full), Some(&BigInt::from(-api)), None, max);

        prop_assert_eq!(pos.passed(), neg.passed());
        prop_assert_eq!(pos.quick_matches_sampled, neg.quick_matches_sampled);
        for ((_, a), (_, b)) in pos.results().zip(neg.results()) {
            prop_assert_eq!(a.magnitude(), b.magnitude());
            prop_assert_eq!(a.pct_of_reference, b.pct_of_reference);
            let flipped = match a.direction() {
                Direction::Exact => Direction::Exact,
                Direction::Overestimated => Direction::Underestimated,
                Direction::Underestimated => Direction::Overestimated,
            };
            prop_assert_eq!(b.direction(), flipped);
        }
    }

    /// A comparison fails only when its percentage is defined and above the limit
    #[test]
    fn prop_fails_iff_defined_and_above(
        quick in 0i64..10_000,
        full in 0i64..10_000,
        max in 0.0f64..100.0,
    ) {
        let r = reconcile(&triple(quick, full, full), None, None, max);
        let expected_fail = r.quick.pct_of_reference.map(|p| p > max).unwrap_or(false);
        prop_assert_eq!(!r.passed(), expected_fail);
    }
}

#[tokio::test]
async fn test_full_progress_and_verdict() {
    let estimator = Arc::new(
        FakeEstimator::new(1000, 1000, 1050)
            .with_partitions(4)
            .with_miner("f09999", 1000, 1000, 1200),
    );
    let options = LiquidationOptions {
        height: 100,
        timeout: Duration::from_secs(10),
        max_pct_variance: 5.0,
        show_progress: true,
    };

    let mut report = CheckReport::new("miner liquidation");
    for miner in ["f01234", "f09999"] {
        let target = MinerTarget::standalone(miner);
        let result = check_miner(estimator.clone(), &target, &options).await;
        report.record_result(target.subject(), result);
    }
    assert_eq!(report.checked, 2);
    assert_eq!(report.failed, 1);
    assert!(matches!(
        &report.findings[..],
        [Finding::VarianceExceeded { miner, .. }] if miner == "Miner f09999"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_the_whole_run() {
    let estimator = Arc::new(
        FakeEstimator::new(1, 1, 1)
            .with_partitions(10)
            .with_full_delay(Duration::from_secs(100)),
    );
    let started = Instant::now();
    let deadline = started + Duration::from_secs(30);
    let outcome = run_estimates(estimator.clone(), "f01234", 100, deadline, &mut ())
        .await
        .unwrap();
    assert!(matches!(outcome, EstimateOutcome::TimedOut { .. }));
    assert!(started.elapsed() < Duration::from_secs(31));
    assert!(estimator.saw_cancellation());
}
