//! Estimate reconciliation
//!
//! Compares the quick, sampled and ledger-reported termination penalties
//! against the full computation, which is the reference.

use num_bigint::{BigInt, Sign};
use num_traits::{Signed, ToPrimitive, Zero};
use std::fmt;

/// Termination penalty computed three ways for the same miner and height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimateTriple {
    pub quick: BigInt,
    pub sampled: BigInt,
    pub full: BigInt,
}

/// Which side of the reference an estimate landed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Exact,
    /// Estimate is above the full value
    Overestimated,
    /// Estimate is below the full value
    Underestimated,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Exact => write!(f, "EXACT"),
            Direction::Overestimated => write!(f, "OVERESTIMATED"),
            Direction::Underestimated => write!(f, "UNDERESTIMATED"),
        }
    }
}

/// Difference between one estimate and the reference
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceResult {
    /// `reference - estimate`
    pub absolute_diff: BigInt,
    /// `|diff| / |reference| * 100`; `None` when the reference is zero
    pub pct_of_reference: Option<f64>,
    /// `|diff| / secondary * 100` when a positive secondary was supplied
    pub pct_of_secondary: Option<f64>,
}

impl VarianceResult {
    pub fn compute(reference: &BigInt, estimate: &BigInt, secondary: Option<&BigInt>) -> Self {
        let absolute_diff = reference - estimate;
        let magnitude = absolute_diff.abs();
        let pct_of_reference = percent(&magnitude, &reference.abs());
        let pct_of_secondary = secondary
            .filter(|s| s.is_positive())
            .and_then(|s| percent(&magnitude, s));
        Self {
            absolute_diff,
            pct_of_reference,
            pct_of_secondary,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.absolute_diff.sign() {
            Sign::NoSign => Direction::Exact,
            Sign::Minus => Direction::Overestimated,
            Sign::Plus => Direction::Underestimated,
        }
    }

    pub fn magnitude(&self) -> BigInt {
        self.absolute_diff.abs()
    }
}

impl fmt::Display for VarianceResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} FIL", self.direction(), to_fil_string(&self.magnitude()))?;
        match self.pct_of_reference {
            Some(pct) => write!(f, " ({:.3}%)", pct)?,
            None => write!(f, " (n/a)")?,
        }
        if let Some(pct) = self.pct_of_secondary {
            write!(f, " ({:.3}% of principal)", pct)?;
        }
        Ok(())
    }
}

/// Which estimate is being compared with the full computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Quick,
    Sampled,
    /// The value the ledger API reports
    Api,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Quick => write!(f, "quick"),
            Tier::Sampled => write!(f, "sampled"),
            Tier::Api => write!(f, "api"),
        }
    }
}

/// An estimate whose variance exceeded the limit
#[derive(Debug, Clone, PartialEq)]
pub struct VarianceBreach {
    pub tier: Tier,
    pub pct: f64,
    pub max_pct: f64,
}

impl fmt::Display for VarianceBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} variance {:.3}% exceeds max {:.3}%",
            self.tier, self.pct, self.max_pct
        )
    }
}

/// Outcome of reconciling one miner's estimates
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub quick: VarianceResult,
    pub sampled: VarianceResult,
    pub api: Option<VarianceResult>,
    /// Informational only; never a failure by itself
    pub quick_matches_sampled: bool,
    pub breaches: Vec<VarianceBreach>,
}

impl Reconciliation {
    pub fn passed(&self) -> bool {
        self.breaches.is_empty()
    }

    pub fn results(&self) -> impl Iterator<Item = (Tier, &VarianceResult)> {
        [
            (Tier::Quick, Some(&self.quick)),
            (Tier::Sampled, Some(&self.sampled)),
            (Tier::Api, self.api.as_ref()),
        ]
        .into_iter()
        .filter_map(|(tier, r)| r.map(|r| (tier, r)))
    }
}

/// Compare every estimate with `triple.full`.
///
/// `secondary` is the account's principal, used for an extra relative
/// figure. A comparison fails only when its reference percentage is defined
/// and strictly greater than `max_pct`.
pub fn reconcile(
    triple: &EstimateTriple,
    api_reported: Option<&BigInt>,
    secondary: Option<&BigInt>,
    max_pct: f64,
) -> Reconciliation {
    let quick = VarianceResult::compute(&triple.full, &triple.quick, secondary);
    let sampled = VarianceResult::compute(&triple.full, &triple.sampled, secondary);
    let api = api_reported
        .map(|reported| VarianceResult::compute(&triple.full, reported, secondary));

    let mut reconciliation = Reconciliation {
        quick,
        sampled,
        api,
        quick_matches_sampled: triple.quick == triple.sampled,
        breaches: Vec::new(),
    };

    let breaches: Vec<VarianceBreach> = reconciliation
        .results()
        .filter_map(|(tier, r)| {
            r.pct_of_reference
                .filter(|pct| *pct > max_pct)
                .map(|pct| VarianceBreach { tier, pct, max_pct })
        })
        .collect();
    reconciliation.breaches = breaches;
    reconciliation
}

fn percent(numerator: &BigInt, denominator: &BigInt) -> Option<f64> {
    if denominator.is_zero() {
        return None;
    }
    let n = numerator.to_f64()?;
    let d = denominator.to_f64()?;
    Some(n * 100.0 / d)
}

/// Format an attoFIL amount as FIL with three decimals, without going through f64
pub fn to_fil_string(atto: &BigInt) -> String {
    let unit = BigInt::from(10u64.pow(18));
    let milli = BigInt::from(10u64.pow(15));
    let magnitude = atto.abs();
    let whole = &magnitude / &unit;
    let frac = (&magnitude % &unit) / &milli;
    let sign = if atto.is_negative() { "-" } else { "" };
    format!("{}{}.{:03}", sign, whole, frac.to_u64().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(quick: i64, sampled: i64, full: i64) -> EstimateTriple {
        EstimateTriple {
            quick: quick.into(),
            sampled: sampled.into(),
            full: full.into(),
        }
    }

    #[test]
    fn test_within_limit() {
        let r = reconcile(&triple(1000, 1000, 1050), None, None, 5.0);
        assert!(r.passed());
        assert!(r.quick_matches_sampled);
        let pct = r.quick.pct_of_reference.unwrap();
        assert!((pct - 4.7619).abs() < 1e-3);
        assert_eq!(r.quick.direction(), Direction::Underestimated);
    }

    #[test]
    fn test_breach_names_tier() {
        let r = reconcile(&triple(1000, 1000, 1200), None, None, 5.0);
        assert!(!r.passed());
        let tiers: Vec<Tier> = r.breaches.iter().map(|b| b.tier).collect();
        assert_eq!(tiers, vec![Tier::Quick, Tier::Sampled]);
    }

    #[test]
    fn test_zero_reference_is_undefined_not_failure() {
        let r = reconcile(&triple(10, 0, 0), None, None, 5.0);
        assert_eq!(r.quick.pct_of_reference, None);
        assert!(r.passed());
        assert!(!r.quick_matches_sampled);
    }

    #[test]
    fn test_api_compared_to_full() {
        let r = reconcile(&triple(100, 100, 100), Some(&BigInt::from(120)), None, 5.0);
        let api = r.api.as_ref().unwrap();
        assert_eq!(api.direction(), Direction::Overestimated);
        assert_eq!(api.absolute_diff, BigInt::from(-20));
        assert_eq!(r.breaches.len(), 1);
        assert_eq!(r.breaches[0].tier, Tier::Api);
    }

    #[test]
    fn test_exactly_at_limit_passes() {
        let r = reconcile(&triple(95, 100, 100), None, None, 5.0);
        assert_eq!(r.quick.pct_of_reference, Some(5.0));
        assert!(r.passed());
    }

    #[test]
    fn test_secondary_percentage() {
        let r = reconcile(&triple(90, 100, 100), None, Some(&BigInt::from(1000)), 50.0);
        assert_eq!(r.quick.pct_of_secondary, Some(1.0));
        let none = reconcile(&triple(90, 100, 100), None, Some(&BigInt::from(0)), 50.0);
        assert_eq!(none.quick.pct_of_secondary, None);
    }

    #[test]
    fn test_fil_formatting() {
        assert_eq!(to_fil_string(&BigInt::from(1_500_000_000_000_000_000u64)), "1.500");
        assert_eq!(to_fil_string(&BigInt::from(-2_000_000_000_000_000i64)), "-0.002");
        assert_eq!(to_fil_string(&BigInt::from(0)), "0.000");
    }
}
