//! Value transition enumeration
//!
//! Once a bracket is known, list every height inside it where the
//! authoritative series changes value. Each transition is found by a
//! leftmost-change binary search, so the cost is roughly `log2(width)`
//! evaluations per transition.

use crate::error::Result;
use crate::locator::Bracket;
use crate::series::HeightSeries;
use num_bigint::BigInt;
use tracing::{debug, info};

/// A height at which the series takes a new value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub height: u64,
    pub value: BigInt,
}

/// Smallest `h` in `[min, max]` with `series(h) != prev`.
///
/// Assumes the series does not return to `prev` inside the range. If it
/// does, a change may be missed or a later one reported.
pub async fn find_next_transition(
    series: &dyn HeightSeries,
    min: u64,
    prev: &BigInt,
    max: u64,
) -> Result<Option<Transition>> {
    if min > max {
        return Ok(None);
    }

    let mut lo = min;
    let mut hi = max;
    let mut candidate: Option<Transition> = None;

    while lo <= hi {
        let sample = lo + (hi - lo) / 2;
        let value = series.value_at(sample).await?;
        if value == *prev {
            if sample == hi {
                break;
            }
            lo = sample + 1;
        } else {
            candidate = Some(Transition { height: sample, value });
            if sample == lo {
                break;
            }
            hi = sample - 1;
        }
    }

    if let Some(t) = &candidate {
        debug!(height = t.height, value = %t.value, "transition");
    }
    Ok(candidate)
}

/// All transitions after `(start_height, start_value)` up to and including `max`
pub async fn enumerate_transitions(
    series: &dyn HeightSeries,
    start_height: u64,
    start_value: &BigInt,
    max: u64,
) -> Result<Vec<Transition>> {
    let mut found = Vec::new();
    let mut height = start_height;
    let mut value = start_value.clone();

    while let Some(min) = height.checked_add(1) {
        match find_next_transition(series, min, &value, max).await? {
            Some(t) => {
                height = t.height;
                value = t.value.clone();
                found.push(t);
            }
            None => break,
        }
    }

    Ok(found)
}

/// Transitions strictly inside a bracket, starting from the good side's
/// authoritative value.
pub async fn explain_bracket(
    series: &dyn HeightSeries,
    bracket: &Bracket,
) -> Result<Vec<Transition>> {
    let Some(max) = bracket.bad.height.checked_sub(1) else {
        return Ok(Vec::new());
    };
    let transitions = enumerate_transitions(
        series,
        bracket.good.height,
        &bracket.good.authoritative_value,
        max,
    )
    .await?;
    info!(
        from = bracket.good.height,
        to = bracket.bad.height,
        count = transitions.len(),
        "enumerated transitions"
    );
    Ok(transitions)
}
