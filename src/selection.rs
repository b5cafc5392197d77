//! Which agents a check runs over

use crate::error::{CheckError, Result};
use crate::ledger_client::{Agent, Ledger};
use rand::seq::SliceRandom;
use rand::Rng;

/// Agents selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    One(u64),
    All,
    /// Up to this many, in random order
    Random(usize),
}

impl Selection {
    /// Exactly one of an id, `--all` or `--random N` must be given
    pub fn from_flags(id: Option<u64>, all: bool, random: Option<usize>) -> Result<Self> {
        match (id, all, random) {
            (Some(id), false, None) => Ok(Selection::One(id)),
            (None, true, None) => Ok(Selection::All),
            (None, false, Some(n)) if n > 0 => Ok(Selection::Random(n)),
            _ => Err(CheckError::Config(
                "give exactly one of an agent id, --all or --random N (N > 0)".to_string(),
            )),
        }
    }
}

pub async fn select_agents<R: Rng + ?Sized>(
    ledger: &dyn Ledger,
    selection: Selection,
    rng: &mut R,
) -> Result<Vec<Agent>> {
    match selection {
        Selection::One(id) => Ok(vec![ledger.agent(id).await?]),
        Selection::All => ledger.agents().await,
        Selection::Random(n) => Ok(pick_random(ledger.agents().await?, n, rng)),
    }
}

/// Shuffle and keep at most `n`
pub fn pick_random<T, R: Rng + ?Sized>(mut items: Vec<T>, n: usize, rng: &mut R) -> Vec<T> {
    items.shuffle(rng);
    items.truncate(n);
    items
}
