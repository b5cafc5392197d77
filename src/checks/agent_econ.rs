//! Agent liability check: the ledger's reported liability against the
//! agent's principal owed on chain.

use super::{compare, CheckContext, Finding};
use crate::error::Result;
use crate::ledger_client::Agent;

/// Blocks behind head used when no height is given
pub const DEFAULT_LAG: u64 = 3;

pub async fn check_agent(ctx: &CheckContext, agent: &Agent, height: u64) -> Result<Vec<Finding>> {
    let econ = ctx.ledger.econ(agent.id).await?;
    let block = ctx.normalizer.normalize(height).await?;
    let principal = ctx.chain().agent_principal(agent.id, block).await?;
    let subject = format!("Agent {}", agent.id);
    Ok(compare(&subject, "liability", Some(height), econ.liability, principal)
        .into_iter()
        .collect())
}
