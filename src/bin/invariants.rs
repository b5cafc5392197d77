//! invariants CLI
//!
//! Checks the ledger service against values recomputed from chain state.
//! Exits non-zero when any checked entity fails or cannot be checked.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use ledger_invariants::chain_client::RpcChainClient;
use ledger_invariants::checks::miner_liquidation::{self, LiquidationOptions, MinerTarget};
use ledger_invariants::checks::{
    agent_balances, agent_econ, ifil_supply, metrics, CheckContext, CheckReport,
};
use ledger_invariants::config::Config;
use ledger_invariants::estimates::PenaltyEstimator;
use ledger_invariants::estimator_client::RpcEstimatorClient;
use ledger_invariants::ledger_client::LedgerClient;
use ledger_invariants::selection::{select_agents, Selection};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "invariants")]
#[command(about = "Compare the ledger service with values recomputed from chain state")]
struct Cli {
    /// Env file with endpoints and contract addresses
    #[arg(long, global = true, env = "INVARIANTS_CONFIG", default_value = "mainnet.env")]
    config: PathBuf,
    /// Use the archive Lotus node instead of the private one
    #[arg(long, global = true)]
    archive: bool,
    /// Only print failures and the summary
    #[arg(long, short, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AgentArgs {
    /// Agent id
    agent_id: Option<u64>,
    /// Check all agents
    #[arg(long)]
    all: bool,
    /// Randomly select this many agents
    #[arg(long)]
    random: Option<usize>,
    /// Check at height
    #[arg(long)]
    epoch: Option<u64>,
}

impl AgentArgs {
    fn selection(&self) -> Result<Selection> {
        Ok(Selection::from_flags(self.agent_id, self.all, self.random)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compare an agent's available balance from the ledger and the node
    AgentBalances(AgentArgs),
    /// Compare an agent's liability from the ledger and the node
    AgentEcon(AgentArgs),
    /// Compare pool metrics from the ledger and the node at a height
    Metrics {
        /// Check at height (default: head - 2)
        #[arg(long)]
        epoch: Option<u64>,
    },
    /// Compare iFIL total supply from the ledger and the node
    IfilTotalSupply {
        /// Check at height (default: head - 2)
        #[arg(long)]
        epoch: Option<u64>,
        /// On mismatch, search backward for the highest passing height
        #[arg(long)]
        find_missing: bool,
    },
    /// Compare termination penalties computed with different methods
    MinerLiquidation {
        /// Miner address, e.g. f01234
        miner: Option<String>,
        /// Check all miners of one agent
        #[arg(long)]
        agent: Option<u64>,
        /// Check all miners of every agent
        #[arg(long)]
        all_agents: bool,
        /// Randomly select this many miners
        #[arg(long)]
        random: Option<usize>,
        /// Check at height (default: head - 3)
        #[arg(long)]
        epoch: Option<u64>,
        /// Give up on a miner's estimates after this long
        #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
        timeout: Duration,
        /// Acceptable percentage difference from the full method
        #[arg(long, default_value_t = 5.0)]
        max_pct_variance: f64,
        /// Log full-method partition progress
        #[arg(long, default_value_t = true, action = ArgAction::Set)]
        progress: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A local .env may supply INVARIANTS_CONFIG and other flag defaults
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    load_env_file(&cli.config)?;
    let config = Config::from_env(cli.archive).context("Failed to load configuration")?;
    tracing::info!(
        chain_id = config.chain_id,
        events_api = %config.events_api,
        "configuration loaded"
    );

    let ledger = Arc::new(
        LedgerClient::new(config.events_api.clone(), config.chain.timeout)
            .context("Failed to create ledger client")?,
    );
    let chain = Arc::new(
        RpcChainClient::new(config.chain.clone(), config.contracts.clone())
            .context("Failed to create chain client")?,
    );
    let ctx = CheckContext::new(ledger, chain);
    let mut rng = StdRng::from_entropy();

    let report = match cli.command {
        Commands::AgentBalances(args) => {
            let agents = select_agents(ctx.ledger.as_ref(), args.selection()?, &mut rng).await?;
            let mut report = CheckReport::new("agent balances");
            for agent in &agents {
                let result = agent_balances::check_agent(&ctx, agent, args.epoch).await;
                report.record_result(format!("Agent {}", agent.id), result);
            }
            report
        }
        Commands::AgentEcon(args) => {
            let agents = select_agents(ctx.ledger.as_ref(), args.selection()?, &mut rng).await?;
            let height = ctx.height_or_behind_head(args.epoch, agent_econ::DEFAULT_LAG).await?;
            let mut report = CheckReport::new("agent econ");
            for agent in &agents {
                let result = agent_econ::check_agent(&ctx, agent, height).await;
                report.record_result(format!("Agent {}", agent.id), result);
            }
            report
        }
        Commands::Metrics { epoch } => {
            let height = ctx.height_or_behind_head(epoch, metrics::DEFAULT_LAG).await?;
            let mut report = CheckReport::new("metrics");
            let result = metrics::check_at(&ctx, height).await;
            report.record_result(format!("Pool @{}", height), result);
            report
        }
        Commands::IfilTotalSupply { epoch, find_missing } => {
            let height = ctx.height_or_behind_head(epoch, ifil_supply::DEFAULT_LAG).await?;
            let mut report = CheckReport::new("iFIL total supply");
            let result = ifil_supply::check_at(&ctx, height).await;
            report.record_result(format!("iFIL @{}", height), result);
            if find_missing && !report.passed() {
                println!("Searching for missing iFIL events");
                match ifil_supply::find_highest_passing(&ctx, height).await? {
                    Some(good) => println!("Highest passing epoch: {}", good),
                    None => println!("No passing epochs found"),
                }
            }
            report
        }
        Commands::MinerLiquidation {
            miner,
            agent,
            all_agents,
            random,
            epoch,
            timeout,
            max_pct_variance,
            progress,
        } => {
            let estimator: Arc<dyn PenaltyEstimator> = Arc::new(
                RpcEstimatorClient::new(config.estimator.clone())
                    .context("Failed to create estimator client")?,
            );
            let options = LiquidationOptions {
                height: ctx.height_or_behind_head(epoch, miner_liquidation::DEFAULT_LAG).await?,
                timeout,
                max_pct_variance,
                show_progress: progress,
            };

            let mut report = CheckReport::new("miner liquidation");
            let targets = match (miner, agent, all_agents, random) {
                (Some(miner), None, false, None) => vec![MinerTarget::standalone(miner)],
                (None, Some(id), false, None) => {
                    let agent = ctx.ledger.agent(id).await?;
                    miner_liquidation::targets_for_agent(&ctx, &agent).await?
                }
                (None, None, true, None) => {
                    let mut targets = Vec::new();
                    for agent in ctx.ledger.agents().await? {
                        match miner_liquidation::targets_for_agent(&ctx, &agent).await {
                            Ok(found) => targets.extend(found),
                            Err(e) => report.record_result(format!("Agent {}", agent.id), Err(e)),
                        }
                    }
                    targets
                }
                (None, None, false, Some(n)) if n > 0 => {
                    miner_liquidation::random_targets(&ctx, n, &mut rng).await?
                }
                _ => anyhow::bail!(
                    "give exactly one of a miner, --agent, --all-agents or --random N"
                ),
            };

            for target in &targets {
                let result =
                    miner_liquidation::check_miner(estimator.clone(), target, &options).await;
                report.record_result(target.subject(), result);
            }
            report
        }
    };

    for finding in &report.findings {
        println!("{}", finding);
    }
    println!("{}", report);

    if !report.passed() {
        anyhow::bail!("{} had errors", report.name);
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

/// Load `path` into the process environment; a missing default file is not an error
fn load_env_file(path: &Path) -> Result<()> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "env file not found, using process environment");
        return Ok(());
    }
    dotenvy::from_path(path).with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(())
}
