use std::path::PathBuf;

use alloy::primitives::utils::parse_ether;
use alloy::primitives::Address;
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use custody_sweeper::blockchain::{BlockchainClient, TokenType};
use custody_sweeper::config::{load_config, SweeperConfig};
use custody_sweeper::incidents::{IncidentManager, IncidentStatus};
use custody_sweeper::ledger::{DepositStatus, GasRequest, Ledger};
use custody_sweeper::lifecycle::{Components, Secrets};
use custody_sweeper::sweep::gas_report;

#[derive(Parser)]
#[command(name = "custody-cli")]
#[command(about = "Operator CLI for the custody sweeper", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config/sweeper.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show (and create on first use) a user's deposit address
    DepositAddress { user_id: String },
    /// Live balance of an address
    Balance {
        address: Address,
        /// `native` or a token contract address
        #[arg(short, long, default_value = "native")]
        token: TokenType,
    },
    /// Native gas health of every user wallet
    GasReport,
    /// Queue a gas top-up from the master wallet; the running daemon sends it
    TopUp {
        address: Address,
        #[arg(short, long)]
        operator: String,
        /// Target balance in ether units; defaults to the configured minimum
        #[arg(short, long)]
        min: Option<String>,
    },
    /// List incidents
    Incidents {
        /// PENDING, IN_PROGRESS, RESOLVED, IGNORED or ESCALATED
        #[arg(short, long)]
        status: Option<IncidentStatus>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Close an incident
    Resolve {
        id: Uuid,
        #[arg(short, long)]
        operator: String,
        #[arg(short, long)]
        note: Option<String>,
        /// Mark as ignored instead of resolved
        #[arg(long)]
        ignore: bool,
    },
    /// Recent deposits
    Deposits {
        /// pending, confirmed, failed or reverted
        #[arg(short, long)]
        status: Option<DepositStatus>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Recent sweeps
    Sweeps {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Recent gas top-ups
    GasLog {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Queued operator top-ups and their outcome
    TopUpRequests {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Deposits and sweeps recorded for a user
    History { user_id: String },
    /// Ledger totals
    Summary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::DepositAddress { user_id } => {
            let components = connect(config).await?;
            let address = components.service().get_deposit_address(&user_id)?;
            print_json(&json!({ "user_id": user_id, "address": address }))?;
        }
        Commands::Balance { address, token } => {
            let components = connect(config).await?;
            let balance = components.service().get_onchain_balance(address, token).await?;
            print_json(&json!({
                "address": address,
                "token": token.to_string(),
                "balance": balance.to_string(),
            }))?;
        }
        Commands::GasReport => {
            let client = BlockchainClient::new(config.blockchain.clone())
                .await
                .context("connecting to the chain")?;
            let wallets = open_ledger(&config)?.list_wallets()?;
            let report = gas_report(&client, &wallets, config.gas.min_gas_balance_wei()).await?;
            print_json(&report)?;
        }
        Commands::TopUp { address, operator, min } => {
            let ledger = open_ledger(&config)?;
            if ledger.wallet_by_address(&address)?.is_none() {
                return Err(anyhow!("{address} is not a user deposit wallet"));
            }
            let min_required = min
                .map(|min| parse_ether(&min).with_context(|| format!("invalid amount '{min}'")))
                .transpose()?;
            let request = GasRequest::new(address, min_required, &operator);
            ledger.insert_gas_request(&request)?;
            print_json(&request)?;
        }
        Commands::Incidents { status, limit } => {
            let incidents = IncidentManager::new(open_ledger(&config)?, &config.incidents);
            print_json(&incidents.list(status, limit)?)?;
        }
        Commands::Resolve {
            id,
            operator,
            note,
            ignore,
        } => {
            let incidents = IncidentManager::new(open_ledger(&config)?, &config.incidents);
            let incident = if ignore {
                incidents.ignore(id, &operator, note.as_deref())?
            } else {
                incidents.resolve(id, &operator, note.as_deref())?
            };
            print_json(&incident)?;
        }
        Commands::Deposits { status, limit } => {
            print_json(&open_ledger(&config)?.list_deposits(status, limit)?)?;
        }
        Commands::Sweeps { limit } => {
            print_json(&open_ledger(&config)?.list_sweeps(limit)?)?;
        }
        Commands::GasLog { limit } => {
            print_json(&open_ledger(&config)?.list_gas_supplies(limit)?)?;
        }
        Commands::TopUpRequests { limit } => {
            print_json(&open_ledger(&config)?.list_gas_requests(limit)?)?;
        }
        Commands::History { user_id } => {
            let ledger = open_ledger(&config)?;
            print_json(&json!({
                "user_id": user_id,
                "deposits": ledger.deposits_for_user(&user_id)?,
                "sweeps": ledger.sweeps_for_user(&user_id)?,
            }))?;
        }
        Commands::Summary => {
            let ledger = open_ledger(&config)?;
            print_json(&ledger.summary()?)?;
        }
    }

    Ok(())
}

async fn connect(config: SweeperConfig) -> anyhow::Result<Components> {
    let secrets = Secrets::from_env(&config.custody).context("reading custody secrets")?;
    Components::build(config, &secrets)
        .await
        .context("initializing components")
}

fn open_ledger(config: &SweeperConfig) -> anyhow::Result<Ledger> {
    Ledger::open(&config.ledger.path).with_context(|| format!("opening ledger {}", config.ledger.path))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
