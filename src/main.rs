#![forbid(unsafe_code)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use token_ledger::billing::{Credit, NoJobRecords, TransactionSource};
use token_ledger::observability::{init_logging, MetricsSink};
use token_ledger::webhook::signature;
use token_ledger::{
    BalanceStore, Config, Database, ExpirySweeper, PrometheusMetrics, TokenLedger,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Token ledger administration")]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long, short, env = "TOKEN_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a user's balance as JSON.
    Balance {
        #[arg(long)]
        user: String,
    },
    /// Print a user's most recent transactions as JSON.
    Transactions {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Hold tokens for a job.
    Reserve {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tokens: i64,
        #[arg(long = "ref")]
        ref_id: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Settle a reservation with the actual usage.
    Commit {
        #[arg(long)]
        reservation: String,
        #[arg(long)]
        tokens: i64,
        #[arg(long)]
        key: Option<String>,
    },
    /// Return a reservation's tokens.
    Release {
        #[arg(long)]
        reservation: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Manually grant tokens.
    Credit {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tokens: i64,
        #[arg(long = "ref")]
        ref_id: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Run one expiry sweep and print the report.
    Sweep {
        /// Also print the resulting metrics in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },
    /// Run the expiry sweeper until interrupted.
    RunSweeper,
    /// Check a webhook signature header against a payload file.
    VerifySignature {
        #[arg(long)]
        payload: PathBuf,
        #[arg(long)]
        header: String,
    },
    /// Print the configuration JSON schema.
    ConfigSchema,
}

struct Services {
    config: Config,
    ledger: Arc<TokenLedger>,
}

impl Services {
    fn open(config: Config) -> Result<Self> {
        let db = Arc::new(Database::open(&config.database_path)?);
        let balances = Arc::new(BalanceStore::new(Arc::clone(&db)));
        let ledger = Arc::new(TokenLedger::new(db, balances, &config.ledger));
        Ok(Self { config, ledger })
    }

    fn sweeper(&self, metrics: Arc<dyn MetricsSink>) -> Result<ExpirySweeper> {
        let batch_limit = usize::try_from(self.config.sweeper.batch_limit)
            .context("sweeper batch_limit does not fit in usize")?;
        Ok(ExpirySweeper::new(
            Arc::clone(&self.ledger),
            Arc::new(NoJobRecords),
            metrics,
            batch_limit,
        ))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Command::ConfigSchema = cli.command {
        println!("{}", Config::schema_json()?);
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::VerifySignature { payload, header } => {
            let secret = config
                .webhook
                .signing_secret
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .context("webhook signing secret is not configured")?;
            let body = std::fs::read(&payload)
                .with_context(|| format!("Failed to read payload: {}", payload.display()))?;
            signature::verify(
                secret,
                &body,
                &header,
                config.webhook.tolerance_secs,
                chrono::Utc::now().timestamp(),
            )?;
            println!("signature ok");
        }
        Command::Balance { user } => {
            let services = Services::open(config)?;
            print_json(&services.ledger.get_balance(&user)?)?;
        }
        Command::Transactions { user, limit } => {
            let services = Services::open(config)?;
            print_json(&services.ledger.list_transactions(&user, limit)?)?;
        }
        Command::Reserve {
            user,
            tokens,
            ref_id,
            key,
        } => {
            let services = Services::open(config)?;
            print_json(&services.ledger.reserve(&user, tokens, &ref_id, key.as_deref())?)?;
        }
        Command::Commit {
            reservation,
            tokens,
            key,
        } => {
            let services = Services::open(config)?;
            print_json(&services.ledger.commit(&reservation, tokens, key.as_deref())?)?;
        }
        Command::Release { reservation, key } => {
            let services = Services::open(config)?;
            print_json(&services.ledger.release(&reservation, key.as_deref())?)?;
        }
        Command::Credit {
            user,
            tokens,
            ref_id,
            key,
        } => {
            let services = Services::open(config)?;
            let mut credit = Credit::new(user, tokens, ref_id).source(TransactionSource::Manual);
            if let Some(key) = key {
                credit = credit.idempotency_key(key);
            }
            let receipt = services.ledger.credit_purchase(credit)?;
            if receipt.replayed {
                tracing::info!("Credit already applied under this key");
            }
            print_json(&receipt.transaction)?;
        }
        Command::Sweep { metrics } => {
            let services = Services::open(config)?;
            let sink = Arc::new(PrometheusMetrics::new()?);
            let report = services
                .sweeper(Arc::clone(&sink) as Arc<dyn MetricsSink>)?
                .run_once()?;
            println!(
                "expired={} released={} already_settled={} failed={} tokens_released={}",
                report.expired,
                report.released,
                report.already_settled,
                report.failed,
                report.tokens_released
            );
            if metrics {
                print!("{}", sink.encode_text()?);
            }
        }
        Command::RunSweeper => {
            let services = Services::open(config)?;
            if !services.config.sweeper.enabled {
                anyhow::bail!("sweeper is disabled in configuration");
            }
            let period = Duration::from_secs(services.config.sweeper.interval_secs.max(1));
            let sink: Arc<dyn MetricsSink> = Arc::new(PrometheusMetrics::new()?);
            let handle = Arc::new(services.sweeper(sink)?).spawn(period);
            tracing::info!(interval_secs = period.as_secs(), "Expiry sweeper running");

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down expiry sweeper");
            handle.abort();
        }
        Command::ConfigSchema => {}
    }

    Ok(())
}
