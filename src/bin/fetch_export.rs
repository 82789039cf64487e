//! Command-line runner: fetch one subject's activity from one source and
//! print the finished export payload as JSON.
//!
//! Usage: fetch_export <source> <subject> [start YYYY-MM-DD] [end YYYY-MM-DD]
//! where <source> is cosmoshub, kraken, or hyperliquid.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;

use chainledger::sources::cosmoshub::CosmosHubAdapter;
use chainledger::sources::hyperliquid::HyperliquidAdapter;
use chainledger::sources::kraken::KrakenAdapter;
use chainledger::sources::NoPrices;
use chainledger::store::SqliteStore;
use chainledger::{ExportPipeline, FetchOptions, SubjectIdentity, TimeRange};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        return Err(anyhow!(
            "usage: {} <source> <subject> [start YYYY-MM-DD] [end YYYY-MM-DD]",
            args[0]
        ));
    }

    let source = args[1].as_str();
    let mut identity = SubjectIdentity::new(args[2].clone());
    if let Ok(key) = std::env::var("CHAINLEDGER_API_KEY") {
        identity = identity.with_api_key(key);
    }

    let range = TimeRange::new(parse_date(args.get(3))?, parse_date(args.get(4))?);

    let store = Arc::new(SqliteStore::open_default()?);
    let pipeline = ExportPipeline::new(store, Arc::new(NoPrices));
    let options = FetchOptions::default();

    match source {
        "cosmoshub" => {
            let adapter = CosmosHubAdapter::new()?;
            let payload = pipeline
                .run(&adapter, &identity, &range, &options)
                .await?;
            print_summary(&payload.summary);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        "kraken" => {
            let adapter = KrakenAdapter::new()?;
            let payload = pipeline
                .run(&adapter, &identity, &range, &options)
                .await?;
            print_summary(&payload.summary);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        "hyperliquid" => {
            let adapter = HyperliquidAdapter::new()?;
            let payload = pipeline
                .run_derivatives(&adapter, &identity, &range, &options)
                .await?;
            print_summary(&payload.summary);
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        other => {
            return Err(anyhow!(
                "unknown source '{}' (expected cosmoshub, kraken, or hyperliquid)",
                other
            ));
        }
    }

    Ok(())
}

fn parse_date(arg: Option<&String>) -> Result<Option<NaiveDate>> {
    match arg {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| anyhow!("invalid date '{}': {}", raw, e)),
        None => Ok(None),
    }
}

fn print_summary(summary: &chainledger::models::ExportSummary) {
    eprintln!(
        "{} entries ({} flagged for review), {} to {}",
        summary.total_entries,
        summary.flagged_entries,
        summary
            .earliest
            .map(|t| t.date_naive().to_string())
            .unwrap_or_else(|| "-".to_string()),
        summary
            .latest
            .map(|t| t.date_naive().to_string())
            .unwrap_or_else(|| "-".to_string()),
    );
}
