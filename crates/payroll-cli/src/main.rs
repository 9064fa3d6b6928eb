use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use payroll_etl::{run_load_once_from_env, PayrollConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "payroll-cli")]
#[command(about = "Payroll warehouse loader and KPI API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a CSV payroll extract into the warehouse in one transaction.
    Load {
        path: PathBuf,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the warehouse schema and indexes if absent.
    Migrate,
    /// Serve the KPI HTTP API.
    Serve,
    /// List the warehouse indexes.
    Indexes,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Load { path, json } => {
            let summary = run_load_once_from_env(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let report = &summary.report;
                println!(
                    "load complete: run_id={} rows={} rejected={} depts_inserted={} employees_upserted={} facts_upserted={} total_fact_rows={}",
                    summary.run_id,
                    summary.rows_read,
                    summary.rows_rejected,
                    report.depts_inserted,
                    report.employees_upserted(),
                    report.facts_upserted(),
                    report.total_fact_rows
                );
            }
        }
        Commands::Migrate => {
            let warehouse = config()?.connect().await?;
            warehouse
                .ensure_schema()
                .await
                .context("ensuring warehouse schema")?;
            warehouse.close().await;
            println!("schema pr is up to date");
        }
        Commands::Serve => {
            payroll_web::serve(&config()?).await?;
        }
        Commands::Indexes => {
            let warehouse = config()?.connect().await?;
            let indexes = warehouse.list_indexes().await.context("listing indexes")?;
            warehouse.close().await;
            for index in indexes {
                println!("{}.{}: {}", index.table, index.name, index.definition);
            }
        }
    }

    Ok(())
}

fn config() -> Result<PayrollConfig> {
    PayrollConfig::from_env().context("reading payroll configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn load_takes_a_path_and_json_flag() {
        let cli = Cli::try_parse_from(["payroll-cli", "load", "extract.csv", "--json"]).unwrap();
        match cli.command {
            Commands::Load { path, json } => {
                assert_eq!(path, PathBuf::from("extract.csv"));
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn a_subcommand_is_required() {
        assert!(Cli::try_parse_from(["payroll-cli"]).is_err());
        assert!(Cli::try_parse_from(["payroll-cli", "load"]).is_err());
    }
}
