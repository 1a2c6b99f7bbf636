use anyhow::{Context, Result};
use brc_core::DateWindow;
use brc_pipeline::{maybe_build_scheduler, ServiceConfig, ServiceContext};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "brc-cli")]
#[command(about = "Breakdown report classifier")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the scheduler and the HTTP server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Classify one date window and exit. Defaults to today.
    Run {
        #[arg(long)]
        start_date: Option<String>,
        #[arg(long)]
        end_date: Option<String>,
    },
    /// Call the reporting procedure once.
    Report,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    let log_json = std::env::var("BRC_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let ctx = ServiceContext::from_config(&config)?;
            let scheduler = maybe_build_scheduler(&ctx, &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(
                    cron_1 = %config.classify_cron_1,
                    cron_2 = %config.classify_cron_2,
                    report_interval_minutes = config.report_interval_minutes,
                    "scheduler started"
                );
            }
            brc_web::serve(ctx, port.unwrap_or(config.port)).await?;
        }
        Commands::Run {
            start_date,
            end_date,
        } => {
            let window = DateWindow::resolve(
                start_date.as_deref(),
                end_date.as_deref(),
                config.civil_offset()?,
            )?
            .within_span(config.max_window_days)?;
            let summary = brc_pipeline::run_classification_from_env(Some(window)).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            println!("time elapsed: {}", summary.time_elapsed());
        }
        Commands::Report => {
            brc_pipeline::run_reporting_from_env().await?;
        }
    }

    Ok(())
}
