use anyhow::Result;
use clap::{Parser, Subcommand};
use shelfwatch_cascade::{maybe_build_scheduler, migrate_from_env, run_once_from_env, CascadeConfig};

#[derive(Debug, Parser)]
#[command(name = "shelfwatch")]
#[command(about = "Catalog snapshot diff and notification cascade")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cascade invocation: diff, decide, deliver, persist.
    Run,
    /// Run the cascade without delivering or persisting anything and print
    /// the notifications that would have gone out.
    DryRun,
    /// Keep running the cascade on the configured cron schedule.
    Watch,
    /// Apply the history schema migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = run_once_from_env(false).await?;
            println!(
                "run complete: run_id={} tier={:?} notifications={} delivered={} cursor {} -> {}",
                summary.run_id,
                summary.tier,
                summary.notifications.len(),
                summary.delivered,
                summary.cursor_before,
                summary.cursor_after
            );
        }
        Commands::DryRun => {
            let summary = run_once_from_env(true).await?;
            println!(
                "dry run: tier={:?} cursor {} -> {} ({} notification(s), nothing persisted)",
                summary.tier,
                summary.cursor_before,
                summary.cursor_after,
                summary.notifications.len()
            );
            for notification in &summary.notifications {
                println!("---");
                println!("{}", notification.text);
                if let Some(image) = &notification.image {
                    println!("[image: {image}]");
                }
            }
        }
        Commands::Watch => {
            let config = CascadeConfig::from_env();
            match maybe_build_scheduler(&config).await? {
                Some(sched) => {
                    sched.start().await?;
                    tokio::signal::ctrl_c().await?;
                }
                None => {
                    eprintln!("scheduler disabled; set SHELFWATCH_SCHEDULER_ENABLED=1");
                }
            }
        }
        Commands::Migrate => {
            migrate_from_env().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
