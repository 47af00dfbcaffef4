//! Tandem CLI - Main entry point

mod commands;
mod render;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tandem - multi-agent task orchestration
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding the record store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decompose and record a new objective
    SubmitObjective {
        #[arg(long)]
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Decomposition strategy (capability, fixed, recursive)
        #[arg(long, default_value = "capability")]
        strategy: String,

        /// Required capability (repeatable)
        #[arg(long = "capability")]
        capabilities: Vec<String>,

        /// low, medium, high, critical
        #[arg(long, default_value = "medium")]
        priority: String,
    },
    /// Show an objective and its sub-tasks
    GetStatus {
        objective_id: String,
    },
    /// Cancel an objective or a single task
    Cancel {
        id: String,
    },
    /// List tasks, optionally filtered by status
    ListTasks {
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Logs go to stderr so `--json` output stays parseable
    let log_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
    let ctx = commands::Context::open(&data_dir, args.json).await?;

    match args.command {
        Command::SubmitObjective {
            title,
            description,
            strategy,
            capabilities,
            priority,
        } => {
            ctx.submit_objective(commands::SubmitArgs {
                title,
                description,
                strategy,
                capabilities,
                priority,
            })
            .await?
        }
        Command::GetStatus { objective_id } => ctx.get_status(&objective_id).await?,
        Command::Cancel { id } => ctx.cancel(&id).await?,
        Command::ListTasks { status } => ctx.list_tasks(status.as_deref()).await?,
    }
    Ok(())
}

/// ~/.local/share/tandem (or ./.tandem when no data directory is known)
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tandem"))
        .unwrap_or_else(|| PathBuf::from(".tandem"))
}

/// 0 success, 1 validation, 2 not found, 3 internal
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<tandem_foundation::Error>()
        .map_or(3, |e| e.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;
    use tandem_foundation::Error;

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let validation = anyhow::Error::new(Error::Validation("empty title".into()));
        assert_eq!(exit_code(&validation), 1);

        let missing: anyhow::Result<()> = Err(Error::NotFound("Objective x".into()).into());
        let missing = missing.context("get-status").unwrap_err();
        assert_eq!(exit_code(&missing), 2);

        let conflict = anyhow::Error::new(Error::Conflict {
            key: "task/1".into(),
            expected: 1,
            actual: 2,
        });
        assert_eq!(exit_code(&conflict), 3);
        assert_eq!(exit_code(&anyhow::anyhow!("disk on fire")), 3);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "tandem",
            "--json",
            "submit-objective",
            "--title",
            "ship",
            "--capability",
            "rust",
            "--capability",
            "docs",
        ])
        .unwrap();
        assert!(args.json);
        match args.command {
            Command::SubmitObjective {
                title,
                capabilities,
                strategy,
                ..
            } => {
                assert_eq!(title, "ship");
                assert_eq!(capabilities, vec!["rust", "docs"]);
                assert_eq!(strategy, "capability");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
