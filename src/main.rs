use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lab_agent::agent::Agent;
use lab_agent::config::{load_env_file, AgentConfig};
use lab_agent::indexer::{IndexedScript, ScriptIndexer};

#[derive(Parser, Debug)]
#[command(name = "lab-agent")]
#[command(version)]
#[command(about = "Runs queued lab jobs and notebook sessions for one user")]
#[command(propagate_version = true)]
struct Args {
    /// Load environment variables from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one agent pass: sync scripts, run a job, start a session (default)
    Tick,

    /// List the scripts the indexer would publish, without touching the queue
    Scan {
        /// Directory to scan (defaults to LAB_HOME, then HOME)
        #[arg(long)]
        home: Option<PathBuf>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Before the subscriber, so RUST_LOG may come from the env file.
    load_env_file(args.env_file.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command.unwrap_or(Commands::Tick) {
        Commands::Tick => run_tick().await?,
        Commands::Scan { home, output } => run_scan(home, &output)?,
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_tick() -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::from_env()?;
    tracing::info!(
        linux_user = %config.identity.linux_user,
        home = %config.home.display(),
        log_root = %config.log_root.display(),
        "Starting agent tick"
    );

    let mut agent = Agent::connect(config).await?;
    let report = agent.tick().await;
    tracing::info!(
        synced = report.sync.is_some(),
        job_ran = matches!(report.job, Some(Some(_))),
        session_started = matches!(report.session, Some(Some(_))),
        "Agent tick finished"
    );
    Ok(())
}

fn run_scan(
    home: Option<PathBuf>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let home = match home {
        Some(home) => home,
        None => std::env::var_os("LAB_HOME")
            .or_else(|| std::env::var_os("HOME"))
            .map(PathBuf::from)
            .ok_or("LAB_HOME or HOME must be set, or pass --home")?,
    };

    let scripts = ScriptIndexer::new(&home).scan()?;
    print_scripts(&scripts, output_format)?;
    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn print_scripts(
    scripts: &[IndexedScript],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(scripts)?);
        }
        OutputFormat::Table => {
            println!("{:<10} PATH", "KIND");
            for script in scripts {
                println!("{:<10} {}", script.kind.to_string(), script.path);
            }
            println!("{} script(s)", scripts.len());
        }
    }
    Ok(())
}
