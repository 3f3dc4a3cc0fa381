use std::path::PathBuf;

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand};
use process_supervisor::{Config, SupervisorBuilder};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "process-supervisor", version, about = "Launch, watch and schedule child processes")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of plugin manifests; overrides `mod_dir` from the config.
    #[arg(long, global = true)]
    mod_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor until interrupted.
    Run,
    /// Create the resources the enabled plugins need.
    Init,
    /// Run a command contributed by a plugin.
    Exec {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("process_supervisor=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.mod_dir {
        config.mod_dir = Some(dir);
    }
    let supervisor = SupervisorBuilder::from_config(config)
        .with_builtin_mods()
        .build()
        .context("building supervisor")?;

    match cli.command {
        Command::Run => {
            let handle = supervisor.run();
            let ctrl_c = handle.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupted; shutting down");
                    let _ = ctrl_c.shutdown();
                }
            });
            handle.wait().await?;
        }
        Command::Init => {
            supervisor.init_mods().await?;
            info!("init complete");
        }
        Command::Exec { name, args } => {
            let commands = supervisor.commands();
            let command = commands.get(&name).ok_or_else(|| {
                let mut known: Vec<_> = commands.keys().map(String::as_str).collect();
                known.sort_unstable();
                anyhow!("unknown command `{name}` (available: {})", known.join(", "))
            })?;
            command(args.as_slice())?;
        }
    }
    Ok(())
}
