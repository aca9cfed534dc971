mod commands;
mod errors;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use agentup_core::{
    read_config, LocalUpdaterConfig, OverrideConfig, Updater, DEFAULT_VERSIONS_DIR,
    UPDATE_CONFIG_NAME,
};

use crate::commands::Commands;
use crate::errors::Result;

/// agentup - keeps the local agent on the cluster's desired version
#[derive(Parser, Debug)]
#[command(name = "agentup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding versioned installations and update.yaml
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Prefix for the system bin and systemd unit symlinks
    #[arg(long, global = true)]
    pub link_dir: Option<PathBuf>,

    /// Skip TLS certificate verification (testing only)
    #[arg(long, global = true)]
    pub insecure: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // A single ctrl-c cancels the in-flight operation; post-link stages
    // translate this into their dedicated canceled errors.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let versions_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VERSIONS_DIR));

    let updater = local_updater(&cli)?;

    match cli.command {
        Commands::Enable {
            proxy,
            group,
            url_template,
            force_version,
        } => {
            let override_cfg = OverrideConfig {
                proxy: proxy.unwrap_or_default(),
                group: group.unwrap_or_default(),
                url_template: url_template.unwrap_or_default(),
                force_version: force_version.unwrap_or_default(),
            };
            updater.enable(&cancel, override_cfg).await?;
            println!("Automatic updates enabled.");
        }
        Commands::Disable => {
            updater.disable().await?;
            println!("Automatic updates disabled.");
        }
        Commands::Status => {
            let cfg = read_config(&versions_dir.join(UPDATE_CONFIG_NAME))?;
            let display = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
            println!("enabled:        {}", cfg.spec.enabled);
            println!("proxy:          {}", display(&cfg.spec.proxy));
            println!("group:          {}", display(&cfg.spec.group));
            println!("active version: {}", display(&cfg.status.active_version));
            println!("backup version: {}", display(&cfg.status.backup_version));
        }
    }
    Ok(())
}

fn local_updater(cli: &Cli) -> Result<Updater> {
    Ok(Updater::local(LocalUpdaterConfig {
        insecure_skip_verify: cli.insecure,
        versions_dir: cli.data_dir.clone(),
        link_dir: cli.link_dir.clone(),
        ..LocalUpdaterConfig::default()
    })?)
}
