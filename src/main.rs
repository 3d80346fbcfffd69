use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use apothecary::config::{ShopConfig, config_path};

mod cmd;

#[derive(Parser)]
#[command(name = "apothecary")]
#[command(
    version,
    about = "Storefront, blog and affiliate back-office for a traditional-medicine pharmacy"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to apothecary.toml. Defaults to .apothecary/apothecary.toml under the project dir.
    #[arg(long, global = true, env = "APOTHECARY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the storefront and back-office server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a separate frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create an administrator account
    CreateAdmin {
        #[arg(long)]
        email: String,

        /// Display name
        #[arg(long, default_value = "Administrator")]
        name: String,

        /// Password; prompted for when omitted
        #[arg(long, env = "APOTHECARY_ADMIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View, create or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration (secrets masked)
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default apothecary.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config_file = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&project_dir));

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_file, command.clone());
    }

    let mut config = ShopConfig::resolve(&config_file)?;
    let _log_guard = apothecary::telemetry::init(&config.logging, cli.verbose)?;
    tracing::debug!(config = %config_file.display(), "Configuration loaded");

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(path) = db_path {
                config.database.path = path;
            }
            config.server.dev_mode |= dev;
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb { db_path } => {
            if let Some(path) = db_path {
                config.database.path = path;
            }
            cmd::cmd_init_db(&config)?;
        }
        Commands::CreateAdmin {
            email,
            name,
            password,
            db_path,
        } => {
            if let Some(path) = db_path {
                config.database.path = path;
            }
            cmd::cmd_create_admin(&config, &email, &name, password)?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
