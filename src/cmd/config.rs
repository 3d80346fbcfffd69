//! `apothecary config`: view, create and validate configuration.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use super::super::ConfigCommands;
use apothecary::config::ShopConfig;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Apothecary Configuration").bold());
            println!("========================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No apothecary.toml found at {}", config_path.display());
                println!("Using defaults. Run 'apothecary config init' to create one.");
            }
            println!();

            let config = ShopConfig::resolve(config_path)?;
            println!("Effective values (with env overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();
            if !config_path.exists() {
                println!("No apothecary.toml found. Using defaults.");
            }

            let config = ShopConfig::resolve(config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("apothecary.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ShopConfig::default().save(config_path)?;

            println!("Created apothecary.toml at {}", config_path.display());
            println!();
            println!("Before going live, set at least:");
            println!("  - [auth] jwt_secret (or APOTHECARY_JWT_SECRET)");
            println!("  - [server] host and port");
            println!("  - [uploads] dir for product and post images");
            println!();
        }
    }

    Ok(())
}
