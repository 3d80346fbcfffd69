//! `apothecary init-db` and `apothecary create-admin`.

use anyhow::{Context, Result};
use console::style;

use apothecary::config::ShopConfig;
use apothecary::shop::auth::{hash_password, validate_email, validate_password};
use apothecary::shop::db::ShopDb;
use apothecary::shop::models::Role;

fn open_db(config: &ShopConfig) -> Result<ShopDb> {
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    ShopDb::new(path).with_context(|| format!("Failed to open database {}", path.display()))
}

pub fn cmd_init_db(config: &ShopConfig) -> Result<()> {
    open_db(config)?;
    println!(
        "Database initialized at {}",
        style(config.database.path.display()).bold()
    );
    Ok(())
}

pub fn cmd_create_admin(
    config: &ShopConfig,
    email: &str,
    name: &str,
    password: Option<String>,
) -> Result<()> {
    validate_email(email)?;
    let password = match password {
        Some(p) => p,
        None => dialoguer::Password::new()
            .with_prompt("Password")
            .with_confirmation("Confirm password", "Passwords do not match")
            .interact()
            .context("Failed to read password")?,
    };
    validate_password(&password)?;

    let db = open_db(config)?;
    let user = db.create_user(email, &hash_password(&password)?, name, None, Role::Admin)?;
    tracing::info!(user_id = user.id, "Created admin account");
    println!(
        "{} admin {} (id {})",
        style("Created").green().bold(),
        user.email,
        user.id
    );
    Ok(())
}
