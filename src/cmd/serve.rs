//! `apothecary serve`: run the storefront server.

use anyhow::Result;

use apothecary::config::ShopConfig;

pub async fn cmd_serve(config: ShopConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    apothecary::shop::server::start_server(config).await
}
