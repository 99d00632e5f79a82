use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use vaste::network::account::{AccountClient, spawn_heartbeat};
use vaste::{VasteServer, config, logger};
use vaste_core::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let config = config::load_or_create(Path::new("config/vaste_config.json5"))?;
    let account = Arc::new(AccountClient::new(config.account_service_url.clone()));

    let license = account
        .validate_license(&config.license_key)
        .await
        .context("license validation failed")?;
    log::info!(
        "license valid for \"{}\" (max players {})",
        license.name,
        license.max_players.unwrap_or(config.max_players)
    );

    let server = Server::new(config);
    if let Err(e) = account
        .sync_settings(
            &server.config().license_key,
            server.config().max_players,
            server.session_count(),
        )
        .await
    {
        log::warn!("settings sync failed: {e}");
    }

    let mut vaste = VasteServer::bind(Arc::clone(&server), Arc::clone(&account))
        .await
        .context("failed to bind listener")?;
    spawn_heartbeat(
        Arc::clone(&account),
        Arc::clone(&server),
        vaste.cancel_token.clone(),
    );

    let cancel_token = vaste.cancel_token.clone();
    tokio::select! {
        () = vaste.start() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            log::info!("shutting down");
            cancel_token.cancel();
        }
    }

    // Final heartbeat so the account service sees the server drain.
    if let Err(e) = account
        .heartbeat(&server.config().license_key, 0)
        .await
    {
        log::debug!("final heartbeat failed: {e}");
    }
    server.store().shutdown().await;
    Ok(())
}
