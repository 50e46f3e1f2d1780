use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod cache;
mod config;
mod error;
mod session;
mod todo;
mod ui;

use auth::GraphTokenProvider;
use session::SessionController;
use todo::ReqwestTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todolist_client=info,warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(err) = dotenvy::dotenv() {
        debug!(error = %err, "No .env file loaded, using the process environment");
    }

    let config = config::read_config_from_env()
        .context("Configuration is incomplete. Please inspect .env.example.")?;
    info!(api = %config.api_base_url, authority = %config.authority, "Starting to-do list client");

    let provider = Arc::new(GraphTokenProvider::new(&config));
    let transport = Arc::new(ReqwestTransport::new(&config.api_base_url)?);
    let controller = SessionController::new(provider, transport, config.scopes.clone());

    ui::main_menu(&controller).await
}
