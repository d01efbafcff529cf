use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use haven_api::accounts::{hash_password, AccountDirectory};
use haven_api::{build_router, AppState};
use haven_core::Guards;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("haven=info,tower_http=debug"));
    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Some(password) = args.hash_password.as_deref() {
        println!("{}", hash_password(password)?);
        return Ok(());
    }

    let mut config = config::Config::load(&args.config)?;
    if args.backup_codes {
        println!("{}", config::backup_codes_entry(&config.mfa));
        return Ok(());
    }
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let guards = Arc::new(Guards::new(&config.guard_config())?);
    let accounts = AccountDirectory::from_config(&config.accounts)?;
    if accounts.is_empty() {
        tracing::warn!("No [[accounts]] configured; every login will fail");
    }
    if config.admin.token.is_none() {
        tracing::warn!("No admin token configured; admin routes are disabled");
    }
    let settings = config.api_settings();
    if settings.proxy.trust_forwarded_for && settings.proxy.trusted_proxies.is_empty() {
        tracing::warn!(
            "X-Forwarded-For is trusted from any peer; set server.trusted_proxies behind a proxy"
        );
    }

    let state = AppState::new(guards.clone(), accounts, settings);
    let app = build_router(state)?;
    let sweepers = guards.start_sweepers();

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind_address = %config.server.bind_address,
        accounts = config.accounts.len(),
        csrf_single_use = config.csrf.single_use,
        "Haven listening"
    );

    let shutdown_signal = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down (ctrl-c)...");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    sweepers.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
