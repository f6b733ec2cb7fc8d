use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use gatehouse::cache::{Repository, StoredToken};
use gatehouse::keyring::{FileKeyring, KeyringToken, KeyringTokenLookup};
use gatehouse::proxy::{ClientProxy, ProxyOptions};
use gatehouse::store::Store;
use gatehouse::{api, config, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gatehouse=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    match args.command {
        Some(cli::Commands::Serve) | None => serve(cfg).await,
        Some(cli::Commands::Refresh) => {
            let repo = open_repository(&cfg).await?;
            let client = api::Client::new()?;
            repo.refresh(&client).await?;
            Ok(())
        }
        Some(cli::Commands::Connect { authz, listen_addr }) => connect(authz, listen_addr).await,
        Some(cli::Commands::Token { command }) => token_command(&cfg, command).await,
        Some(cli::Commands::Targets { addr, token_name, keyring_type, query }) => {
            let repo = open_repository(&cfg).await?;
            let targets = match query {
                Some(q) => repo.query_targets(&addr, &token_name, &keyring_type, &q).await?,
                None => repo.list_targets(&addr, &token_name, &keyring_type).await?,
            };
            for t in targets {
                println!("{}\t{}\t{}", t.public_id, t.name, t.address);
            }
            Ok(())
        }
    }
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    let repo = open_repository(&cfg).await?;
    let client = Arc::new(api::Client::new()?);
    jobs::refresher::spawn(repo, client, Duration::from_secs(cfg.refresh_interval_secs));

    tracing::info!(db = %cfg.database_path, "gatehouse daemon running");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutting down");
    Ok(())
}

async fn connect(authz: String, listen_addr: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    let proxy = Arc::new(ClientProxy::new(
        &authz,
        ProxyOptions { listen_addr, ..ProxyOptions::default() },
    )?);

    // Ctrl-C cancels the proxy's root token; the deadline does the rest.
    let cancel = proxy.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let addr_task = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let cancel = proxy.cancellation();
            if let Some(addr) = proxy.listener_addr(Some(&cancel)).await {
                println!("listening on {addr}");
            }
        })
    };

    let result = proxy.start().await;
    addr_task.abort();
    result?;
    Ok(())
}

async fn token_command(cfg: &config::Config, command: cli::TokenCommands) -> anyhow::Result<()> {
    let repo = open_repository(cfg).await?;
    match command {
        cli::TokenCommands::Add { addr, token_name, keyring_type, auth_token_id } => {
            repo.add_stored_token(&addr, &token_name, &keyring_type, &auth_token_id).await?;
            println!("stored token {keyring_type}/{token_name}");
        }
        cli::TokenCommands::List => {
            for t in repo.list_stored_tokens().await? {
                println!(
                    "{}/{}\t{}\t{}\tlast used {}",
                    t.keyring_type, t.token_name, t.boundary_addr, t.user_id, t.last_accessed_time
                );
            }
        }
        cli::TokenCommands::Delete { token_name, keyring_type } => {
            let token = StoredToken {
                keyring_type,
                token_name,
                boundary_addr: String::new(),
                auth_token_id: String::new(),
                user_id: String::new(),
                last_accessed_time: chrono::Utc::now(),
            };
            repo.delete_stored_token(&token).await?;
            println!("deleted");
        }
    }
    Ok(())
}

async fn open_repository(cfg: &config::Config) -> anyhow::Result<Repository> {
    let store = Store::open(&cfg.database_path).await?;
    let keyring: Arc<dyn KeyringTokenLookup> = match &cfg.keyring_file {
        Some(path) => Arc::new(FileKeyring::load(path)?),
        None => {
            tracing::warn!("GATEHOUSE_KEYRING_FILE not set; keyring lookups will find nothing");
            Arc::new(|_: &str, _: &str| None::<KeyringToken>)
        }
    };
    Ok(Repository::new(store, keyring))
}
