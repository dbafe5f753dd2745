mod error;
pub mod state;
pub mod sync;

pub use error::AppError;
pub use state::SyncClient;
pub use sync::engine::{run_sync_client, SyncCollaborators, SyncEngine};
pub use sync::refresh::{HttpRefreshSource, RefreshSource};
pub use sync::sink::{MemoryStore, StateSink, StrategyLookup, TracingSink};
pub use sync::transport::{StaticToken, TokenProvider, Transport, WebSocketTransport};
pub use sync::types::{ConnectionState, SyncClientArgs, SyncConfig};

use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strategy_sync_lib=info,strategy_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

/// Runs the sync client against the environment-configured server until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    init_tracing();

    let config = SyncClientArgs::from_env()?.normalize()?;
    info!(
        url = %config.url,
        api_base_url = %config.api_base_url,
        force_pull = config.force_pull,
        fallback_poll = config.fallback_poll,
        "starting strategy sync"
    );

    let collaborators = SyncCollaborators {
        sink: Arc::new(TracingSink::new(MemoryStore::default())),
        transport: Arc::new(WebSocketTransport::new(config.url.clone())),
        tokens: Arc::new(StaticToken(config.token.clone())),
        refresh: Arc::new(HttpRefreshSource::new(
            config.api_base_url.clone(),
            config.token.clone(),
        )),
    };

    let client = SyncClient::new(config, collaborators);
    client.connect().await;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    client.disconnect().await;
    Ok(())
}
