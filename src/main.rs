use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use autobattle::api;
use autobattle::assets::AssetStore;
use autobattle::capture::XcapCapture;
use autobattle::config::Config;
use autobattle::input::{ActionExecutor, EnigoInput};
use autobattle::interaction::ScreenInteractor;
use autobattle::state::{AppState, AppStateInner};
use autobattle::window::XcapWindowLocator;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let default_filter = if config.debug {
        "info,autobattle=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!(
        "autobattle starting, assets: {}, language: {}, window: '{}', listen: {}",
        config.assets_dir.display(),
        config.locale,
        config.window_title,
        config.listen_addr,
    );

    let window = Arc::new(XcapWindowLocator::new(config.window_title.clone()));
    let executor = ActionExecutor::new(Arc::new(EnigoInput::default()), window.clone());
    let assets = Arc::new(AssetStore::new(config.assets_dir.clone(), config.locale));
    let screen = ScreenInteractor::new(
        Arc::new(XcapCapture),
        window,
        executor,
        assets,
        config.match_threshold,
    )
    .with_debug_captures(config.debug_captures.clone());

    match screen.monitors() {
        Ok(monitors) => tracing::info!("{} monitor(s) detected", monitors.len()),
        Err(e) => tracing::warn!("could not list monitors: {e}"),
    }

    let state: AppState = Arc::new(Mutex::new(AppStateInner::new(config.clone())));

    let app = api::router(state, Arc::new(screen)).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .context(format!("failed to bind to {}", config.listen_addr))?;

    tracing::info!("listening on {}", config.listen_addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
