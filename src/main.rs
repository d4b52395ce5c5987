use ebay_ingest::{
    api::{self, AppState},
    backend::HttpBackend,
    capture::{AgentRegistry, DownloadDirWatcher, DownloadObserver, HttpFetcher},
    config::IngestConfig,
    coordinator::{self, CoordinatorDeps},
    http::build_client,
    security::ControlAuth,
    store::{FileStore, MemoryStore, RedisStore, StateStore},
};
use eyre::WrapErr;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const DOWNLOAD_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "ingest.api", "worker crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let config = IngestConfig::load().wrap_err("loading configuration")?;
    let user_agent = format!("ebay-ingest/{}", config.extension_version);
    let http = build_client(
        config.http_timeout_secs,
        config.http_connect_timeout_secs,
        &user_agent,
    );
    let backend = Arc::new(HttpBackend::new(
        config.backend_url.clone(),
        config.backend_api_key.clone(),
        http.clone(),
    ));
    let store = open_store(&config).await?;
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let port = config.port;
    let capture_deadline = config.capture_deadline();
    let download_dir = config.download_dir.clone();
    if config.watcher_captures_refused() {
        warn!(
            target = "ingest.observer",
            "DOWNLOAD_DIR is set without ALLOW_UNATTRIBUTED; files found there carry no account and will be refused"
        );
    }
    info!(
        target = "ingest.api",
        backend = %config.backend_url,
        store = %store.describe(),
        "starting worker"
    );
    let coordinator = coordinator::spawn(CoordinatorDeps {
        config,
        backend,
        store,
    })
    .await;
    let control = coordinator.control();

    let fetcher = Arc::new(HttpFetcher::new(http));
    let observer = Arc::new(DownloadObserver::new(
        Arc::new(control.clone()),
        fetcher.clone(),
        capture_deadline,
    ));
    let pages = Arc::new(AgentRegistry::new(Arc::new(control.clone()), fetcher, capture_deadline));
    if let Some(dir) = download_dir {
        match DownloadDirWatcher::new(dir.clone()).await {
            Ok(watcher) => {
                tokio::spawn(watcher.run(
                    observer.clone(),
                    DOWNLOAD_POLL,
                    coordinator.shutdown_signal(),
                ));
            }
            Err(err) => warn!(
                target = "ingest.observer",
                dir = %dir.display(),
                error = %err,
                "download directory not watchable"
            ),
        }
    }

    let state = AppState {
        control,
        observer,
        pages,
        prometheus: Some(prometheus),
        metrics_key: std::env::var("METRICS_KEY").ok().filter(|key| !key.is_empty()),
    };
    let app = api::router(state, ControlAuth::from_env());

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    info!(target = "ingest.api", "listening on {addr}");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    info!(target = "ingest.api", "worker stopped");
    Ok(())
}

/// Redis when `REDIS_URL` is set, else files under `STATE_DIR`, else memory.
async fn open_store(config: &IngestConfig) -> eyre::Result<Arc<dyn StateStore>> {
    if let Some(url) = &config.redis_url {
        return Ok(Arc::new(RedisStore::open(url).wrap_err("opening redis store")?));
    }
    if let Some(dir) = &config.state_dir {
        let store = FileStore::open(dir)
            .await
            .wrap_err_with(|| format!("opening state dir {}", dir.display()))?;
        return Ok(Arc::new(store));
    }
    warn!(
        target = "ingest.store",
        "no STATE_DIR or REDIS_URL; queue state will not survive a restart"
    );
    Ok(Arc::new(MemoryStore::new()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "ingest.api", error = %err, "ctrl-c handler failed");
        std::future::pending::<()>().await;
    }
    info!(target = "ingest.api", "shutdown requested");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
