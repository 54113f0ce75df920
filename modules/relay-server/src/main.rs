use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_common::{load_sources, load_targets, Config, NewItem, RenderBackend};
use relay_engine::{
    BrowserlessFactory, ChromeFactory, DeliverySink, DirectTransport, Engine, Humanizer,
    RandomHumanizer, RenderedTransport, SessionFactory, SessionPool, SourceExecutor,
};

mod api;

#[derive(Parser)]
#[command(name = "relay", about = "Polls unreliable sources and relays new items to sinks")]
struct Cli {
    /// Run one polling cycle over due targets, flush state, and exit
    #[arg(long)]
    once: bool,

    /// Overrides RELAY_TARGETS_FILE
    #[arg(long)]
    targets_file: Option<PathBuf>,

    /// Overrides RELAY_SOURCES_FILE
    #[arg(long)]
    sources_file: Option<PathBuf>,

    /// Overrides RELAY_PORT
    #[arg(long)]
    port: Option<u16>,
}

/// Built-in sink that writes delivered items to the log.
struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, item: &NewItem) -> Result<()> {
        info!(
            target_id = %item.target_id,
            item_id = %item.item_id,
            source = %item.source,
            url = item.url.as_deref().unwrap_or(""),
            title = item.title.as_deref().unwrap_or(""),
            "New item"
        );
        Ok(())
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("relay=info".parse()?);
    let json = std::env::var("RELAY_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn session_pool(config: &Config) -> Option<Arc<SessionPool>> {
    let settings = &config.engine;
    let factory: Arc<dyn SessionFactory> = match &config.render_backend {
        RenderBackend::None => return None,
        RenderBackend::Chrome { bin } => Arc::new(ChromeFactory::new(bin.clone())),
        RenderBackend::Browserless { base_url, token } => Arc::new(BrowserlessFactory::new(
            base_url,
            token.as_deref(),
            settings.attempt_timeout,
        )),
    };
    info!(backend = factory.name(), cap = settings.pool_cap, "Session pool enabled");
    Some(Arc::new(SessionPool::new(
        factory,
        settings.pool_cap,
        settings.session_max_lifetime,
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(path) = cli.targets_file {
        config.targets_file = path;
    }
    if let Some(path) = cli.sources_file {
        config.sources_file = path;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.log_redacted();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    let targets = load_targets(&config.targets_file)?;
    let sources = load_sources(&config.sources_file)?;
    info!(targets = targets.len(), sources = sources.len(), "Loaded target and source lists");

    let humanizer: Arc<dyn Humanizer> = Arc::new(RandomHumanizer);
    let pool = session_pool(&config);
    let direct = DirectTransport::new(
        config.engine.attempt_timeout,
        humanizer.clone(),
        config.engine.minimum_interval,
    )?;
    let rendered = pool
        .clone()
        .map(|pool| RenderedTransport::new(pool, humanizer.clone(), config.engine.minimum_interval));

    let mut builder = Engine::builder(config.engine.clone())
        .targets(targets)
        .sources(sources)
        .targets_file(config.targets_file.clone())
        .dedup_file(config.dedup_file())
        .schedule_file(config.schedule_file())
        .fetcher(Arc::new(SourceExecutor::new(direct, rendered)))
        .humanizer(humanizer)
        .sink("log", Arc::new(LogSink));
    if let Some(pool) = pool {
        builder = builder.session_pool(pool);
    }
    let engine = builder.build()?;

    if cli.once {
        let (_tx, mut rx) = watch::channel(false);
        let dispatched = engine.run_cycle(&mut rx).await;
        engine.shutdown().await;
        info!(dispatched, "Single cycle complete");
        println!("{}", engine.stats());
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    let app = api::router(engine.clone());
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Relay control surface listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    tokio::time::timeout(Duration::from_secs(30), runner)
        .await
        .context("Engine did not stop within 30s")??;

    println!("{}", engine.stats());
    Ok(())
}
