//! The topoviz server: scrape loop, storage and HTTP API in one
//! process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use topoviz::api;
use topoviz::cache::{self, ChunkCache};
use topoviz::config;
use topoviz::metrics;
use topoviz::retrieval::{self, Retriever};
use topoviz::storage::{self, Appender, DiskStorage, Querier};

#[derive(Parser)]
#[command(name = "topoviz", version, about = "The topoviz server")]
struct Args {
    /// Topoviz configuration file path.
    #[arg(long = "config.file", default_value = "/etc/topoviz/topoviz.yaml")]
    config_file: String,

    /// The level of logging.
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    /// Address to listen on for API requests. Takes precedence over
    /// api.port.
    #[arg(long = "api.listen-address")]
    api_listen_address: Option<SocketAddr>,

    /// Port to listen on for API requests.
    #[arg(long = "api.port", default_value_t = 9091)]
    api_port: u16,

    /// How frequently to scrape metrics from the back-ends.
    #[arg(long = "retrieval.scrape-interval", value_parser = humantime::parse_duration, default_value = "10s")]
    scrape_interval: Duration,

    /// How long until a scrape request times out.
    #[arg(long = "retrieval.scrape-timeout", value_parser = humantime::parse_duration, default_value = "8s")]
    scrape_timeout: Duration,

    /// The maximum number of chunks that can be cached.
    #[arg(long = "cache.size", default_value_t = 100)]
    cache_size: usize,

    /// Base path for graph data storage.
    #[arg(long = "storage.path", default_value = "/var/lib/topoviz")]
    storage_path: String,

    /// How long to retain graph data in the storage.
    #[arg(long = "storage.retention", value_parser = humantime::parse_duration, default_value = "168h")]
    storage_retention: Duration,
}

fn init_logger(level: &str) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.parse_filters(level);
    builder.init();
}

fn reload_config(path: &str, retriever: &Retriever) -> Result<(), Error> {
    log::info!("loading configuration file {}", path);
    let result = config::load_file(path).and_then(|cfg| retriever.apply_config(cfg));
    match &result {
        Ok(()) => metrics::CONFIG_RELOAD_SUCCESS.set(1),
        Err(_) => metrics::CONFIG_RELOAD_SUCCESS.set(0),
    }
    result
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args.log_level);

    let storage_options = storage::Options {
        retention: args.storage_retention,
        ..Default::default()
    };
    let storage = match DiskStorage::open(&args.storage_path, storage_options) {
        Ok(storage) => storage,
        Err(err) => {
            log::error!("failed to open storage at {}: {}", args.storage_path, err);
            std::process::exit(1);
        }
    };

    let retriever = Arc::new(Retriever::new(
        retrieval::Options {
            scrape_interval: args.scrape_interval,
            scrape_timeout: args.scrape_timeout,
        },
        Arc::clone(&storage) as Arc<dyn Appender>,
    ));

    if let Err(err) = reload_config(&args.config_file, &retriever) {
        log::error!("initial configuration load failed: {}", err);
    }

    let scrape_loop = tokio::spawn(Arc::clone(&retriever).run());

    let listen_address = args
        .api_listen_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], args.api_port)));
    let cache = ChunkCache::new(&cache::Options { size: args.cache_size });
    let (handler, mut reload_rx) = api::Handler::new(
        api::Options { listen_address, chunk_length: storage.chunk_length() },
        Arc::clone(&storage) as Arc<dyn Querier>,
        cache,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server = tokio::spawn(handler.run(shutdown_rx));

    let reload_loop = {
        let retriever = Arc::clone(&retriever);
        let config_file = args.config_file.clone();
        tokio::spawn(async move {
            while let Some(reply) = reload_rx.recv().await {
                let _ = reply.send(reload_config(&config_file, &retriever));
            }
        })
    };

    log::info!("started topoviz {}", env!("CARGO_PKG_VERSION"));

    let mut sigint = signal(SignalKind::interrupt()).expect("unable to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("unable to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => log::warn!("received SIGINT, exiting gracefully"),
        _ = sigterm.recv() => log::warn!("received SIGTERM, exiting gracefully"),
        result = &mut server => {
            match result {
                Ok(Ok(())) => log::warn!("api server exited"),
                Ok(Err(err)) => log::error!("api server failed: {}", err),
                Err(err) => log::error!("api server panicked: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    retriever.stop().await;
    let _ = scrape_loop.await;
    if let Err(err) = storage.close().await {
        log::error!("failed to close storage: {}", err);
    }
    reload_loop.abort();
}
