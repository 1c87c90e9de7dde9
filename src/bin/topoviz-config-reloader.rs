//! Sidecar watching a Kubernetes config-map volume for updates and
//! asking the topoviz server to reload its configuration.
//!
//! A config-map update materializes as a freshly created `..data`
//! directory the volume symlink flips to; that create event triggers
//! the reload request.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Error};
use clap::Parser;
use hyper::{Body, Client, Method, Request};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

const MAX_RELOAD_ATTEMPTS: u32 = 8;

#[derive(Parser)]
#[command(name = "topoviz-config-reloader", version, about = "Config reloader sidecar for topoviz")]
struct Args {
    /// The directory containing the topoviz configuration file.
    #[arg(long = "config.watch-dir")]
    watch_dir: PathBuf,

    /// The url to send reloading requests to.
    #[arg(long = "config.reload-url", default_value = "http://127.0.0.1:9091/reload")]
    reload_url: String,

    /// The level of logging.
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    builder.parse_filters(&args.log_level);
    builder.init();

    if let Err(err) = run(&args).await {
        log::error!("reloader failed: {}", err);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), Error> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher =
        notify::recommended_watcher(move |event: Result<notify::Event, notify::Error>| {
            let _ = event_tx.send(event);
        })?;
    watcher.watch(&args.watch_dir, RecursiveMode::NonRecursive)?;
    log::info!("watching {:?}", args.watch_dir);

    // pick up whatever configuration is already there
    reload(&args.reload_url).await;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            event = event_rx.recv() => match event {
                Some(Ok(event)) => {
                    if is_configmap_update(&event) {
                        log::info!("configuration volume updated");
                        reload(&args.reload_url).await;
                    }
                }
                Some(Err(err)) => log::error!("watch error: {}", err),
                None => break,
            }
        }
    }

    log::warn!("exiting gracefully");
    Ok(())
}

fn is_configmap_update(event: &notify::Event) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().map_or(false, |name| name == "..data"))
}

/// Ask the server to reload, retrying with exponential back-off.
async fn reload(url: &str) {
    let mut delay = Duration::from_secs(1);
    for attempt in 1..=MAX_RELOAD_ATTEMPTS {
        match post_reload(url).await {
            Ok(()) => {
                log::info!("reload request accepted");
                return;
            }
            Err(err) => log::error!("reload attempt {} failed: {}", attempt, err),
        }
        if attempt < MAX_RELOAD_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(60));
        }
    }
    log::error!("giving up after {} reload attempts", MAX_RELOAD_ATTEMPTS);
}

async fn post_reload(url: &str) -> Result<(), Error> {
    let client = Client::new();
    let request = Request::builder()
        .method(Method::POST)
        .uri(url)
        .body(Body::empty())?;
    let response = client.request(request).await?;
    if !response.status().is_success() {
        bail!("server returned status {}", response.status());
    }
    Ok(())
}
