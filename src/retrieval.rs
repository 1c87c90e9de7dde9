//! Periodic scraping of the metric back-ends.
//!
//! The retriever runs one scrape immediately, then ticks at the
//! configured interval. Scrapes never overlap: a tick only fires after
//! the previous round (generation plus storage append) returned. Each
//! scrape carries its own deadline which cancels every in-flight
//! query when it expires.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Error;
use tokio::sync::{oneshot, watch};

mod generator;
pub mod promquery;

use crate::config::Config;
use crate::metrics;
use crate::storage::Appender;
use crate::tools;
use generator::Generator;
use promquery::PromPool;

#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    #[error("no configuration has been applied yet")]
    ConfigNotSet,
}

pub struct Options {
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
}

#[derive(Clone)]
struct ScrapeState {
    cfg: Arc<Config>,
    pool: Arc<PromPool>,
}

pub struct Retriever {
    options: Options,
    appender: Arc<dyn Appender>,
    state: RwLock<Option<ScrapeState>>,
    shutdown: watch::Sender<bool>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Retriever {
    pub fn new(options: Options, appender: Arc<dyn Appender>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            options,
            appender,
            state: RwLock::new(None),
            shutdown,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Scrape once right away, then keep scraping at the configured
    /// interval until [`stop`](Self::stop) is called.
    pub async fn run(self: Arc<Self>) {
        log::info!("starting retriever");
        let done_tx = self.done_tx.lock().unwrap().take();
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.options.scrape_interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.scrape().await,
            }
        }

        log::info!("retriever stopped");
        if let Some(done_tx) = done_tx {
            let _ = done_tx.send(());
        }
    }

    /// Cancel the scrape loop and wait for it to exit. A second call
    /// only logs.
    pub async fn stop(&self) {
        if *self.shutdown.borrow() {
            log::warn!("retriever already stopped");
            return;
        }
        log::info!("stopping retriever");
        let _ = self.shutdown.send(true);

        let done_rx = self.done_rx.lock().unwrap().take();
        if let Some(done_rx) = done_rx {
            let _ = done_rx.await;
        }
    }

    /// Swap in a new configuration together with a client pool built
    /// from the back-end addresses it references. When the pool cannot
    /// be built the previous configuration stays active.
    pub fn apply_config(&self, cfg: Config) -> Result<(), Error> {
        let pool = PromPool::new(&cfg)?;
        let mut state = self.state.write().unwrap();
        *state = Some(ScrapeState { cfg: Arc::new(cfg), pool: Arc::new(pool) });
        log::info!("applied new configuration");
        Ok(())
    }

    async fn scrape(&self) {
        let state = self.state.read().unwrap().clone();
        let state = match state {
            Some(state) => state,
            None => {
                log::warn!("scrape skipped: {}", RetrieveError::ConfigNotSet);
                metrics::SCRAPES.with_label_values(&["skipped"]).inc();
                return;
            }
        };

        let ts = tools::epoch_secs();
        log::debug!("scraping back-ends at {}", ts);
        let timer = metrics::SCRAPE_DURATION.start_timer();
        let generator = Generator::new(&state.cfg, state.pool.as_ref());
        let result =
            tokio::time::timeout(self.options.scrape_timeout, generator.generate_snapshot(ts))
                .await;
        timer.observe_duration();

        let snapshot = match result {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => {
                log::error!("failed to generate graph snapshot: {}", err);
                metrics::SCRAPES.with_label_values(&["error"]).inc();
                return;
            }
            Err(_) => {
                log::error!(
                    "scrape timed out after {}s",
                    self.options.scrape_timeout.as_secs()
                );
                metrics::SCRAPES.with_label_values(&["timeout"]).inc();
                return;
            }
        };

        if let Err(err) = self.appender.add(snapshot) {
            log::error!("failed to append snapshot to storage: {}", err);
            metrics::SCRAPES.with_label_values(&["error"]).inc();
            return;
        }
        metrics::SCRAPES.with_label_values(&["success"]).inc();
    }
}
