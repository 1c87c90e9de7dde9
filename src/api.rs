//! HTTP surface: graph reads, configuration reload and self metrics.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{format_err, Error};
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use http::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cache::ChunkCache;
use crate::metrics;
use crate::model::Snapshot;
use crate::storage::{chunk_id, Querier};
use crate::tools;

/// One reload request; the binary answers on the enclosed channel.
pub type ReloadRequest = oneshot::Sender<Result<(), Error>>;

pub struct Options {
    pub listen_address: SocketAddr,
    /// Seconds covered by one storage chunk, needed to bucket offset
    /// queries.
    pub chunk_length: i64,
}

pub struct Handler {
    options: Options,
    querier: Arc<dyn Querier>,
    cache: ChunkCache,
    reload_tx: mpsc::Sender<ReloadRequest>,
}

impl Handler {
    pub fn new(
        options: Options,
        querier: Arc<dyn Querier>,
        cache: ChunkCache,
    ) -> (Arc<Self>, mpsc::Receiver<ReloadRequest>) {
        let (reload_tx, reload_rx) = mpsc::channel(4);
        (Arc::new(Self { options, querier, cache, reload_tx }), reload_rx)
    }

    /// Serve until the shutdown signal flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let handler = Arc::clone(&self);
        let make_svc = make_service_fn(move |_conn| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                }))
            }
        });

        log::info!("listening on {}", self.options.listen_address);
        Server::try_bind(&self.options.listen_address)
            .map_err(|err| format_err!("unable to bind {}: {}", self.options.listen_address, err))?
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(Error::from)
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let (name, result) = match (req.method(), req.uri().path()) {
            (&Method::GET, "/graph") => ("graph", self.graph(&req)),
            (&Method::POST, "/reload") => ("reload", self.reload().await),
            (_, "/reload") => ("reload", Ok(empty_response(StatusCode::NOT_IMPLEMENTED))),
            (&Method::GET, "/metrics") => ("metrics", self.metrics()),
            _ => ("unknown", Ok(empty_response(StatusCode::NOT_FOUND))),
        };

        let mut response = result.unwrap_or_else(|err| {
            log::error!("request handling failed: {}", err);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        });
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        metrics::HTTP_REQUESTS
            .with_label_values(&[name, response.status().as_str()])
            .inc();
        response
    }

    fn graph(&self, req: &Request<Body>) -> Result<Response<Body>, Error> {
        let offset = match parse_offset(req.uri().query()) {
            Ok(offset) => offset,
            Err(err) => {
                log::warn!("bad offset parameter: {}", err);
                return Ok(empty_response(StatusCode::BAD_REQUEST));
            }
        };

        let snapshot = if offset > 0 {
            self.snapshot_at(tools::epoch_secs() - offset)
        } else {
            match self.querier.get_latest_snapshot() {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::debug!("no latest snapshot: {}", err);
                    None
                }
            }
        };

        match snapshot {
            Some(snapshot) => Ok(json_response(snapshot.graph_json)),
            None => Ok(empty_response(StatusCode::NOT_FOUND)),
        }
    }

    /// Pick the best snapshot for the given absolute timestamp: derive
    /// the chunk, preferring the cache over a disk read, then search
    /// within it. Only completed chunks enter the cache - the current
    /// chunk is mutable and must be fetched fresh every time.
    fn snapshot_at(&self, ts: i64) -> Option<Snapshot> {
        let id = chunk_id(ts, self.options.chunk_length);
        let chunk = match self.cache.get(id) {
            Some(chunk) => chunk,
            None => {
                let chunk = match self.querier.get_chunk(id) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        log::debug!("no chunk {} available: {}", id, err);
                        return None;
                    }
                };
                if chunk.is_completed() {
                    self.cache.put(id, chunk.clone());
                }
                chunk
            }
        };
        chunk.find_best_snapshot(ts).cloned()
    }

    async fn reload(&self) -> Result<Response<Body>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.reload_tx
            .send(reply_tx)
            .await
            .map_err(|_| format_err!("reload channel closed"))?;
        match reply_rx.await {
            Ok(Ok(())) => Ok(empty_response(StatusCode::OK)),
            Ok(Err(err)) => {
                log::error!("configuration reload failed: {}", err);
                let body = Body::from(format!("failed to reload config: {}\n", err));
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(body)
                    .map_err(Error::from)
            }
            Err(_) => Err(format_err!("reload reply channel dropped")),
        }
    }

    fn metrics(&self) -> Result<Response<Body>, Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metrics::REGISTRY.gather(), &mut buffer)?;
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Body::from(buffer))
            .map_err(Error::from)
    }
}

fn parse_offset(query: Option<&str>) -> Result<i64, Error> {
    let query = match query {
        Some(query) => query,
        None => return Ok(0),
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "offset" {
            return value
                .parse()
                .map_err(|err| format_err!("offset '{}' is not an integer: {}", value, err));
        }
    }
    Ok(0)
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn json_response(body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
