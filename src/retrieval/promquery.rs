//! Instant-query clients for the metric back-ends.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use futures::Future;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Uri};
use serde::Deserialize;

use crate::config::Config;

/// One sample of an instant-query result vector.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Sample {
    pub metric: HashMap<String, String>,
    pub value: f64,
}

pub type Vector = Vec<Sample>;

/// Capability to evaluate an instant query against a metrics back-end.
///
/// The graph generator only ever talks to this trait; tests install a
/// stub in place of the real client pool.
pub trait MetricQuerier: Send + Sync {
    fn query<'a>(
        &'a self,
        addr: &'a str,
        query: &'a str,
        ts: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vector, Error>> + Send + 'a>>;
}

/// Pool of query clients, one per configured back-end address.
pub struct PromPool {
    clients: Mutex<HashMap<String, PromClient>>,
}

impl PromPool {
    /// Build clients for every distinct back-end address the
    /// configuration references.
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let mut addrs = HashSet::new();
        for conn in &cfg.global_level.connections {
            addrs.insert(conn.prometheus_url.as_str());
        }
        for cluster in &cfg.cluster_level {
            for conn in &cluster.connections {
                addrs.insert(conn.prometheus_url.as_str());
            }
            for notice in &cluster.node_notices {
                addrs.insert(notice.prometheus_url.as_str());
            }
        }
        addrs.remove("");

        let mut clients = HashMap::with_capacity(addrs.len());
        for addr in addrs {
            clients.insert(addr.to_string(), PromClient::new(addr)?);
        }
        Ok(Self { clients: Mutex::new(clients) })
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().unwrap().is_empty()
    }

    pub fn stop(&self) {}
}

impl MetricQuerier for PromPool {
    fn query<'a>(
        &'a self,
        addr: &'a str,
        query: &'a str,
        ts: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vector, Error>> + Send + 'a>> {
        Box::pin(async move {
            let client = {
                let clients = self.clients.lock().unwrap();
                match clients.get(addr) {
                    Some(client) => client.clone(),
                    None => bail!("no client for unknown back-end address '{}'", addr),
                }
            };
            client.instant_query(query, ts).await
        })
    }
}

#[derive(Clone)]
struct PromClient {
    addr: String,
    client: Client<HttpConnector, Body>,
}

impl PromClient {
    fn new(addr: &str) -> Result<Self, Error> {
        addr.parse::<Uri>()
            .map_err(|err| format_err!("invalid back-end address '{}': {}", addr, err))?;
        Ok(Self { addr: addr.trim_end_matches('/').to_string(), client: Client::new() })
    }

    async fn instant_query(&self, query: &str, ts: i64) -> Result<Vector, Error> {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let uri: Uri = format!("{}/api/v1/query?query={}&time={}", self.addr, encoded, ts)
            .parse()
            .map_err(|err| format_err!("unable to build query url for {}: {}", self.addr, err))?;

        let response = self
            .client
            .get(uri)
            .await
            .map_err(|err| format_err!("query to {} failed: {}", self.addr, err))?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        if !status.is_success() {
            bail!("back-end {} returned status {}", self.addr, status);
        }
        parse_query_response(&body)
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<InstantResult>,
}

#[derive(Deserialize)]
struct InstantResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

fn parse_query_response(body: &[u8]) -> Result<Vector, Error> {
    let response: QueryResponse = serde_json::from_slice(body)
        .map_err(|err| format_err!("unable to decode query response: {}", err))?;
    if response.status != "success" {
        bail!(
            "query failed: {}",
            response.error.clone().unwrap_or_else(|| response.status)
        );
    }
    let data = match response.data {
        Some(data) => data,
        None => bail!("query response carries no data"),
    };
    if data.result_type != "vector" {
        log::info!("ignoring non-vector query result of type '{}'", data.result_type);
        return Ok(Vector::new());
    }

    let mut vector = Vector::with_capacity(data.result.len());
    for entry in data.result {
        let value: f64 = entry
            .value
            .1
            .parse()
            .map_err(|err| format_err!("unable to parse sample value '{}': {}", entry.value.1, err))?;
        vector.push(Sample { metric: entry.metric, value });
    }
    Ok(vector)
}
