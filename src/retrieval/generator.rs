//! Turns one round of query results into a Vizceral snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Error};
use futures::future::{self, BoxFuture, FutureExt};
use handlebars::Handlebars;
use serde_json::json;

use crate::config::{
    Config, Connection as ConnectionQuery, NodeMapping, NodeNotice, SeverityThreshold,
    DEFAULT_CLASS_COLOR, DEFAULT_CLASS_NAME,
};
use crate::model::{
    Class, Connection, Metadata, Metrics, Node, NodeConnectionSet, Notice, Snapshot, VizceralGraph,
};
use crate::retrieval::promquery::{MetricQuerier, Sample, Vector};

pub(super) struct Generator<'a> {
    cfg: &'a Config,
    querier: &'a dyn MetricQuerier,
    templates: Handlebars<'a>,
}

impl<'a> Generator<'a> {
    pub fn new(cfg: &'a Config, querier: &'a dyn MetricQuerier) -> Self {
        Self { cfg, querier, templates: Handlebars::new() }
    }

    /// Fan out all configured queries and assemble the graph.
    ///
    /// The fan-out runs one task per connection query plus one per
    /// cluster; the first connection-query error cancels its in-flight
    /// siblings. Whatever arrived is still assembled into a graph -
    /// a failed query must not blank the whole topology.
    pub async fn generate_snapshot(&self, ts: i64) -> Result<Snapshot, Error> {
        let global_set: Mutex<Option<NodeConnectionSet>> = Mutex::new(None);
        let service_sets: Mutex<HashMap<String, NodeConnectionSet>> = Mutex::new(HashMap::new());

        let mut tasks: Vec<BoxFuture<'_, Result<(), Error>>> =
            Vec::with_capacity(self.cfg.cluster_level.len() + 1);
        tasks.push(
            async {
                let set = self
                    .node_connection_set(&self.cfg.global_level.connections, &[], ts, cluster_node)
                    .await?;
                *global_set.lock().unwrap() = Some(set);
                Ok(())
            }
            .boxed(),
        );
        for cluster in &self.cfg.cluster_level {
            let service_sets = &service_sets;
            tasks.push(
                async move {
                    let set = self
                        .node_connection_set(
                            &cluster.connections,
                            &cluster.node_notices,
                            ts,
                            service_node,
                        )
                        .await?;
                    service_sets.lock().unwrap().insert(cluster.cluster.clone(), set);
                    Ok(())
                }
                .boxed(),
            );
        }
        if let Err(err) = future::try_join_all(tasks).await {
            log::error!("graph fan-out finished early, assembling a partial graph: {}", err);
        }

        let global = global_set.into_inner().unwrap().unwrap_or_default();
        let mut services = service_sets.into_inner().unwrap();

        let mut classes: Vec<Class> = Vec::with_capacity(self.cfg.classes.len() + 1);
        let mut has_default = false;
        for class in &self.cfg.classes {
            if class.name == DEFAULT_CLASS_NAME {
                has_default = true;
            }
            classes.push(Class { name: class.name.clone(), color: class.color.clone() });
        }
        if !has_default {
            classes.push(Class {
                name: DEFAULT_CLASS_NAME.to_string(),
                color: DEFAULT_CLASS_COLOR.to_string(),
            });
        }

        let mut nodes = global.nodes;
        let connections = global.connections;
        for node in &mut nodes {
            if let Some(set) = services.remove(&node.name) {
                node.nodes = set.nodes;
                node.connections = set.connections;
                node.max_volume = self
                    .cfg
                    .cluster_level
                    .iter()
                    .find(|c| c.cluster == node.name)
                    .map(|c| c.max_volume)
                    .unwrap_or(0.0);
            }
        }

        let graph = VizceralGraph {
            renderer: "global".to_string(),
            name: self.cfg.graph_name.clone(),
            max_volume: self.cfg.global_level.max_volume,
            server_update_time: ts,
            nodes,
            connections,
            classes,
        };
        let graph_json = serde_json::to_string(&graph)?;
        Ok(Snapshot::new(ts, graph_json))
    }

    /// Evaluate one level of connection and notice queries
    /// concurrently and merge the results into nodes plus connections.
    async fn node_connection_set(
        &self,
        conns: &[ConnectionQuery],
        notices: &[NodeNotice],
        ts: i64,
        node_factory: fn(&str) -> Node,
    ) -> Result<NodeConnectionSet, Error> {
        let conn_slots: Vec<Mutex<Option<Vec<Connection>>>> =
            conns.iter().map(|_| Mutex::new(None)).collect();
        let notice_slots: Vec<Mutex<Option<HashMap<String, Vec<Notice>>>>> =
            notices.iter().map(|_| Mutex::new(None)).collect();

        let mut tasks: Vec<BoxFuture<'_, Result<(), Error>>> =
            Vec::with_capacity(conns.len() + notices.len());
        for (i, conn) in conns.iter().enumerate() {
            let slot = &conn_slots[i];
            tasks.push(
                async move {
                    let vector = self
                        .querier
                        .query(&conn.prometheus_url, &conn.query, ts)
                        .await
                        .map_err(|err| {
                            log::error!(
                                "connection query '{}' against {} failed: {}",
                                conn.name,
                                conn.prometheus_url,
                                err
                            );
                            err
                        })?;
                    *slot.lock().unwrap() = Some(self.connections_from_vector(&vector, conn));
                    Ok(())
                }
                .boxed(),
            );
        }
        for (i, notice) in notices.iter().enumerate() {
            let slot = &notice_slots[i];
            tasks.push(
                async move {
                    // a failed notice query must not drop the graph
                    match self.querier.query(&notice.prometheus_url, &notice.query, ts).await {
                        Ok(vector) => {
                            *slot.lock().unwrap() =
                                Some(self.node_notices_from_vector(&vector, notice));
                        }
                        Err(err) => log::error!(
                            "notice query '{}' against {} failed: {}",
                            notice.name,
                            notice.prometheus_url,
                            err
                        ),
                    }
                    Ok(())
                }
                .boxed(),
            );
        }
        if let Err(err) = future::try_join_all(tasks).await {
            log::error!("query fan-out aborted early: {}", err);
        }

        let mut node_map: HashMap<String, Node> = HashMap::new();
        for (i, conn) in conns.iter().enumerate() {
            let slot = conn_slots[i].lock().unwrap();
            let list = match slot.as_ref() {
                Some(list) => list,
                None => continue,
            };
            for c in list {
                let pairs = [
                    (c.source.as_str(), conn.source.class.as_str()),
                    (c.target.as_str(), conn.target.class.as_str()),
                ];
                for (name, class) in pairs {
                    let node = node_map
                        .entry(name.to_string())
                        .or_insert_with(|| node_factory(name));
                    if !class.is_empty()
                        && (node.class.is_empty() || node.class == DEFAULT_CLASS_NAME)
                    {
                        node.class = class.to_string();
                    }
                }
            }
        }
        for slot in &notice_slots {
            let slot = slot.lock().unwrap();
            if let Some(map) = slot.as_ref() {
                for (name, notices) in map {
                    if let Some(node) = node_map.get_mut(name) {
                        node.notices.extend(notices.iter().cloned());
                    }
                }
            }
        }

        let nodes = node_map.into_iter().map(|(_, node)| node).collect();
        let connections = conn_slots
            .into_iter()
            .filter_map(|slot| slot.into_inner().unwrap())
            .flatten()
            .collect();
        Ok(NodeConnectionSet { nodes, connections })
    }

    /// Bucket the sample vector by (source, target) and build one
    /// connection per pair, including its templated notices.
    fn connections_from_vector(&self, vector: &Vector, conn: &ConnectionQuery) -> Vec<Connection> {
        struct Bucket {
            source: String,
            target: String,
            all: f64,
            normal: f64,
            danger: f64,
            warning: f64,
        }

        let mut buckets: HashMap<String, Bucket> = HashMap::new();
        for sample in vector {
            let source = match extract_node_name(sample, &conn.source) {
                Ok(source) => source,
                Err(err) => {
                    log::warn!("could not determine source node for query '{}': {}", conn.name, err);
                    continue;
                }
            };
            let target = match extract_node_name(sample, &conn.target) {
                Ok(target) => target,
                Err(err) => {
                    log::warn!("could not determine target node for query '{}': {}", conn.name, err);
                    continue;
                }
            };

            let key = format!("{}/{}", source, target);
            let bucket = buckets.entry(key).or_insert_with(|| Bucket {
                source,
                target,
                all: 0.0,
                normal: 0.0,
                danger: 0.0,
                warning: 0.0,
            });

            bucket.all += sample.value;
            let mut matched = false;
            if let Some(status) = &conn.status {
                match sample.metric.get(&status.label) {
                    Some(value) => {
                        if let Some(re) = &status.danger_regex {
                            if re.regex.is_match(value) {
                                bucket.danger += sample.value;
                                matched = true;
                            }
                        }
                        if !matched {
                            if let Some(re) = &status.warning_regex {
                                if re.regex.is_match(value) {
                                    bucket.warning += sample.value;
                                    matched = true;
                                }
                            }
                        }
                    }
                    None => log::warn!(
                        "status label '{}' missing on a sample of query '{}'",
                        status.label,
                        conn.name
                    ),
                }
            }
            if !matched {
                bucket.normal += sample.value;
            }
        }

        let mut connections = Vec::with_capacity(buckets.len());
        for bucket in buckets.into_iter().map(|(_, b)| b) {
            let mut notices = Vec::new();
            for template in &conn.notices {
                let rate = match template.status_type.as_str() {
                    "danger" => bucket.danger / bucket.all,
                    "warning" => bucket.warning / bucket.all,
                    _ => 0.0,
                };
                let severity = severity_for(&template.severity_threshold, rate);
                if severity < 0 {
                    continue;
                }
                let title =
                    self.render_title(&template.title, &json!({ "value": format_value(rate) }));
                let link = if template.link.is_empty() {
                    conn.query_link()
                } else {
                    template.link.clone()
                };
                notices.push(Notice {
                    title,
                    subtitle: template.subtitle.clone(),
                    link,
                    severity,
                });
            }

            connections.push(Connection {
                source: bucket.source,
                target: bucket.target,
                class: String::new(),
                metadata: Some(Metadata { streaming: 1 }),
                metrics: Some(Metrics {
                    normal: bucket.normal,
                    danger: bucket.danger,
                    warning: bucket.warning,
                }),
                notices,
            });
        }
        connections
    }

    /// Map node names to the notices their sample values earn.
    fn node_notices_from_vector(
        &self,
        vector: &Vector,
        notice: &NodeNotice,
    ) -> HashMap<String, Vec<Notice>> {
        let mut notices: HashMap<String, Vec<Notice>> = HashMap::new();
        for sample in vector {
            let node = match extract_node_name(sample, &notice.service) {
                Ok(node) => node,
                Err(err) => {
                    log::warn!("could not determine node for notice '{}': {}", notice.name, err);
                    continue;
                }
            };

            let severity = severity_for(&notice.severity_threshold, sample.value);
            if severity < 0 {
                continue;
            }

            let mut context = serde_json::Map::with_capacity(sample.metric.len() + 1);
            for (label, value) in &sample.metric {
                context.insert(label.clone(), serde_json::Value::from(value.clone()));
            }
            context.insert("value".to_string(), serde_json::Value::from(format_value(sample.value)));
            let title = self.render_title(&notice.title, &serde_json::Value::Object(context));
            let link = if notice.link.is_empty() {
                notice.query_link()
            } else {
                notice.link.clone()
            };

            notices.entry(node).or_insert_with(Vec::new).push(Notice {
                title,
                subtitle: notice.subtitle.clone(),
                link,
                severity,
            });
        }
        notices
    }

    fn render_title(&self, template: &str, context: &serde_json::Value) -> String {
        match self.templates.render_template(template, context) {
            Ok(title) => title,
            Err(err) => {
                log::error!("failed to render notice title '{}': {}", template, err);
                template.to_string()
            }
        }
    }
}

/// Extract a node identity from one sample via the mapping rule.
fn extract_node_name(sample: &Sample, mapping: &NodeMapping) -> Result<String, Error> {
    if mapping.label.is_empty() {
        return Ok(mapping.replacement.clone());
    }
    let value = match sample.metric.get(&mapping.label) {
        Some(value) => value,
        None => bail!("label '{}' not found", mapping.label),
    };
    if value.is_empty() {
        bail!("label '{}' has an empty value", mapping.label);
    }
    match mapping.regex.regex.captures(value) {
        Some(caps) => {
            let mut name = String::new();
            caps.expand(&mapping.replacement, &mut name);
            Ok(name)
        }
        None => Ok(expand_without_captures(&mapping.replacement)),
    }
}

/// Expand a replacement template with no match at hand: group
/// references (`$1`, `${name}`) come out empty, literal text and `$$`
/// escapes are kept.
fn expand_without_captures(replacement: &str) -> String {
    let mut expanded = String::with_capacity(replacement.len());
    let mut rest = replacement;
    while let Some(pos) = rest.find('$') {
        expanded.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];
        if let Some(tail) = rest.strip_prefix('$') {
            expanded.push('$');
            rest = tail;
        } else if rest.starts_with('{') {
            match rest.find('}') {
                Some(end) => rest = &rest[end + 1..],
                None => {
                    // unterminated brace group, keep the dollar literal
                    expanded.push('$');
                }
            }
        } else {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or_else(|| rest.len());
            if end == 0 {
                // a dollar not followed by a reference stays literal
                expanded.push('$');
            }
            rest = &rest[end..];
        }
    }
    expanded.push_str(rest);
    expanded
}

/// Highest crossed severity threshold; -1 when none is crossed.
fn severity_for(threshold: &SeverityThreshold, value: f64) -> i64 {
    if threshold.error > 0.0 && value >= threshold.error {
        2
    } else if threshold.warning > 0.0 && value >= threshold.warning {
        1
    } else if threshold.info > 0.0 && value >= threshold.info {
        0
    } else {
        -1
    }
}

fn format_value(value: f64) -> String {
    format!("{:.5}", value)
}

fn cluster_node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        renderer: "region".to_string(),
        metadata: Some(Metadata { streaming: 1 }),
        ..Default::default()
    }
}

fn service_node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        renderer: "focusedChild".to_string(),
        metadata: Some(Metadata { streaming: 1 }),
        ..Default::default()
    }
}
