//! YAML configuration for the graph generator.
//!
//! The document names the graph, the node classes and two query levels:
//! a global level whose connection queries draw cluster-to-cluster
//! traffic, and a cluster level with service-to-service connection
//! queries plus per-service notice queries.

use std::fs;

use anyhow::{format_err, Error};
use regex::Regex;
use serde::{Deserialize, Deserializer};

pub const DEFAULT_GRAPH_NAME: &str = "topoviz";
pub const DEFAULT_CLASS_NAME: &str = "default";
pub const DEFAULT_CLASS_COLOR: &str = "rgb(186, 213, 237)";

pub fn load_file(path: &str) -> Result<Config, Error> {
    let content = fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read configuration file {} - {}", path, err))?;
    let cfg: Config = serde_yaml::from_str(&content)
        .map_err(|err| format_err!("unable to parse configuration file {} - {}", path, err))?;
    Ok(cfg)
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "graphName", default = "default_graph_name")]
    pub graph_name: String,
    #[serde(rename = "globalLevel", default)]
    pub global_level: GlobalLevel,
    #[serde(rename = "clusterLevel", default)]
    pub cluster_level: Vec<Cluster>,
    #[serde(default)]
    pub classes: Vec<NodeClass>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct GlobalLevel {
    #[serde(rename = "maxVolume", default)]
    pub max_volume: f64,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Cluster {
    pub cluster: String,
    #[serde(rename = "maxVolume", default)]
    pub max_volume: f64,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(rename = "nodeNotices", default)]
    pub node_notices: Vec<NodeNotice>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub query: String,
    #[serde(rename = "prometheusURL", default)]
    pub prometheus_url: String,
    #[serde(default)]
    pub source: NodeMapping,
    #[serde(default)]
    pub target: NodeMapping,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub notices: Vec<ConnectionNotice>,
}

impl Connection {
    /// Link into the back-end's expression browser, used when a notice
    /// template does not set one.
    pub fn query_link(&self) -> String {
        graph_link(&self.prometheus_url, &self.query)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeClass {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Status {
    pub label: String,
    #[serde(rename = "warningRegex", default)]
    pub warning_regex: Option<Regexp>,
    #[serde(rename = "dangerRegex", default)]
    pub danger_regex: Option<Regexp>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SeverityThreshold {
    #[serde(default)]
    pub info: f64,
    #[serde(default)]
    pub warning: f64,
    #[serde(default)]
    pub error: f64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionNotice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub link: String,
    #[serde(rename = "statusType", default)]
    pub status_type: String,
    #[serde(rename = "severityThreshold", default)]
    pub severity_threshold: SeverityThreshold,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeNotice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub query: String,
    #[serde(rename = "prometheusURL", default)]
    pub prometheus_url: String,
    #[serde(default)]
    pub service: NodeMapping,
    #[serde(rename = "severityThreshold", default)]
    pub severity_threshold: SeverityThreshold,
}

impl NodeNotice {
    pub fn query_link(&self) -> String {
        graph_link(&self.prometheus_url, &self.query)
    }
}

/// Rule extracting a node identity from one metric sample.
///
/// An empty `label` short-circuits to the literal `replacement`;
/// otherwise the regex runs over the label value and the replacement
/// template is expanded over its capture groups.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeMapping {
    pub label: String,
    pub regex: Regexp,
    pub replacement: String,
    pub class: String,
}

impl Default for NodeMapping {
    fn default() -> Self {
        Self {
            label: String::new(),
            regex: Regexp::new("(.*)").expect("static pattern compiles"),
            replacement: "$1".to_string(),
            class: DEFAULT_CLASS_NAME.to_string(),
        }
    }
}

impl<'de> Deserialize<'de> for NodeMapping {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            label: String,
            #[serde(default)]
            regex: Option<Regexp>,
            #[serde(default)]
            replacement: Option<String>,
            #[serde(default)]
            class: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let defaults = NodeMapping::default();
        let mapping = NodeMapping {
            label: raw.label,
            regex: raw.regex.unwrap_or(defaults.regex),
            replacement: raw.replacement.unwrap_or(defaults.replacement),
            class: raw.class.unwrap_or(defaults.class),
        };
        if mapping.label.is_empty() && mapping.replacement.is_empty() {
            return Err(serde::de::Error::custom(
                "invalid node mapping: needs a label or a replacement",
            ));
        }
        Ok(mapping)
    }
}

/// A compiled regex that remembers its source pattern.
#[derive(Clone, Debug)]
pub struct Regexp {
    pub regex: Regex,
    pub original: String,
}

impl Regexp {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let regex = Regex::new(pattern)
            .map_err(|err| format_err!("invalid regex '{}': {}", pattern, err))?;
        Ok(Self { regex, original: pattern.to_string() })
    }
}

impl PartialEq for Regexp {
    fn eq(&self, other: &Self) -> bool {
        self.original == other.original
    }
}

impl<'de> Deserialize<'de> for Regexp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pattern = String::deserialize(deserializer)?;
        Regexp::new(&pattern).map_err(serde::de::Error::custom)
    }
}

fn default_graph_name() -> String {
    DEFAULT_GRAPH_NAME.to_string()
}

fn graph_link(prometheus_url: &str, query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("{}/graph?g0.expr={}&g0.tab=0", prometheus_url.trim_end_matches('/'), encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
graphName: example
globalLevel:
  maxVolume: 10000
  connections:
    - name: cluster-traffic
      query: sum by(src,dst,status)(rate(requests_total[1m]))
      prometheusURL: http://prometheus:9090
      source:
        label: src
      target:
        label: dst
        class: external
      status:
        label: status
        dangerRegex: ^5..$
        warningRegex: ^4..$
      notices:
        - name: error-rate
          title: "error rate {{value}}"
          statusType: danger
          severityThreshold:
            warning: 0.1
            error: 0.5
clusterLevel:
  - cluster: cluster-a
    maxVolume: 1000
    connections:
      - name: service-traffic
        query: sum by(source,target)(rate(calls_total[1m]))
        prometheusURL: http://prometheus:9090
        source:
          label: source
        target:
          label: target
    nodeNotices:
      - name: cpu
        title: "cpu {{value}}"
        query: max by(service)(cpu_usage)
        prometheusURL: http://prometheus:9090
        service:
          label: service
        severityThreshold:
          warning: 0.8
classes:
  - name: default
    color: rgb(186, 213, 237)
  - name: external
    color: rgb(255, 53, 53)
"#;

    #[test]
    fn parses_full_document() {
        let cfg: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.graph_name, "example");
        assert_eq!(cfg.global_level.max_volume, 10000.0);
        assert_eq!(cfg.global_level.connections.len(), 1);

        let conn = &cfg.global_level.connections[0];
        assert_eq!(conn.source.label, "src");
        assert_eq!(conn.source.replacement, "$1");
        assert_eq!(conn.source.regex.original, "(.*)");
        assert_eq!(conn.target.class, "external");

        let status = conn.status.as_ref().unwrap();
        assert_eq!(status.label, "status");
        assert!(status.danger_regex.as_ref().unwrap().regex.is_match("503"));
        assert!(!status.danger_regex.as_ref().unwrap().regex.is_match("404"));

        let notice = &conn.notices[0];
        assert_eq!(notice.status_type, "danger");
        assert_eq!(notice.severity_threshold.warning, 0.1);
        assert_eq!(notice.severity_threshold.error, 0.5);
        assert_eq!(notice.severity_threshold.info, 0.0);

        assert_eq!(cfg.cluster_level.len(), 1);
        assert_eq!(cfg.cluster_level[0].cluster, "cluster-a");
        assert_eq!(cfg.cluster_level[0].node_notices[0].service.label, "service");
        assert_eq!(cfg.classes.len(), 2);
    }

    #[test]
    fn graph_name_defaults() {
        let cfg: Config = serde_yaml::from_str("classes: []").unwrap();
        assert_eq!(cfg.graph_name, DEFAULT_GRAPH_NAME);
    }

    #[test]
    fn node_mapping_without_label_and_replacement_is_rejected() {
        let doc = r#"
globalLevel:
  connections:
    - name: broken
      source:
        replacement: ""
"#;
        let err = serde_yaml::from_str::<Config>(doc).unwrap_err();
        assert!(err.to_string().contains("invalid node mapping"));
    }

    #[test]
    fn node_mapping_literal_replacement() {
        let doc = "label: ''\nreplacement: internet";
        let mapping: NodeMapping = serde_yaml::from_str(doc).unwrap();
        assert_eq!(mapping.label, "");
        assert_eq!(mapping.replacement, "internet");
        assert_eq!(mapping.class, DEFAULT_CLASS_NAME);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = serde_yaml::from_str::<NodeMapping>("label: a\nregex: '('").unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn query_link_escapes_the_expression() {
        let conn = Connection {
            name: String::new(),
            query: "sum by(code) (rate(x[1m]))".to_string(),
            prometheus_url: "http://prometheus:9090/".to_string(),
            source: NodeMapping::default(),
            target: NodeMapping::default(),
            status: None,
            notices: Vec::new(),
        };
        assert_eq!(
            conn.query_link(),
            "http://prometheus:9090/graph?g0.expr=sum+by%28code%29+%28rate%28x%5B1m%5D%29%29&g0.tab=0"
        );
    }
}
