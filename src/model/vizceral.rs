//! The Vizceral JSON dialect.
//!
//! Field names and optionality follow the wire shape consumed by the
//! Vizceral renderer; absent optional fields are dropped from the
//! output entirely.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VizceralGraph {
    pub renderer: String,
    pub name: String,
    #[serde(rename = "maxVolume", default, skip_serializing_if = "is_zero")]
    pub max_volume: f64,
    #[serde(rename = "serverUpdateTime")]
    pub server_update_time: i64,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    pub classes: Vec<Class>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub renderer: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub updated: i64,
    #[serde(rename = "maxVolume", default, skip_serializing_if = "is_zero")]
    pub max_volume: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<Node>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<Notice>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<Notice>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub streaming: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subtitle: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub severity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub danger: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub warning: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub normal: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
}

/// The flat result of one query fan-out level, before nesting.
#[derive(Clone, Debug, Default)]
pub struct NodeConnectionSet {
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_serializes_to_wire_shape() {
        let graph = VizceralGraph {
            renderer: "global".to_string(),
            name: "example".to_string(),
            max_volume: 1000.0,
            server_update_time: 1000,
            nodes: vec![Node {
                name: "cluster-a".to_string(),
                renderer: "region".to_string(),
                metadata: Some(Metadata { streaming: 1 }),
                ..Default::default()
            }],
            connections: vec![Connection {
                source: "cluster-a".to_string(),
                target: "cluster-b".to_string(),
                metrics: Some(Metrics { normal: 10.0, danger: 1.0, warning: 0.0 }),
                ..Default::default()
            }],
            classes: vec![Class { name: "default".to_string(), color: "rgb(186, 213, 237)".to_string() }],
        };

        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value["renderer"], "global");
        assert_eq!(value["maxVolume"], 1000.0);
        assert_eq!(value["serverUpdateTime"], 1000);
        assert_eq!(value["nodes"][0]["renderer"], "region");
        assert_eq!(value["nodes"][0]["metadata"]["streaming"], 1);
        // empty child collections are dropped from the wire format
        assert!(value["nodes"][0].get("nodes").is_none());
        assert!(value["nodes"][0].get("notices").is_none());
        let metrics = &value["connections"][0]["metrics"];
        assert_eq!(metrics["normal"], 10.0);
        assert_eq!(metrics["danger"], 1.0);
        assert!(metrics.get("warning").is_none());
    }

    #[test]
    fn optional_fields_round_trip() {
        let node = Node {
            name: "svc".to_string(),
            class: "danger".to_string(),
            notices: vec![Notice {
                title: "high error rate".to_string(),
                severity: 2,
                ..Default::default()
            }],
            ..Default::default()
        };
        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&encoded).unwrap();
        assert_eq!(node, decoded);
    }
}
