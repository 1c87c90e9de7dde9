use serde::{Deserialize, Serialize};

/// One timestamped rendering of the topology graph.
///
/// The graph is serialized exactly once, when the snapshot is generated;
/// readers hand the bytes out without re-encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: i64,
    #[serde(rename = "graphJSON")]
    pub graph_json: String,
}

impl Snapshot {
    pub fn new(timestamp: i64, graph_json: String) -> Self {
        Self { timestamp, graph_json }
    }
}
