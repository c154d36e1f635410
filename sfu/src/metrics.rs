use std::fmt;

use crate::track::Purpose;

/// Sink for the lobby topology graph. Nodes are lobbies and endpoints, edges connect an
/// endpoint to its lobby. The hub reports every track change here; an implementation can
/// export the graph however it likes. Correctness of the lobby never depends on this sink.
pub trait MetricsGraph: Send + Sync + fmt::Debug {
    fn build_node(&self, node_id: &str, live_stream_id: &str, kind: &str);
    fn update_inc(&self, node_id: &str, purpose: Purpose);
    fn update_dec(&self, node_id: &str, purpose: Purpose);
    fn add_edge(&self, node_id: &str, live_stream_id: &str, kind: &str);
    fn delete_edge(&self, node_id: &str, live_stream_id: &str, kind: &str);
    fn delete_node(&self, node_id: &str);
}

/// Default sink that drops every observation.
#[derive(Debug, Default)]
pub struct NoopGraph;

impl MetricsGraph for NoopGraph {
    fn build_node(&self, _node_id: &str, _live_stream_id: &str, _kind: &str) {}

    fn update_inc(&self, _node_id: &str, _purpose: Purpose) {}

    fn update_dec(&self, _node_id: &str, _purpose: Purpose) {}

    fn add_edge(&self, _node_id: &str, _live_stream_id: &str, _kind: &str) {}

    fn delete_edge(&self, _node_id: &str, _live_stream_id: &str, _kind: &str) {}

    fn delete_node(&self, _node_id: &str) {}
}
