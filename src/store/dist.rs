// Cluster-wide view of the partitioned graph.
//
// Edge and attribute lookups try the local shard first and then probe the
// peers, standing in for one-sided remote reads. Index scans never leave
// the local shard; their cluster-wide coverage comes from the proxy fanning
// an index query out to every engine.

use crate::query::{AttrValue, Direction, GraphId};
use crate::store::ShardStore;
use std::sync::Arc;

/// One server's handle on the whole partitioned graph.
pub struct DistGraph {
    sid: usize,
    shards: Vec<Arc<ShardStore>>,
}

impl DistGraph {
    pub fn new(sid: usize, shards: Vec<Arc<ShardStore>>) -> Self {
        debug_assert!(sid < shards.len());
        Self { sid, shards }
    }

    /// The local shard.
    pub fn local(&self) -> &Arc<ShardStore> {
        &self.shards[self.sid]
    }

    /// Edges of `(vertex, direction, predicate)`, local or remote. The `tid`
    /// parameter names the per-worker read context of the substrate; the
    /// in-process store returns owned runs, so it is unused here.
    pub fn get_edges(
        &self,
        _tid: usize,
        vertex: GraphId,
        d: Direction,
        predicate: GraphId,
    ) -> Vec<GraphId> {
        if self.shards[self.sid].has_edges(vertex, d, predicate) {
            return self.shards[self.sid].get_edges(vertex, d, predicate);
        }
        for (sid, shard) in self.shards.iter().enumerate() {
            if sid != self.sid && shard.has_edges(vertex, d, predicate) {
                return shard.get_edges(vertex, d, predicate);
            }
        }
        Vec::new()
    }

    /// Index entries for a type or predicate class, local shard only.
    pub fn get_index_edges_local(&self, _tid: usize, class: GraphId, d: Direction) -> Vec<GraphId> {
        self.shards[self.sid].index_targets(class, d)
    }

    /// Attribute value of a vertex, local or remote.
    pub fn get_vertex_attr(
        &self,
        _tid: usize,
        vertex: GraphId,
        _d: Direction,
        attr_id: GraphId,
    ) -> Option<AttrValue> {
        if self.shards[self.sid].has_attr(vertex, attr_id) {
            return self.shards[self.sid].get_attr(vertex, attr_id);
        }
        for (sid, shard) in self.shards.iter().enumerate() {
            if sid != self.sid {
                if let Some(v) = shard.get_attr(vertex, attr_id) {
                    return Some(v);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWS: GraphId = 10;

    fn two_shards() -> Vec<Arc<ShardStore>> {
        let shard0 = Arc::new(ShardStore::new(0, 2));
        let shard1 = Arc::new(ShardStore::new(1, 2));
        shard0.insert_triple(1, KNOWS, 2);
        shard1.insert_triple(2, KNOWS, 4);
        shard1.insert_attr(2, 30, AttrValue::Int(9));
        vec![shard0, shard1]
    }

    #[test]
    fn test_remote_edge_read() {
        let graph = DistGraph::new(0, two_shards());
        assert_eq!(graph.get_edges(0, 2, Direction::Out, KNOWS), vec![4]);
        assert_eq!(graph.get_edges(0, 1, Direction::Out, KNOWS), vec![2]);
        assert!(graph.get_edges(0, 9, Direction::Out, KNOWS).is_empty());
    }

    #[test]
    fn test_index_scan_stays_local() {
        let graph = DistGraph::new(0, two_shards());
        // shard 0 indexes subject 1 under `knows`; shard 1's subject 2 is invisible
        assert_eq!(
            graph.get_index_edges_local(0, KNOWS, Direction::In),
            vec![1]
        );
    }

    #[test]
    fn test_remote_attr_read() {
        let graph = DistGraph::new(0, two_shards());
        assert_eq!(
            graph.get_vertex_attr(0, 2, Direction::Out, 30),
            Some(AttrValue::Int(9))
        );
        assert_eq!(graph.get_vertex_attr(0, 1, Direction::Out, 30), None);
    }
}
