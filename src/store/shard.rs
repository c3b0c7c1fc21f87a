// One server's shard of the triple store.
//
// Adjacency lists are kept per (vertex, direction, predicate); the type and
// predicate indexes list shard-local members only. The store is read-only
// during query execution; bulk load takes the write lock between queries.

use crate::error::{MeshError, Result};
use crate::query::{AttrValue, Direction, GraphId, TYPE_ID};
use crate::store::hash_mod;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Default)]
struct ShardInner {
    /// Adjacency lists in edge-store order.
    edges: HashMap<(GraphId, Direction, GraphId), Vec<GraphId>>,
    /// Shard-local index entries: `(class_id, direction)` to members.
    index: HashMap<(GraphId, Direction), Vec<GraphId>>,
    /// Membership filter keeping index lists duplicate-free.
    index_seen: HashSet<(GraphId, Direction, GraphId)>,
    /// Vertex attributes under non-negative attribute predicates.
    attrs: HashMap<(GraphId, GraphId), AttrValue>,
    /// Triples seen by this shard, for duplicate detection on load.
    triples: HashSet<(GraphId, GraphId, GraphId)>,
}

impl ShardInner {
    fn index_push(&mut self, class: GraphId, d: Direction, member: GraphId) {
        if self.index_seen.insert((class, d, member)) {
            self.index.entry((class, d)).or_default().push(member);
        }
    }

    fn insert_out_half(&mut self, s: GraphId, p: GraphId, o: GraphId) {
        self.edges.entry((s, Direction::Out, p)).or_default().push(o);
        if p == TYPE_ID {
            // the type index lists local instances of class `o`
            self.index_push(o, Direction::In, s);
        } else {
            self.index_push(p, Direction::In, s);
        }
    }

    fn insert_in_half(&mut self, s: GraphId, p: GraphId, o: GraphId) {
        self.edges.entry((o, Direction::In, p)).or_default().push(s);
        if p != TYPE_ID {
            self.index_push(p, Direction::Out, o);
        }
    }
}

/// In-memory shard store implementing the graph primitives of the core.
pub struct ShardStore {
    sid: usize,
    num_servers: usize,
    inner: RwLock<ShardInner>,
}

impl ShardStore {
    pub fn new(sid: usize, num_servers: usize) -> Self {
        Self {
            sid,
            num_servers,
            inner: RwLock::new(ShardInner::default()),
        }
    }

    pub fn sid(&self) -> usize {
        self.sid
    }

    /// Whether hash placement assigns `vertex` to this shard.
    pub fn owns(&self, vertex: GraphId) -> bool {
        hash_mod(vertex, self.num_servers) == self.sid
    }

    /// Insert a triple wholly into this shard (both traversal directions).
    /// Test seeds and single-node stores use this; partitioned loading goes
    /// through [`ShardStore::bulk_load`].
    pub fn insert_triple(&self, s: GraphId, p: GraphId, o: GraphId) {
        let mut inner = self.inner.write();
        inner.triples.insert((s, p, o));
        inner.insert_out_half(s, p, o);
        inner.insert_in_half(s, p, o);
    }

    /// Attach an attribute value to a local vertex.
    pub fn insert_attr(&self, vertex: GraphId, attr_id: GraphId, value: AttrValue) {
        self.inner.write().attrs.insert((vertex, attr_id), value);
    }

    /// Edges of `(vertex, direction, predicate)` in edge-store order.
    pub fn get_edges(&self, vertex: GraphId, d: Direction, predicate: GraphId) -> Vec<GraphId> {
        self.inner
            .read()
            .edges
            .get(&(vertex, d, predicate))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether this shard holds any run for `(vertex, direction, predicate)`.
    pub fn has_edges(&self, vertex: GraphId, d: Direction, predicate: GraphId) -> bool {
        self.inner.read().edges.contains_key(&(vertex, d, predicate))
    }

    /// Shard-local index entries for a type or predicate class.
    pub fn index_targets(&self, class: GraphId, d: Direction) -> Vec<GraphId> {
        self.inner
            .read()
            .index
            .get(&(class, d))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_attr(&self, vertex: GraphId, attr_id: GraphId) -> Option<AttrValue> {
        self.inner.read().attrs.get(&(vertex, attr_id)).cloned()
    }

    pub fn has_attr(&self, vertex: GraphId, attr_id: GraphId) -> bool {
        self.inner.read().attrs.contains_key(&(vertex, attr_id))
    }

    /// Number of triples this shard has recorded.
    pub fn triple_count(&self) -> usize {
        self.inner.read().triples.len()
    }

    /// Load a whitespace-separated integer triple file, keeping only the
    /// halves this shard owns. Returns the number of triples that
    /// contributed at least one half.
    pub fn bulk_load(&self, path: &Path, check_dup: bool) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        let mut loaded = 0usize;
        let mut inner = self.inner.write();

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (s, p, o) = match (fields.next(), fields.next(), fields.next()) {
                (Some(s), Some(p), Some(o)) => {
                    let parse = |f: &str| {
                        f.parse::<GraphId>().map_err(|_| {
                            MeshError::Storage(format!(
                                "{}:{}: malformed triple field {:?}",
                                path.display(),
                                lineno + 1,
                                f
                            ))
                        })
                    };
                    (parse(s)?, parse(p)?, parse(o)?)
                }
                _ => {
                    return Err(MeshError::Storage(format!(
                        "{}:{}: expected three fields",
                        path.display(),
                        lineno + 1
                    )))
                }
            };

            let owns_s = hash_mod(s, self.num_servers) == self.sid;
            let owns_o = hash_mod(o, self.num_servers) == self.sid;
            if !owns_s && !owns_o {
                continue;
            }
            if check_dup && inner.triples.contains(&(s, p, o)) {
                continue;
            }
            inner.triples.insert((s, p, o));
            if owns_s {
                inner.insert_out_half(s, p, o);
            }
            if owns_o {
                inner.insert_in_half(s, p, o);
            }
            loaded += 1;
        }

        Ok(loaded)
    }
}
