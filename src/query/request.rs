// The query structure exchanged between workers.
//
// A query travels as a request while its id field is self-referential
// (`id == pid`); the first engine to execute it assigns a fresh own id, so
// a finished query shipped back reads as a reply.

use crate::query::{
    GraphId, Order, Pattern, PatternGroup, ResultTable, NO_CORUN, NO_LOCAL_VAR, PREDICATE_ID,
    TYPE_ID,
};
use serde::{Deserialize, Serialize};

/// Wire-level tag of a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    UnsupportedPattern,
    UnsupportedFeature,
    InconsistentAttrType,
    Internal,
}

/// Outcome carried on every query; `Failed` replies have an empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    Ok,
    Failed(FailureKind),
}

impl QueryStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, QueryStatus::Ok)
    }
}

/// A SPARQL basic-graph-pattern query in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparqlQuery {
    /// Own id, assigned by the first executing engine; equals `pid` until then.
    pub id: i64,
    /// Id of the requestor (a proxy query id, or the parent of a sub-query).
    pub pid: i64,
    pub pattern_group: PatternGroup,
    /// Index of the next pattern to execute; `patterns.len()` means finished.
    pub step: usize,
    /// Start of the co-run probe sub-range, or [`NO_CORUN`].
    pub corun_step: usize,
    /// End of the co-run probe sub-range, or [`NO_CORUN`].
    pub fetch_step: usize,
    /// Variable whose hash partitioned the current rows, or [`NO_LOCAL_VAR`].
    pub local_var: GraphId,
    pub orders: Vec<Order>,
    /// Maximum solutions to return; negative means unlimited.
    pub limit: i64,
    pub offset: usize,
    pub distinct: bool,
    /// Suppress proxy-side result printing.
    pub silent: bool,
    /// Projection; empty keeps every bound variable.
    pub required_vars: Vec<GraphId>,
    pub result: ResultTable,
    pub status: QueryStatus,
}

impl SparqlQuery {
    pub fn new(pattern_group: PatternGroup) -> Self {
        Self {
            id: 0,
            pid: 0,
            pattern_group,
            step: 0,
            corun_step: NO_CORUN,
            fetch_step: NO_CORUN,
            local_var: NO_LOCAL_VAR,
            orders: Vec::new(),
            limit: -1,
            offset: 0,
            distinct: false,
            silent: false,
            required_vars: Vec::new(),
            result: ResultTable::new(),
            status: QueryStatus::Ok,
        }
    }

    /// Requests carry a self-referential id until an engine assigns one.
    pub fn is_request(&self) -> bool {
        self.id == self.pid
    }

    pub fn is_finished(&self) -> bool {
        self.step >= self.pattern_group.patterns.len()
    }

    pub fn pattern(&self, step: usize) -> Pattern {
        self.pattern_group.patterns[step]
    }

    pub fn current_pattern(&self) -> Pattern {
        self.pattern(self.step)
    }

    /// Whether execution begins with an index scan: a constant class id
    /// queried through the type or predicate index selector.
    pub fn starts_from_index(&self) -> bool {
        match self.pattern_group.patterns.first() {
            Some(p) => p.subject >= 0 && (p.predicate == TYPE_ID || p.predicate == PREDICATE_ID),
            None => false,
        }
    }
}

/// Bulk-load request shipped to every server; each loads its own partition.
#[cfg(feature = "dynamic-load")]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphLoad {
    pub id: i64,
    pub pid: i64,
    /// Path of a whitespace-separated integer triple file.
    pub path: String,
    /// Skip triples already present in the shard.
    pub check_dup: bool,
    /// Triples loaded, or negative on failure.
    pub ret: i64,
}

#[cfg(feature = "dynamic-load")]
impl GraphLoad {
    pub fn new(path: String, check_dup: bool) -> Self {
        Self {
            id: 0,
            pid: 0,
            path,
            check_dup,
            ret: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Direction;

    #[test]
    fn test_request_reply_convention() {
        let mut q = SparqlQuery::new(PatternGroup::default());
        q.pid = 42;
        q.id = 42;
        assert!(q.is_request());
        q.id = 77;
        assert!(!q.is_request());
    }

    #[test]
    fn test_starts_from_index() {
        let type_scan = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            20,
            TYPE_ID,
            Direction::In,
            -2,
        )]));
        assert!(type_scan.starts_from_index());

        let edge_scan = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            1,
            10,
            Direction::Out,
            -2,
        )]));
        assert!(!edge_scan.starts_from_index());

        let var_start = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            -2,
            TYPE_ID,
            Direction::In,
            -3,
        )]));
        assert!(!var_start.starts_from_index());
    }

    #[test]
    fn test_finished_at_pattern_count() {
        let mut q = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            1,
            10,
            Direction::Out,
            -2,
        )]));
        assert!(!q.is_finished());
        q.step = 1;
        assert!(q.is_finished());
    }
}
