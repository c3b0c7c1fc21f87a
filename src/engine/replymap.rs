// Per-engine table of outstanding fork-join parents.
//
// A parent entry is created before its sub-queries are dispatched and erased
// when the last reply arrives. All access happens under the owning engine's
// reply-map mutex; during work-stealing the mutating worker is not the
// owner, which is why the map itself carries no interior locking.

use crate::error::{MeshError, Result};
use crate::query::{QueryStatus, ResultTable, SparqlQuery};
use std::collections::HashMap;

struct Item {
    count: usize,
    parent: SparqlQuery,
    merged: ResultTable,
    status: QueryStatus,
}

/// Pending fork-join parents keyed by parent query id.
#[derive(Default)]
pub struct ReplyMap {
    items: HashMap<i64, Item>,
    orphan_count: u64,
}

impl ReplyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scattered parent expecting `count` replies.
    pub fn put_parent(&mut self, parent: SparqlQuery, count: usize) {
        let id = parent.id;
        self.items.insert(
            id,
            Item {
                count,
                parent,
                merged: ResultTable::new(),
                status: QueryStatus::Ok,
            },
        );
    }

    /// Fold one sub-query reply into its parent entry.
    pub fn put_reply(&mut self, reply: SparqlQuery) -> Result<()> {
        let item = match self.items.get_mut(&reply.pid) {
            Some(item) => item,
            None => {
                self.orphan_count += 1;
                return Err(MeshError::UnknownParentReply(reply.pid));
            }
        };
        item.count -= 1;
        // sibling replies share one schema by construction
        item.merged.adopt_schema(&reply.result);
        item.merged.append_result(&reply.result);
        if let QueryStatus::Failed(kind) = reply.status {
            if item.status.is_ok() {
                item.status = QueryStatus::Failed(kind);
            }
        }
        Ok(())
    }

    /// Whether every reply for `pid` has arrived.
    pub fn is_ready(&self, pid: i64) -> bool {
        self.items.get(&pid).map_or(false, |item| item.count == 0)
    }

    /// Remove the entry for `pid` and return the parent carrying the merged
    /// result (emptied when any sub-query failed).
    pub fn take_merged(&mut self, pid: i64) -> Option<SparqlQuery> {
        let item = self.items.remove(&pid)?;
        let mut parent = item.parent;
        parent.status = item.status;
        parent.result.adopt_schema(&item.merged);
        parent.result.table = item.merged.table;
        parent.result.attr_table = item.merged.attr_table;
        parent.result.row_num = item.merged.row_num;
        if !parent.status.is_ok() {
            parent.result.clear_data();
            parent.result.row_num = 0;
        }
        Some(parent)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replies that arrived with no matching parent entry.
    pub fn orphan_count(&self) -> u64 {
        self.orphan_count
    }
}
