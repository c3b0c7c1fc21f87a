// Proxy worker: query ingress and egress.
//
// A proxy accepts a planned query, mints its tracking id, routes it into the
// engine pool (fanning index scans and union branches out as needed),
// collects and merges the replies, and applies the final solution modifiers.
// Like the engines it never blocks: refused sends go to a stash and reply
// collection is a polling loop.

pub mod modifiers;

use crate::config::ClusterConfig;
use crate::error::{MeshError, Result};
use crate::query::{
    FailureKind, QueryCoder, QueryStatus, ResultTable, SparqlQuery,
};
use crate::store::hash_mod;
use crate::transport::{Adaptor, Bundle, MessageKind, SendStash};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How long [`Proxy::submit`] waits for the cluster before giving up.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

struct Pending {
    remaining: usize,
    origin: SparqlQuery,
    merged: Option<SparqlQuery>,
}

#[cfg(feature = "dynamic-load")]
struct LoadPending {
    remaining: usize,
    total: i64,
    failed: bool,
}

/// Ingress/egress worker for one `(sid, tid)` proxy slot.
pub struct Proxy {
    sid: usize,
    tid: usize,
    adaptor: Adaptor,
    coder: QueryCoder,
    cfg: Arc<ClusterConfig>,
    stash: Mutex<SendStash>,
    next_engine: AtomicUsize,
    pending: Mutex<HashMap<i64, Pending>>,
    #[cfg(feature = "dynamic-load")]
    pending_loads: Mutex<HashMap<i64, LoadPending>>,
}

impl Proxy {
    pub fn new(sid: usize, tid: usize, adaptor: Adaptor, cfg: Arc<ClusterConfig>) -> Self {
        debug_assert!(tid < cfg.num_proxies);
        Self {
            sid,
            tid,
            adaptor,
            coder: QueryCoder::new(sid, tid),
            cfg,
            stash: Mutex::new(SendStash::new()),
            next_engine: AtomicUsize::new(0),
            pending: Mutex::new(HashMap::new()),
            #[cfg(feature = "dynamic-load")]
            pending_loads: Mutex::new(HashMap::new()),
        }
    }

    pub fn sid(&self) -> usize {
        self.sid
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    fn send_or_stash(&self, dst_sid: usize, dst_tid: usize, bundle: Bundle) {
        self.stash
            .lock()
            .send_or_stash(&self.adaptor, dst_sid, dst_tid, bundle);
    }

    /// Round-robin engine tid on some server.
    fn pick_engine_tid(&self) -> usize {
        self.cfg.num_proxies + self.next_engine.fetch_add(1, Ordering::Relaxed) % self.cfg.num_engines
    }

    /// Send one request copy and return how many replies it will produce.
    fn route_one(&self, query: SparqlQuery) -> Result<usize> {
        let first = match query.pattern_group.patterns.first() {
            Some(p) => *p,
            None => {
                return Err(MeshError::UnsupportedPattern(
                    "query has no patterns".to_string(),
                ))
            }
        };

        if query.starts_from_index() {
            // parallel striped index scan: one copy per engine worker
            let bundle = Bundle::query(&query)?;
            for sid in 0..self.cfg.num_servers {
                for e in 0..self.cfg.num_engines {
                    self.send_or_stash(sid, self.cfg.num_proxies + e, bundle.clone());
                }
            }
            return Ok(self.cfg.num_servers * self.cfg.num_engines);
        }

        if first.subject < 0 {
            return Err(MeshError::UnsupportedPattern(
                "queries must start from a constant or an index".to_string(),
            ));
        }
        let dst_sid = hash_mod(first.subject, self.cfg.num_servers);
        let bundle = Bundle::query(&query)?;
        self.send_or_stash(dst_sid, self.pick_engine_tid(), bundle);
        Ok(1)
    }

    /// Mint a tracking id for `query`, route it (expanding union branches),
    /// and register the pending reply count. Returns the tracking id to pass
    /// to [`Proxy::try_collect`].
    pub fn dispatch(&self, mut query: SparqlQuery) -> Result<i64> {
        query.silent = query.silent || self.cfg.silent;
        let pid = self.coder.next_qid();
        query.pid = pid;
        query.id = pid;

        let count = if query.pattern_group.unions.is_empty() {
            self.route_one(query.clone())?
        } else {
            // union branches are complete alternative groups
            let mut count = 0;
            for branch in &query.pattern_group.unions {
                let mut branch_query = query.clone();
                branch_query.pattern_group = branch.clone();
                count += self.route_one(branch_query)?;
            }
            count
        };

        self.pending.lock().insert(
            pid,
            Pending {
                remaining: count,
                origin: query,
                merged: None,
            },
        );
        Ok(pid)
    }

    fn fold_reply(pending: &mut Pending, reply: SparqlQuery) {
        if pending.remaining == 0 {
            warn!("dropping surplus reply for query {}", reply.pid);
            return;
        }
        pending.remaining -= 1;
        match &mut pending.merged {
            None => pending.merged = Some(reply),
            Some(merged) => {
                if let QueryStatus::Failed(kind) = reply.status {
                    if merged.status.is_ok() {
                        merged.status = QueryStatus::Failed(kind);
                    }
                }
                // sibling replies must agree on shape, id and attribute
                // columns alike; union branches binding different variables
                // are a planning error
                let mismatch = merged.result.col_num != reply.result.col_num
                    || merged.result.attr_col_num != reply.result.attr_col_num
                    || merged.result.bindings() != reply.result.bindings();
                if reply.status.is_ok() && mismatch {
                    warn!(
                        "reply shape mismatch for query {}: {}+{} vs {}+{} columns",
                        reply.pid,
                        merged.result.col_num,
                        merged.result.attr_col_num,
                        reply.result.col_num,
                        reply.result.attr_col_num
                    );
                    merged.status = QueryStatus::Failed(FailureKind::UnsupportedPattern);
                    return;
                }
                merged.result.append_result(&reply.result);
            }
        }
    }

    /// Drain the proxy's receive queue, folding replies into their pending
    /// entries.
    fn drain_replies(&self) {
        while let Some(bundle) = self.adaptor.try_recv() {
            match bundle.kind {
                MessageKind::SparqlQuery => match bundle.decode_query() {
                    Ok(reply) => {
                        let mut pending = self.pending.lock();
                        match pending.get_mut(&reply.pid) {
                            Some(entry) => Self::fold_reply(entry, reply),
                            None => warn!(
                                sid = self.sid,
                                tid = self.tid,
                                "dropping reply for unknown query {}",
                                reply.pid
                            ),
                        }
                    }
                    Err(e) => warn!("dropping undecodable reply: {}", e),
                },
                MessageKind::GraphLoad => self.fold_load_reply(bundle),
            }
        }
    }

    #[cfg(feature = "dynamic-load")]
    fn fold_load_reply(&self, bundle: Bundle) {
        match bundle.decode_graph_load() {
            Ok(reply) => {
                let mut loads = self.pending_loads.lock();
                if let Some(entry) = loads.get_mut(&reply.pid) {
                    entry.remaining = entry.remaining.saturating_sub(1);
                    if reply.ret < 0 {
                        entry.failed = true;
                    } else {
                        entry.total += reply.ret;
                    }
                } else {
                    warn!("dropping load reply for unknown request {}", reply.pid);
                }
            }
            Err(e) => warn!("dropping undecodable load reply: {}", e),
        }
    }

    #[cfg(not(feature = "dynamic-load"))]
    fn fold_load_reply(&self, _bundle: Bundle) {
        warn!(
            sid = self.sid,
            tid = self.tid,
            "dropping bulk-load reply: dynamic-load support not built in"
        );
    }

    /// Non-blocking collection step: sweep stashed sends, drain replies, and
    /// return the merged query for `pid` once every reply has arrived. The
    /// returned query carries the raw merged result; modifiers are applied
    /// by [`Proxy::submit`].
    pub fn try_collect(&self, pid: i64) -> Option<SparqlQuery> {
        self.stash.lock().sweep(&self.adaptor);
        self.drain_replies();

        let mut pending = self.pending.lock();
        if !pending.get(&pid).map_or(false, |p| p.remaining == 0) {
            return None;
        }
        let entry = pending.remove(&pid)?;
        let mut query = entry.origin;
        if let Some(merged) = entry.merged {
            query.status = merged.status;
            query.result = merged.result;
        }
        if !query.status.is_ok() {
            query.result = ResultTable::new();
        }
        Some(query)
    }

    fn wait(&self, pid: i64, deadline: Instant) -> Result<SparqlQuery> {
        loop {
            if let Some(query) = self.try_collect(pid) {
                return Ok(query);
            }
            if Instant::now() >= deadline {
                self.pending.lock().remove(&pid);
                return Err(MeshError::Timeout(format!(
                    "no complete reply for query {} within {:?}",
                    pid, SUBMIT_TIMEOUT
                )));
            }
            std::thread::yield_now();
        }
    }

    /// Submit a query and wait for its final result: dispatch, collect,
    /// evaluate optional branches, then apply the solution modifiers.
    pub fn submit(&self, query: SparqlQuery) -> Result<SparqlQuery> {
        let deadline = Instant::now() + SUBMIT_TIMEOUT;
        let pid = self.dispatch(query)?;
        let mut query = self.wait(pid, deadline)?;

        if query.status.is_ok() && !query.result.blind {
            let optionals = std::mem::take(&mut query.pattern_group.optionals);
            for branch in &optionals {
                let mut branch_query = SparqlQuery::new(branch.clone());
                branch_query.silent = true;
                let branch_pid = self.dispatch(branch_query)?;
                let branch_result = self.wait(branch_pid, deadline)?;
                if branch_result.status.is_ok() {
                    modifiers::left_join_optional(&mut query.result, &branch_result.result);
                } else {
                    warn!(
                        "optional branch of query {} failed: {:?}",
                        pid, branch_result.status
                    );
                }
            }
            query.pattern_group.optionals = optionals;
            modifiers::finalize(&mut query)?;
        }

        if !query.silent {
            self.print_result(&query);
        }
        Ok(query)
    }

    /// Render up to `max_print_row` result rows through the log.
    pub fn print_result(&self, query: &SparqlQuery) {
        info!(
            "query {} finished: {} rows ({} columns)",
            query.pid, query.result.row_num, query.result.col_num
        );
        let rows = query.result.rows().min(self.cfg.max_print_row);
        for i in 0..rows {
            let mut cells: Vec<String> = (0..query.result.col_num)
                .map(|c| query.result.get(i, c).to_string())
                .collect();
            for c in 0..query.result.attr_col_num {
                cells.push(format!("{:?}", query.result.get_attr(i, c)));
            }
            info!("  {}", cells.join("\t"));
        }
    }

    /// Ask every server to bulk-load `path` into its shard; returns the
    /// total number of triples loaded.
    #[cfg(feature = "dynamic-load")]
    pub fn load(&self, path: &str, check_dup: bool) -> Result<i64> {
        use crate::query::GraphLoad;

        let pid = self.coder.next_qid();
        let mut load = GraphLoad::new(path.to_string(), check_dup);
        load.pid = pid;
        load.id = pid;
        self.pending_loads.lock().insert(
            pid,
            LoadPending {
                remaining: self.cfg.num_servers,
                total: 0,
                failed: false,
            },
        );

        let bundle = Bundle::graph_load(&load)?;
        for sid in 0..self.cfg.num_servers {
            self.send_or_stash(sid, self.pick_engine_tid(), bundle.clone());
        }

        let deadline = Instant::now() + SUBMIT_TIMEOUT;
        loop {
            self.stash.lock().sweep(&self.adaptor);
            self.drain_replies();
            {
                let mut loads = self.pending_loads.lock();
                let done = loads.get(&pid).map_or(false, |l| l.remaining == 0);
                if done {
                    if let Some(entry) = loads.remove(&pid) {
                        if entry.failed {
                            return Err(MeshError::Storage(format!(
                                "bulk load of {} failed on at least one server",
                                path
                            )));
                        }
                        return Ok(entry.total);
                    }
                }
            }
            if Instant::now() >= deadline {
                self.pending_loads.lock().remove(&pid);
                return Err(MeshError::Timeout(format!(
                    "bulk load of {} did not complete within {:?}",
                    path, SUBMIT_TIMEOUT
                )));
            }
            std::thread::yield_now();
        }
    }
}
