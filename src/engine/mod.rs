// Engine worker: priority-ordered servicing of fast-path, own-queue and
// (optionally) neighbor-queue work, with a pending-send stash swept every
// iteration.
//
// Engines on one node hold each other through a fixed array keyed by
// `tid - num_proxies`; cross-worker shared state is limited to the fast-path
// list, the reply map and the id counter, each designed for access by a
// stealing neighbor on the owner's behalf.

pub mod corun;
pub mod filter;
pub mod forkjoin;
pub mod replymap;
pub mod step;

pub use replymap::ReplyMap;
pub use step::StepCtx;

use crate::clock;
use crate::config::ClusterConfig;
use crate::error::MeshError;
use crate::query::{QueryCoder, QueryStatus, ResultTable, SparqlQuery};
use crate::store::DistGraph;
use crate::transport::{Adaptor, Bundle, MessageKind, SendStash};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Neighbor idle-time threshold for work-stealing, in microseconds.
pub const TIMEOUT_THRESHOLD_MICROS: u64 = 10_000;

/// Snapshot of an engine's observable state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub fast_path_len: usize,
    pub pending_sends: usize,
    pub rmap_entries: usize,
    pub orphan_replies: u64,
    pub bundles_processed: u64,
    pub scatters: u64,
}

/// A single-threaded query execution worker.
pub struct Engine {
    sid: usize,
    tid: usize,
    graph: Arc<DistGraph>,
    adaptor: Adaptor,
    cfg: Arc<ClusterConfig>,
    coder: QueryCoder,
    fast_path: Mutex<Vec<SparqlQuery>>,
    rmap: Mutex<ReplyMap>,
    stash: Mutex<SendStash>,
    last_activity: AtomicU64,
    bundles_processed: AtomicU64,
    scatters: AtomicU64,
}

impl Engine {
    pub fn new(
        sid: usize,
        tid: usize,
        graph: Arc<DistGraph>,
        adaptor: Adaptor,
        cfg: Arc<ClusterConfig>,
    ) -> Self {
        debug_assert!(cfg.is_engine_tid(tid));
        Self {
            sid,
            tid,
            graph,
            adaptor,
            coder: QueryCoder::new(sid, tid),
            cfg,
            fast_path: Mutex::new(Vec::new()),
            rmap: Mutex::new(ReplyMap::new()),
            stash: Mutex::new(SendStash::new()),
            last_activity: AtomicU64::new(clock::now_micros()),
            bundles_processed: AtomicU64::new(0),
            scatters: AtomicU64::new(0),
        }
    }

    pub fn sid(&self) -> usize {
        self.sid
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    /// Index of this engine in its node's engine array.
    pub fn own_index(&self) -> usize {
        self.tid - self.cfg.num_proxies
    }

    /// Self-schedule a sub-query, bypassing the transport.
    pub fn push_fast_path(&self, query: SparqlQuery) {
        self.fast_path.lock().push(query);
    }

    /// Non-blocking receive from this engine's transport queue. Public so a
    /// stealing neighbor can drain it.
    pub fn try_recv(&self) -> Option<Bundle> {
        self.adaptor.try_recv()
    }

    pub fn last_activity_micros(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity
            .store(clock::now_micros(), Ordering::Relaxed);
    }

    fn send_or_stash(&self, dst_sid: usize, dst_tid: usize, bundle: Bundle) {
        self.stash
            .lock()
            .send_or_stash(&self.adaptor, dst_sid, dst_tid, bundle);
    }

    /// Ship a finished (or failed) query back to the owner of its `pid`.
    fn ship(&self, query: SparqlQuery) {
        let dst_sid = QueryCoder::sid_of(query.pid);
        let dst_tid = QueryCoder::tid_of(query.pid);
        match Bundle::query(&query) {
            Ok(bundle) => self.send_or_stash(dst_sid, dst_tid, bundle),
            Err(e) => error!(
                sid = self.sid,
                tid = self.tid,
                "dropping undeliverable reply for query {}: {}",
                query.id,
                e
            ),
        }
    }

    fn reply_error(&self, mut query: SparqlQuery, err: &MeshError) {
        warn!(
            sid = self.sid,
            tid = self.tid,
            "query {} failed: {}",
            query.id,
            err
        );
        query.status = QueryStatus::Failed(err.failure_kind());
        query.result = ResultTable::new();
        self.ship(query);
    }

    /// Run a request until it finishes or scatters. `owner` is the engine
    /// this work belongs to; it differs from `self` only during stealing,
    /// and receives the minted id, the reply-map entry and the fast-path
    /// sub-query so the merge completes on the owning worker.
    fn execute_request(&self, mut query: SparqlQuery, owner: &Engine) {
        if query.is_request() {
            query.id = owner.coder.next_qid();
        }
        let ctx = StepCtx {
            graph: &self.graph,
            tid: self.tid,
            owner_index: owner.own_index(),
            cfg: &self.cfg,
        };

        loop {
            if !query.is_finished() {
                if let Err(e) = step::execute_one_step(&ctx, &mut query) {
                    self.reply_error(query, &e);
                    return;
                }
                if !query.is_finished() && query.step == query.corun_step {
                    if let Err(e) = corun::do_corun(&ctx, &mut query) {
                        self.reply_error(query, &e);
                        return;
                    }
                }
            }

            if query.is_finished() {
                if let Err(e) = filter::apply_filters(&mut query) {
                    self.reply_error(query, &e);
                    return;
                }
                query.result.sync_row_num();
                if query.result.blind {
                    query.result.clear_data();
                }
                self.ship(query);
                return;
            }

            if forkjoin::need_fork_join(&self.cfg, &query) {
                let subs = match forkjoin::generate_sub_queries(&query, self.cfg.num_servers) {
                    Ok(subs) => subs,
                    Err(e) => {
                        self.reply_error(query, &e);
                        return;
                    }
                };
                self.scatters.fetch_add(1, Ordering::Relaxed);
                // the parent entry must be registered before any sub-query
                // reaches the transport, or an early reply would be orphaned
                owner.rmap.lock().put_parent(query, subs.len());
                for (dst_sid, sub) in subs.into_iter().enumerate() {
                    if dst_sid == self.sid {
                        owner.push_fast_path(sub);
                    } else {
                        match Bundle::query(&sub) {
                            Ok(bundle) => self.send_or_stash(dst_sid, owner.tid, bundle),
                            Err(e) => error!(
                                sid = self.sid,
                                tid = self.tid,
                                "dropping undeliverable sub-query: {}",
                                e
                            ),
                        }
                    }
                }
                return;
            }
        }
    }

    /// Fold a sub-query reply into the owner's reply map; ship the merged
    /// parent once the last reply is in.
    fn execute_reply(&self, query: SparqlQuery, owner: &Engine) {
        let pid = query.pid;
        let merged = {
            let mut rmap = owner.rmap.lock();
            match rmap.put_reply(query) {
                Err(e) => {
                    warn!(sid = self.sid, tid = self.tid, "dropping reply: {}", e);
                    None
                }
                Ok(()) => {
                    if rmap.is_ready(pid) {
                        rmap.take_merged(pid)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(parent) = merged {
            self.ship(parent);
        }
    }

    fn execute_query(&self, query: SparqlQuery, owner: &Engine) {
        if query.is_request() {
            self.execute_request(query, owner);
        } else {
            self.execute_reply(query, owner);
        }
    }

    #[cfg(feature = "dynamic-load")]
    fn execute_graph_load(&self, bundle: Bundle) {
        let mut load = match bundle.decode_graph_load() {
            Ok(load) => load,
            Err(e) => {
                warn!(
                    sid = self.sid,
                    tid = self.tid,
                    "dropping undecodable load bundle: {}",
                    e
                );
                return;
            }
        };
        load.ret = match self
            .graph
            .local()
            .bulk_load(std::path::Path::new(&load.path), load.check_dup)
        {
            Ok(n) => n as i64,
            Err(e) => {
                warn!(
                    sid = self.sid,
                    tid = self.tid,
                    "bulk load of {} failed: {}",
                    load.path,
                    e
                );
                -1
            }
        };
        let dst_sid = QueryCoder::sid_of(load.pid);
        let dst_tid = QueryCoder::tid_of(load.pid);
        match Bundle::graph_load(&load) {
            Ok(bundle) => self.send_or_stash(dst_sid, dst_tid, bundle),
            Err(e) => error!(sid = self.sid, "dropping load reply: {}", e),
        }
    }

    #[cfg(not(feature = "dynamic-load"))]
    fn execute_graph_load(&self, _bundle: Bundle) {
        warn!(
            sid = self.sid,
            tid = self.tid,
            "dropping bulk-load request: dynamic-load support not built in"
        );
    }

    fn execute_bundle(&self, bundle: Bundle, owner: &Engine) {
        self.bundles_processed.fetch_add(1, Ordering::Relaxed);
        match bundle.kind {
            MessageKind::SparqlQuery => match bundle.decode_query() {
                Ok(query) => self.execute_query(query, owner),
                Err(e) => warn!(
                    sid = self.sid,
                    tid = self.tid,
                    "dropping undecodable query bundle: {}",
                    e
                ),
            },
            MessageKind::GraphLoad => self.execute_graph_load(bundle),
        }
    }

    /// One main-loop iteration. Returns whether any work was done.
    ///
    /// `engines` is this node's engine array, indexed by `tid - num_proxies`.
    pub fn poll(&self, engines: &[Arc<Engine>]) -> bool {
        // 1. retry refused sends
        self.stash.lock().sweep(&self.adaptor);

        // 2. fast path
        self.touch();
        let fast = self.fast_path.lock().pop();
        if let Some(query) = fast {
            self.execute_query(query, self);
            return true;
        }

        // 3. own queue
        self.touch();
        if let Some(bundle) = self.adaptor.try_recv() {
            self.execute_bundle(bundle, self);
            return true;
        }

        if !self.cfg.enable_workstealing {
            return false;
        }

        // 4. neighbor queue, once the neighbor looks idle
        self.touch();
        debug_assert_eq!(engines.len(), self.cfg.num_engines);
        let nbr_index = self.cfg.num_engines - 1 - self.own_index();
        if nbr_index == self.own_index() {
            return false;
        }
        let neighbor = engines[nbr_index].as_ref();
        if clock::now_micros() < neighbor.last_activity_micros() + TIMEOUT_THRESHOLD_MICROS {
            return false;
        }
        if let Some(bundle) = neighbor.try_recv() {
            self.execute_bundle(bundle, neighbor);
            return true;
        }
        false
    }

    /// Drive the main loop until `shutdown` flips.
    pub fn run(&self, engines: &[Arc<Engine>], shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::Relaxed) {
            if !self.poll(engines) {
                std::thread::yield_now();
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        let fast_path_len = self.fast_path.lock().len();
        let pending_sends = self.stash.lock().len();
        let (rmap_entries, orphan_replies) = {
            let rmap = self.rmap.lock();
            (rmap.len(), rmap.orphan_count())
        };
        EngineStats {
            fast_path_len,
            pending_sends,
            rmap_entries,
            orphan_replies,
            bundles_processed: self.bundles_processed.load(Ordering::Relaxed),
            scatters: self.scatters.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Direction, GraphId, Pattern, PatternGroup};
    use crate::store::ShardStore;
    use crate::transport::MeshTransport;

    const KNOWS: GraphId = 10;

    struct Rig {
        engines: Vec<Arc<Engine>>,
        mesh: Arc<MeshTransport>,
    }

    fn rig(mut cfg: ClusterConfig) -> Rig {
        cfg.num_servers = 1;
        let cfg = Arc::new(cfg);
        let shard = Arc::new(ShardStore::new(0, 1));
        shard.insert_triple(1, KNOWS, 2);
        shard.insert_triple(1, KNOWS, 3);
        shard.insert_triple(2, KNOWS, 4);
        shard.insert_triple(3, KNOWS, 5);
        let mesh = MeshTransport::new(1, cfg.workers_per_server(), cfg.transport_capacity);
        let engines: Vec<Arc<Engine>> = (0..cfg.num_engines)
            .map(|i| {
                let tid = cfg.num_proxies + i;
                Arc::new(Engine::new(
                    0,
                    tid,
                    Arc::new(crate::store::DistGraph::new(0, vec![Arc::clone(&shard)])),
                    mesh.adaptor(0, tid),
                    Arc::clone(&cfg),
                ))
            })
            .collect();
        Rig { engines, mesh }
    }

    fn request(patterns: Vec<Pattern>, pid: i64) -> SparqlQuery {
        let mut q = SparqlQuery::new(PatternGroup::from_patterns(patterns));
        q.pid = pid;
        q.id = pid;
        q
    }

    /// A proxy-side qid for worker (0, 0), used as reply destination.
    fn proxy_pid() -> i64 {
        QueryCoder::new(0, 0).next_qid()
    }

    #[test]
    fn test_request_executes_and_replies_to_pid_owner() {
        let r = rig(ClusterConfig::new(1, 1, 1));
        let engine = &r.engines[0];
        let pid = proxy_pid();

        engine.push_fast_path(request(
            vec![Pattern::new(1, KNOWS, Direction::Out, -2)],
            pid,
        ));
        assert!(engine.poll(&r.engines));

        let proxy_adaptor = r.mesh.adaptor(0, 0);
        let reply = proxy_adaptor.try_recv().unwrap().decode_query().unwrap();
        assert!(!reply.is_request());
        assert_eq!(reply.pid, pid);
        assert_eq!(reply.result.table, vec![2, 3]);
        assert_eq!(reply.result.row_num, 2);
        assert!(reply.status.is_ok());
    }

    #[test]
    fn test_single_server_scatter_merges_to_identity() {
        let mut cfg = ClusterConfig::new(1, 1, 1);
        cfg.rdma_threshold = 1;
        let r = rig(cfg);
        let engine = &r.engines[0];
        let pid = proxy_pid();

        engine.push_fast_path(request(
            vec![
                Pattern::new(1, KNOWS, Direction::Out, -2),
                Pattern::new(-2, KNOWS, Direction::Out, -3),
            ],
            pid,
        ));

        // first poll scatters (self fast-path), following polls run the
        // sub-query and merge the single reply
        let mut replies = Vec::new();
        for _ in 0..10 {
            engine.poll(&r.engines);
            if let Some(bundle) = r.mesh.adaptor(0, 0).try_recv() {
                replies.push(bundle.decode_query().unwrap());
            }
        }
        assert_eq!(engine.stats().scatters, 1);
        assert_eq!(replies.len(), 1);
        let mut rows: Vec<(GraphId, GraphId)> = (0..replies[0].result.rows())
            .map(|i| (replies[0].result.get(i, 0), replies[0].result.get(i, 1)))
            .collect();
        rows.sort_unstable();
        assert_eq!(rows, vec![(2, 4), (3, 5)]);
        assert_eq!(engine.stats().rmap_entries, 0);
    }

    #[test]
    fn test_unsupported_pattern_yields_failed_reply() {
        let r = rig(ClusterConfig::new(1, 1, 1));
        let engine = &r.engines[0];
        let pid = proxy_pid();

        // const -> known is a planning error
        engine.push_fast_path(request(
            vec![
                Pattern::new(1, KNOWS, Direction::Out, -2),
                Pattern::new(4, KNOWS, Direction::In, -2),
            ],
            pid,
        ));
        engine.poll(&r.engines);

        let reply = r.mesh.adaptor(0, 0).try_recv().unwrap().decode_query().unwrap();
        assert_eq!(
            reply.status,
            QueryStatus::Failed(crate::query::FailureKind::UnsupportedPattern)
        );
        assert_eq!(reply.result.row_num, 0);
        assert!(reply.result.table.is_empty());
    }

    #[test]
    fn test_blind_reply_carries_cardinality_only() {
        let r = rig(ClusterConfig::new(1, 1, 1));
        let engine = &r.engines[0];
        let pid = proxy_pid();

        let mut q = request(vec![Pattern::new(1, KNOWS, Direction::Out, -2)], pid);
        q.result.blind = true;
        engine.push_fast_path(q);
        engine.poll(&r.engines);

        let reply = r.mesh.adaptor(0, 0).try_recv().unwrap().decode_query().unwrap();
        assert!(reply.result.table.is_empty());
        assert_eq!(reply.result.row_num, 2);
    }

    #[test]
    fn test_orphan_reply_is_dropped_and_counted() {
        let r = rig(ClusterConfig::new(1, 1, 1));
        let engine = &r.engines[0];

        let mut reply = request(vec![Pattern::new(1, KNOWS, Direction::Out, -2)], 7777);
        reply.id = 9999; // not a request: unknown parent 7777
        let sender = r.mesh.adaptor(0, 0);
        assert!(sender.send(0, 1, &Bundle::query(&reply).unwrap()));

        engine.poll(&r.engines);
        assert_eq!(engine.stats().orphan_replies, 1);
    }

    #[test]
    fn test_fast_path_takes_priority_over_own_queue() {
        let r = rig(ClusterConfig::new(1, 1, 1));
        let engine = &r.engines[0];
        let pid = proxy_pid();

        let queued = request(vec![Pattern::new(1, KNOWS, Direction::Out, -2)], pid);
        let sender = r.mesh.adaptor(0, 0);
        assert!(sender.send(0, 1, &Bundle::query(&queued).unwrap()));
        engine.push_fast_path(request(
            vec![Pattern::new(2, KNOWS, Direction::Out, -2)],
            pid,
        ));

        engine.poll(&r.engines);
        // the fast-path query (from vertex 2) answered first
        let first = r.mesh.adaptor(0, 0).try_recv().unwrap().decode_query().unwrap();
        assert_eq!(first.result.table, vec![4]);
        // the transported query is still waiting in the own queue
        assert!(engine.try_recv().is_some());
    }

    #[test]
    fn test_refused_reply_is_stashed_then_swept() {
        let mut cfg = ClusterConfig::new(1, 1, 1);
        cfg.transport_capacity = 1;
        let r = rig(cfg);
        let engine = &r.engines[0];
        let pid = proxy_pid();

        // fill the proxy's ring so the engine's reply is refused
        let filler = r.mesh.adaptor(0, 0);
        assert!(filler.send(0, 0, &Bundle::query(&request(vec![], pid)).unwrap()));

        engine.push_fast_path(request(
            vec![Pattern::new(1, KNOWS, Direction::Out, -2)],
            pid,
        ));
        engine.poll(&r.engines);
        assert_eq!(engine.stats().pending_sends, 1);

        // drain the ring; the next iteration's sweep delivers the reply
        assert!(filler.try_recv().is_some());
        engine.poll(&r.engines);
        assert_eq!(engine.stats().pending_sends, 0);
        let reply = filler.try_recv().unwrap().decode_query().unwrap();
        assert_eq!(reply.result.table, vec![2, 3]);
    }

    #[test]
    fn test_stolen_scatter_lands_in_owner_state() {
        let mut cfg = ClusterConfig::new(1, 1, 2);
        cfg.enable_workstealing = true;
        cfg.rdma_threshold = 1;
        let r = rig(cfg);
        let thief = &r.engines[0];
        let owner = &r.engines[1];
        let pid = proxy_pid();

        // queue a scattering query on the owner, which never polls
        let sender = r.mesh.adaptor(0, 0);
        let q = request(
            vec![
                Pattern::new(1, KNOWS, Direction::Out, -2),
                Pattern::new(-2, KNOWS, Direction::Out, -3),
            ],
            pid,
        );
        assert!(sender.send(0, owner.tid(), &Bundle::query(&q).unwrap()));

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(thief.poll(&r.engines));

        // the parent entry and the fast-path sub-query live on the owner
        assert_eq!(owner.stats().rmap_entries, 1);
        assert_eq!(owner.stats().fast_path_len, 1);
        assert_eq!(thief.stats().rmap_entries, 0);
        assert_eq!(thief.stats().fast_path_len, 0);

        // the owner finishes its own merge
        for _ in 0..10 {
            owner.poll(&r.engines);
        }
        let reply = sender.try_recv().unwrap().decode_query().unwrap();
        assert_eq!(reply.result.rows(), 2);
        assert_eq!(owner.stats().rmap_entries, 0);
    }

    #[test]
    fn test_workstealing_respects_activity_timeout() {
        let mut cfg = ClusterConfig::new(1, 1, 2);
        cfg.enable_workstealing = true;
        let r = rig(cfg);
        let thief = &r.engines[0];
        let owner = &r.engines[1];
        let pid = proxy_pid();

        let sender = r.mesh.adaptor(0, 0);
        let q = request(vec![Pattern::new(1, KNOWS, Direction::Out, -2)], pid);
        assert!(sender.send(0, owner.tid(), &Bundle::query(&q).unwrap()));

        // owner is active: the thief must not steal
        owner.poll(&r.engines); // drains its own queue though
        let q = request(vec![Pattern::new(1, KNOWS, Direction::Out, -2)], pid);
        assert!(sender.send(0, owner.tid(), &Bundle::query(&q).unwrap()));
        assert!(!thief.poll(&r.engines));
        assert_eq!(thief.stats().bundles_processed, 0);
    }
}
