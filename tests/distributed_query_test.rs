// Distributed query execution over a three-node in-process cluster.
//
// Most tests build the cluster without engine threads and drive every worker
// by explicit polls, so scatter, merge and backpressure interleavings are
// deterministic. One end-to-end test runs the real threaded topology.

use graphmesh::cluster::LocalCluster;
use graphmesh::query::{
    CompareOp, Direction, Filter, GraphId, Order, Pattern, PatternGroup, QueryStatus, SparqlQuery,
    Term, TYPE_ID,
};
use graphmesh::store::ShardStore;
use graphmesh::ClusterConfig;
use std::sync::Arc;

const KNOWS: GraphId = 10;
const TYPE_X: GraphId = 20;
const AGE: GraphId = 30;

/// The seed graph: `1 -knows-> 2`, `1 -knows-> 3` on node 0; `2 -knows-> 4`
/// on node 1; `3 -knows-> 5` on node 2. Vertex values are chosen so that
/// `hash(v) mod 3 == v mod 3`.
fn three_node_shards() -> Vec<Arc<ShardStore>> {
    let shard0 = Arc::new(ShardStore::new(0, 3));
    let shard1 = Arc::new(ShardStore::new(1, 3));
    let shard2 = Arc::new(ShardStore::new(2, 3));
    shard0.insert_triple(1, KNOWS, 2);
    shard0.insert_triple(1, KNOWS, 3);
    shard1.insert_triple(2, KNOWS, 4);
    shard2.insert_triple(3, KNOWS, 5);
    vec![shard0, shard1, shard2]
}

fn two_hop_query() -> SparqlQuery {
    SparqlQuery::new(PatternGroup::from_patterns(vec![
        Pattern::new(1, KNOWS, Direction::Out, -2),
        Pattern::new(-2, KNOWS, Direction::Out, -3),
    ]))
}

/// Dispatch through the proxy and drive the unthreaded cluster to completion.
fn submit_polling(cluster: &LocalCluster, query: SparqlQuery) -> SparqlQuery {
    let proxy = cluster.proxy(0, 0);
    let pid = proxy.dispatch(query).expect("dispatch failed");
    for _ in 0..10_000 {
        cluster.poll_all();
        if let Some(reply) = proxy.try_collect(pid) {
            return reply;
        }
    }
    panic!("query {} did not complete", pid);
}

fn sorted_rows(query: &SparqlQuery) -> Vec<Vec<GraphId>> {
    let mut rows: Vec<Vec<GraphId>> = (0..query.result.rows())
        .map(|i| {
            (0..query.result.col_num)
                .map(|c| query.result.get(i, c))
                .collect()
        })
        .collect();
    rows.sort_unstable();
    rows
}

fn total_scatters(cluster: &LocalCluster) -> u64 {
    (0..3)
        .flat_map(|sid| cluster.engines(sid).iter())
        .map(|e| e.stats().scatters)
        .sum()
}

#[test]
fn test_single_step_constant_query() {
    let cfg = ClusterConfig::new(3, 1, 2);
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let reply = submit_polling(
        &cluster,
        SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            1,
            KNOWS,
            Direction::Out,
            -2,
        )])),
    );
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2], vec![3]]);
    assert_eq!(total_scatters(&cluster), 0);
}

#[test]
fn test_two_hop_query_scatters_and_merges() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let reply = submit_polling(&cluster, two_hop_query());
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2, 4], vec![3, 5]]);
    assert_eq!(total_scatters(&cluster), 1);

    // every reply map drained once the merge completed
    for sid in 0..3 {
        for engine in cluster.engines(sid) {
            assert_eq!(engine.stats().rmap_entries, 0);
            assert_eq!(engine.stats().orphan_replies, 0);
        }
    }
}

#[test]
fn test_two_hop_query_in_place_matches_scattered() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1000;
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let reply = submit_polling(&cluster, two_hop_query());
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2, 4], vec![3, 5]]);
    assert_eq!(total_scatters(&cluster), 0);
}

#[test]
fn test_index_scan_stripes_across_engines() {
    let mut cfg = ClusterConfig::new(1, 1, 2);
    cfg.rdma_threshold = 1000;
    let shard = Arc::new(ShardStore::new(0, 1));
    for v in 0..6 {
        shard.insert_triple(100 + v, TYPE_ID, TYPE_X);
    }
    let cluster = LocalCluster::build(cfg, vec![shard]).unwrap();

    let reply = submit_polling(
        &cluster,
        SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            TYPE_X,
            TYPE_ID,
            Direction::In,
            -2,
        )])),
    );
    assert!(reply.status.is_ok());
    assert_eq!(
        sorted_rows(&reply),
        (100..106).map(|v| vec![v]).collect::<Vec<_>>()
    );
}

#[test]
fn test_backpressure_loses_no_messages() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    cfg.transport_capacity = 1;
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let reply = submit_polling(&cluster, two_hop_query());
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2, 4], vec![3, 5]]);

    // the stash recovered every refused send
    for sid in 0..3 {
        for engine in cluster.engines(sid) {
            assert_eq!(engine.stats().pending_sends, 0);
        }
    }
}

#[test]
fn test_distributed_filter_drops_rows() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let mut query = two_hop_query();
    query.pattern_group.filters.push(Filter::Compare {
        op: CompareOp::Ne,
        lhs: Term::Variable(-3),
        rhs: Term::Constant(4),
    });
    let reply = submit_polling(&cluster, query);
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![3, 5]]);
}

#[test]
fn test_blind_query_returns_cardinality_only() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let mut query = two_hop_query();
    query.result.blind = true;
    let reply = submit_polling(&cluster, query);
    assert!(reply.status.is_ok());
    assert_eq!(reply.result.row_num, 2);
    assert!(reply.result.table.is_empty());
}

#[test]
fn test_pure_attribute_query_carries_its_rows() {
    use graphmesh::query::AttrValue;

    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.enable_vattr = true;
    let shards = three_node_shards();
    shards[1].insert_attr(2, AGE, AttrValue::Int(25));
    let cluster = LocalCluster::build(cfg, shards).unwrap();

    // the whole query is one attribute fetch from a constant vertex
    let mut reply = submit_polling(
        &cluster,
        SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            2,
            AGE,
            Direction::Out,
            -2,
        )
        .with_pred_type(1)])),
    );
    assert!(reply.status.is_ok());
    assert_eq!(reply.result.col_num, 0);
    assert_eq!(reply.result.attr_col_num, 1);
    assert_eq!(reply.result.row_num, 1);
    assert_eq!(reply.result.rows(), 1);
    assert_eq!(reply.result.get_attr(0, 0), &AttrValue::Int(25));

    // projecting onto the attribute variable keeps the value
    reply.required_vars = vec![-2];
    graphmesh::proxy::modifiers::finalize(&mut reply).unwrap();
    assert_eq!(reply.result.attr_col_num, 1);
    assert_eq!(reply.result.rows(), 1);
    assert_eq!(reply.result.get_attr(0, 0), &AttrValue::Int(25));
}

#[test]
fn test_union_branches_concatenate() {
    let cfg = ClusterConfig::new(3, 1, 2);
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    let mut query = SparqlQuery::new(PatternGroup::default());
    query
        .pattern_group
        .unions
        .push(PatternGroup::from_patterns(vec![Pattern::new(
            1,
            KNOWS,
            Direction::Out,
            -2,
        )]));
    query
        .pattern_group
        .unions
        .push(PatternGroup::from_patterns(vec![Pattern::new(
            2,
            KNOWS,
            Direction::Out,
            -2,
        )]));

    let reply = submit_polling(&cluster, query);
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2], vec![3], vec![4]]);
}

#[test]
fn test_planning_error_surfaces_as_failed_reply() {
    let cfg = ClusterConfig::new(3, 1, 2);
    let cluster = LocalCluster::build(cfg, three_node_shards()).unwrap();

    // const -> known is rejected by the step executor
    let reply = submit_polling(
        &cluster,
        SparqlQuery::new(PatternGroup::from_patterns(vec![
            Pattern::new(1, KNOWS, Direction::Out, -2),
            Pattern::new(4, KNOWS, Direction::In, -2),
        ])),
    );
    assert!(matches!(reply.status, QueryStatus::Failed(_)));
    assert_eq!(reply.result.row_num, 0);
    assert!(reply.result.table.is_empty());
}

#[test]
fn test_threaded_cluster_end_to_end() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    cfg.silent = true;
    let mut cluster = LocalCluster::launch(cfg, three_node_shards()).unwrap();

    // plain two-hop
    let reply = cluster.proxy(0, 0).submit(two_hop_query()).unwrap();
    assert!(reply.status.is_ok());
    assert_eq!(sorted_rows(&reply), vec![vec![2, 4], vec![3, 5]]);

    // solution modifiers: order by ?x descending, first row only, project ?y
    let mut query = two_hop_query();
    query.orders.push(Order::desc(-2));
    query.limit = 1;
    query.required_vars = vec![-3];
    let reply = cluster.proxy(0, 0).submit(query).unwrap();
    assert_eq!(reply.result.col_num, 1);
    assert_eq!(reply.result.table, vec![5]);

    cluster.shutdown();
}

#[test]
fn test_optional_branch_left_joins() {
    let mut cfg = ClusterConfig::new(3, 1, 2);
    cfg.rdma_threshold = 1;
    cfg.silent = true;
    let mut cluster = LocalCluster::launch(cfg, three_node_shards()).unwrap();

    // main: friends of 1; optional: who those friends know, reachable only
    // for ?x = 2 (4's in-neighbors then their targets)
    let mut query = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
        1,
        KNOWS,
        Direction::Out,
        -2,
    )]));
    query
        .pattern_group
        .optionals
        .push(PatternGroup::from_patterns(vec![
            Pattern::new(4, KNOWS, Direction::In, -2),
            Pattern::new(-2, KNOWS, Direction::Out, -5),
        ]));

    let reply = cluster.proxy(0, 0).submit(query).unwrap();
    assert!(reply.status.is_ok());
    assert_eq!(reply.result.col_num, 2);
    let rows = sorted_rows(&reply);
    assert_eq!(rows.len(), 2);
    // ?x = 2 extended with ?z = 4; ?x = 3 kept with an unbound slot
    assert_eq!(rows[0], vec![2, 4]);
    assert_eq!(rows[1][0], 3);
    assert_eq!(rows[1][1], graphmesh::query::DUMMY_ID);

    cluster.shutdown();
}

#[cfg(feature = "dynamic-load")]
#[test]
fn test_bulk_load_through_proxy() {
    use std::io::Write;

    let mut cfg = ClusterConfig::new(2, 1, 2);
    cfg.silent = true;
    let shards: Vec<Arc<ShardStore>> =
        (0..2).map(|sid| Arc::new(ShardStore::new(sid, 2))).collect();
    let mut cluster = LocalCluster::launch(cfg, shards).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "1 {} 2", KNOWS).unwrap();
    writeln!(file, "1 {} 3", KNOWS).unwrap();
    file.flush().unwrap();

    let loaded = cluster
        .proxy(0, 0)
        .load(file.path().to_str().unwrap(), true)
        .unwrap();
    assert!(loaded > 0);

    let reply = cluster
        .proxy(0, 0)
        .submit(SparqlQuery::new(PatternGroup::from_patterns(vec![
            Pattern::new(1, KNOWS, Direction::Out, -2),
        ])))
        .unwrap();
    assert_eq!(sorted_rows(&reply), vec![vec![2], vec![3]]);

    cluster.shutdown();
}
