// GraphMesh server
//
// Hosts a whole cluster in one process: N server nodes, each with its proxy
// and engine workers over the in-process mesh. Intended for single-machine
// deployments and smoke runs; multi-machine transports plug in behind the
// same adaptor interface.

use graphmesh::cluster::LocalCluster;
use graphmesh::query::{Direction, GraphId, Pattern, PatternGroup, SparqlQuery};
use graphmesh::store::ShardStore;
use graphmesh::{ClusterConfig, Result, VERSION};
use std::sync::Arc;
use tracing::{error, info};

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn config_from_env() -> ClusterConfig {
    let engines = env_usize("GRAPHMESH_ENGINES", (num_cpus::get() / 2).clamp(2, 8));
    let mut cfg = ClusterConfig::new(
        env_usize("GRAPHMESH_SERVERS", 3),
        env_usize("GRAPHMESH_PROXIES", 1),
        engines,
    );
    cfg.rdma_threshold = env_usize("GRAPHMESH_RDMA_THRESHOLD", cfg.rdma_threshold);
    cfg.enable_workstealing = std::env::var("GRAPHMESH_WORKSTEALING").is_ok();
    cfg
}

const KNOWS: GraphId = 10;

/// A small social graph, partitioned by hash ownership.
fn seed_demo(shards: &[Arc<ShardStore>]) {
    let edges = [
        (1, 2),
        (1, 3),
        (2, 4),
        (3, 5),
        (4, 5),
        (5, 1),
        (5, 6),
        (6, 2),
    ];
    for &(s, o) in &edges {
        for shard in shards {
            if shard.owns(s) || shard.owns(o) {
                shard.insert_triple(s, KNOWS, o);
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let cfg = config_from_env();
    info!("graphmesh v{} starting", VERSION);
    info!(
        "{} servers, {} proxies + {} engines per server",
        cfg.num_servers, cfg.num_proxies, cfg.num_engines
    );

    let shards: Vec<Arc<ShardStore>> = (0..cfg.num_servers)
        .map(|sid| Arc::new(ShardStore::new(sid, cfg.num_servers)))
        .collect();

    match std::env::var("GRAPHMESH_TRIPLES") {
        Ok(path) => {
            let path = std::path::PathBuf::from(path);
            for shard in &shards {
                let loaded = shard.bulk_load(&path, false)?;
                info!("shard {}: loaded {} triples", shard.sid(), loaded);
            }
        }
        Err(_) => seed_demo(&shards),
    }

    let mut cluster = LocalCluster::launch(cfg, shards)?;

    // smoke query: two-hop friends of vertex 1
    let query = SparqlQuery::new(PatternGroup::from_patterns(vec![
        Pattern::new(1, KNOWS, Direction::Out, -2),
        Pattern::new(-2, KNOWS, Direction::Out, -3),
    ]));
    match cluster.proxy(0, 0).submit(query) {
        Ok(reply) => info!(
            "smoke query done: {} rows, status {:?}",
            reply.result.row_num, reply.status
        ),
        Err(e) => error!("smoke query failed: {}", e),
    }

    cluster.shutdown();
    info!("graphmesh stopped");
    Ok(())
}
