// In-process cluster bootstrap.
//
// Builds the full worker topology over the mesh transport: per node, P
// proxies and E engines sharing one cluster-wide graph view. Engine threads
// are optional; tests drive workers by explicit polls for determinism.

use crate::config::ClusterConfig;
use crate::engine::Engine;
use crate::error::{MeshError, Result};
use crate::proxy::Proxy;
use crate::store::{DistGraph, ShardStore};
use crate::transport::MeshTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// One server node's workers.
pub struct ClusterNode {
    pub sid: usize,
    pub proxies: Vec<Arc<Proxy>>,
    pub engines: Vec<Arc<Engine>>,
}

/// A whole cluster hosted in one process.
pub struct LocalCluster {
    cfg: Arc<ClusterConfig>,
    transport: Arc<MeshTransport>,
    shards: Vec<Arc<ShardStore>>,
    nodes: Vec<ClusterNode>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Build the topology without starting engine threads.
    pub fn build(cfg: ClusterConfig, shards: Vec<Arc<ShardStore>>) -> Result<Self> {
        cfg.validate()?;
        if shards.len() != cfg.num_servers {
            return Err(MeshError::Configuration(format!(
                "expected {} shards, got {}",
                cfg.num_servers,
                shards.len()
            )));
        }

        let cfg = Arc::new(cfg);
        let transport = MeshTransport::new(
            cfg.num_servers,
            cfg.workers_per_server(),
            cfg.transport_capacity,
        );

        let mut nodes = Vec::with_capacity(cfg.num_servers);
        for sid in 0..cfg.num_servers {
            let graph = Arc::new(DistGraph::new(sid, shards.clone()));
            let proxies = (0..cfg.num_proxies)
                .map(|tid| {
                    Arc::new(Proxy::new(
                        sid,
                        tid,
                        transport.adaptor(sid, tid),
                        Arc::clone(&cfg),
                    ))
                })
                .collect();
            let engines = (0..cfg.num_engines)
                .map(|i| {
                    let tid = cfg.num_proxies + i;
                    Arc::new(Engine::new(
                        sid,
                        tid,
                        Arc::clone(&graph),
                        transport.adaptor(sid, tid),
                        Arc::clone(&cfg),
                    ))
                })
                .collect();
            nodes.push(ClusterNode {
                sid,
                proxies,
                engines,
            });
        }

        Ok(Self {
            cfg,
            transport,
            shards,
            nodes,
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    /// Build the topology and start one thread per engine worker.
    pub fn launch(cfg: ClusterConfig, shards: Vec<Arc<ShardStore>>) -> Result<Self> {
        let mut cluster = Self::build(cfg, shards)?;
        cluster.start()?;
        Ok(cluster)
    }

    /// Spawn the engine threads.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(MeshError::Configuration(
                "cluster already started".to_string(),
            ));
        }
        for node in &self.nodes {
            for engine in &node.engines {
                let engine = Arc::clone(engine);
                let peers = node.engines.clone();
                let shutdown = Arc::clone(&self.shutdown);
                let name = format!("engine-{}-{}", engine.sid(), engine.tid());
                let handle = std::thread::Builder::new()
                    .name(name)
                    .spawn(move || engine.run(&peers, &shutdown))
                    .map_err(MeshError::Io)?;
                self.handles.push(handle);
            }
        }
        info!(
            "cluster started: {} servers x ({} proxies + {} engines)",
            self.cfg.num_servers, self.cfg.num_proxies, self.cfg.num_engines
        );
        Ok(())
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.cfg
    }

    pub fn transport(&self) -> &Arc<MeshTransport> {
        &self.transport
    }

    pub fn shard(&self, sid: usize) -> &Arc<ShardStore> {
        &self.shards[sid]
    }

    pub fn proxy(&self, sid: usize, idx: usize) -> &Arc<Proxy> {
        &self.nodes[sid].proxies[idx]
    }

    pub fn engines(&self, sid: usize) -> &[Arc<Engine>] {
        &self.nodes[sid].engines
    }

    /// Poll every engine once; returns whether any did work. Only meaningful
    /// when engine threads are not running.
    pub fn poll_all(&self) -> bool {
        let mut any = false;
        for node in &self.nodes {
            for engine in &node.engines {
                any |= engine.poll(&node.engines);
            }
        }
        any
    }

    /// Poll until `quiet_rounds` consecutive idle sweeps (or `max_rounds`
    /// total). Returns whether the cluster went quiet.
    pub fn run_until_quiet(&self, quiet_rounds: usize, max_rounds: usize) -> bool {
        let mut quiet = 0;
        for _ in 0..max_rounds {
            if self.poll_all() {
                quiet = 0;
            } else {
                quiet += 1;
                if quiet >= quiet_rounds {
                    return true;
                }
            }
        }
        false
    }

    /// Stop and join the engine threads.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(n: usize) -> Vec<Arc<ShardStore>> {
        (0..n).map(|sid| Arc::new(ShardStore::new(sid, n))).collect()
    }

    #[test]
    fn test_build_validates_shard_count() {
        let cfg = ClusterConfig::new(3, 1, 2);
        assert!(LocalCluster::build(cfg, shards(2)).is_err());
    }

    #[test]
    fn test_build_creates_full_topology() {
        let cfg = ClusterConfig::new(2, 2, 3);
        let cluster = LocalCluster::build(cfg, shards(2)).unwrap();
        for sid in 0..2 {
            assert_eq!(cluster.engines(sid).len(), 3);
            assert_eq!(cluster.nodes[sid].proxies.len(), 2);
            assert_eq!(cluster.engines(sid)[0].tid(), 2);
        }
    }

    #[test]
    fn test_idle_cluster_goes_quiet() {
        let cfg = ClusterConfig::new(1, 1, 2);
        let cluster = LocalCluster::build(cfg, shards(1)).unwrap();
        assert!(cluster.run_until_quiet(3, 100));
    }
}
