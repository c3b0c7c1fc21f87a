// Cluster configuration consumed by the query execution core.
//
// The bootstrap loader (out of scope here) fills this struct; the core only
// reads it. `validate` rejects values the 8-bit worker identity encoding
// cannot represent.

use crate::error::{MeshError, Result};

/// Largest server or worker index representable in a query id.
pub const MAX_WORKER_INDEX: usize = 256;

/// Configuration knobs read by engines, proxies and the bootstrap.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Number of server nodes in the deployment.
    pub num_servers: usize,
    /// Proxy workers per server, occupying tids `[0, num_proxies)`.
    pub num_proxies: usize,
    /// Engine workers per server, occupying tids `[num_proxies, num_proxies + num_engines)`.
    pub num_engines: usize,
    /// Minimum intermediate row count for preferring scatter over in-place execution.
    pub rdma_threshold: usize,
    /// Index-striping denominator; must equal `num_engines`.
    pub mt_threshold: usize,
    /// Whether the transport substrate supports remote edge reads.
    pub use_rdma: bool,
    /// Let an idle engine service its paired neighbor's queue.
    pub enable_workstealing: bool,
    /// Accept attribute patterns (`pred_type > 0`).
    pub enable_vattr: bool,
    /// Suppress result printing at the proxy.
    pub silent: bool,
    /// Maximum result rows the proxy renders.
    pub max_print_row: usize,
    /// Depth of each per-worker receive ring in the in-process mesh.
    pub transport_capacity: usize,
}

impl ClusterConfig {
    /// Configuration for a cluster of `num_servers` nodes with the given
    /// worker counts; the striping denominator follows the engine count.
    pub fn new(num_servers: usize, num_proxies: usize, num_engines: usize) -> Self {
        Self {
            num_servers,
            num_proxies,
            num_engines,
            mt_threshold: num_engines,
            ..Self::default()
        }
    }

    /// Total workers per server (proxies + engines).
    pub fn workers_per_server(&self) -> usize {
        self.num_proxies + self.num_engines
    }

    /// Whether `tid` belongs to an engine worker.
    pub fn is_engine_tid(&self, tid: usize) -> bool {
        tid >= self.num_proxies && tid < self.workers_per_server()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_servers == 0 || self.num_servers > MAX_WORKER_INDEX {
            return Err(MeshError::Configuration(format!(
                "num_servers must be in 1..={}, got {}",
                MAX_WORKER_INDEX, self.num_servers
            )));
        }
        if self.num_proxies == 0 || self.num_engines == 0 {
            return Err(MeshError::Configuration(
                "each server needs at least one proxy and one engine".to_string(),
            ));
        }
        if self.workers_per_server() > MAX_WORKER_INDEX {
            return Err(MeshError::Configuration(format!(
                "at most {} workers per server, got {}",
                MAX_WORKER_INDEX,
                self.workers_per_server()
            )));
        }
        if self.mt_threshold != self.num_engines {
            return Err(MeshError::Configuration(format!(
                "mt_threshold ({}) must equal num_engines ({})",
                self.mt_threshold, self.num_engines
            )));
        }
        if self.transport_capacity == 0 {
            return Err(MeshError::Configuration(
                "transport_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_servers: 1,
            num_proxies: 1,
            num_engines: 2,
            rdma_threshold: 300,
            mt_threshold: 2,
            use_rdma: true,
            enable_workstealing: false,
            enable_vattr: false,
            silent: false,
            max_print_row: 10,
            transport_capacity: 1024,
        }
    }
}
