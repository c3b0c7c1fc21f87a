// Fork-join dispatcher: decides between in-place continuation and scatter,
// and partitions the intermediate result into per-server sub-queries.

use crate::config::ClusterConfig;
use crate::error::{MeshError, Result};
use crate::query::SparqlQuery;
use crate::store::hash_mod;

/// Whether the next pattern should scatter across the cluster.
///
/// With a remote-read-capable transport, scatter pays off only when the rows
/// are not already partitioned by the next subject and there are enough of
/// them; without it, every variable-subject pattern must scatter because the
/// edges of remote vertices cannot be read in place. Constant subjects never
/// scatter: their rows carry no partitioning column.
pub fn need_fork_join(cfg: &ClusterConfig, q: &SparqlQuery) -> bool {
    let start = q.current_pattern().subject;
    let partitionable = start < 0
        && q
            .result
            .binding(start)
            .map_or(false, |b| b.attr_type.is_none());
    if !partitionable {
        return false;
    }
    if !cfg.use_rdma {
        return true;
    }
    q.local_var != start && q.result.rows() >= cfg.rdma_threshold
}

/// One empty sub-query per server, inheriting the parent's plan position and
/// result schema, with the parent's rows dealt to `hash(row[subject]) mod N`.
pub fn generate_sub_queries(q: &SparqlQuery, num_servers: usize) -> Result<Vec<SparqlQuery>> {
    let start = q.current_pattern().subject;
    let col = q.result.var2col(start).ok_or_else(|| {
        MeshError::UnsupportedPattern(format!("scatter subject {} is not bound", start))
    })?;

    let mut subs: Vec<SparqlQuery> = (0..num_servers)
        .map(|_| {
            let mut sub = SparqlQuery::new(q.pattern_group.clone());
            sub.pid = q.id;
            sub.id = q.id;
            sub.step = q.step;
            sub.corun_step = q.corun_step;
            sub.fetch_step = q.fetch_step;
            sub.local_var = start;
            sub.required_vars = q.required_vars.clone();
            sub.silent = q.silent;
            sub.result.adopt_schema(&q.result);
            sub
        })
        .collect();

    for i in 0..q.result.rows() {
        let dst = hash_mod(q.result.get(i, col), num_servers);
        q.result.append_row_to(i, &mut subs[dst].result.table);
        if q.result.attr_col_num > 0 {
            q.result.append_attr_row_to(i, &mut subs[dst].result.attr_table);
        }
    }
    for sub in &mut subs {
        sub.result.sync_row_num();
    }

    Ok(subs)
}
