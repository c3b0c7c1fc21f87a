// Co-run optimizer: executes a bounded sub-range of the pattern group as a
// local probe and semi-joins the intermediate result against it, pruning
// rows before they are scattered.
//
// The sub-range's variables are remapped to dense negative ids scoped to the
// probe. Variables the probe shares with the parent form the join key; the
// probe's fresh variables participate in the probe only. The probe runs
// entirely on the local engine and never scatters.

use crate::engine::step::{self, StepCtx};
use crate::error::{MeshError, Result};
use crate::query::{GraphId, Pattern, PatternGroup, SparqlQuery};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// Remap a sub-range id: constants pass through, variables get dense probe
/// ids from `-1` downward in order of first appearance.
fn remap(id: GraphId, sub_pvars: &mut HashMap<GraphId, GraphId>) -> GraphId {
    if id >= 0 {
        return id;
    }
    if let Some(&new_id) = sub_pvars.get(&id) {
        return new_id;
    }
    let new_id = -((sub_pvars.len() + 1) as GraphId);
    sub_pvars.insert(id, new_id);
    new_id
}

/// Sort a row-major table lexicographically by row.
fn sort_tuples(cols: usize, table: &mut Vec<GraphId>) {
    let mut rows: Vec<&[GraphId]> = table.chunks(cols).collect();
    rows.sort_unstable();
    let sorted: Vec<GraphId> = rows.into_iter().flatten().copied().collect();
    *table = sorted;
}

/// Binary-search a sorted row-major table for `probe`.
fn tuple_contains(cols: usize, table: &[GraphId], probe: &[GraphId]) -> bool {
    let n = table.len() / cols;
    let mut lo = 0;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let row = &table[mid * cols..(mid + 1) * cols];
        if row < probe {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo < n && &table[lo * cols..(lo + 1) * cols] == probe
}

/// Run the `[corun_step, fetch_step)` probe and keep only parent rows whose
/// shared-variable projection matches; advances the query to `fetch_step`.
///
/// Bindings introduced inside the range are not merged back: plans must not
/// reference them past `fetch_step`.
pub fn do_corun(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let corun_step = q.corun_step;
    let fetch_step = q.fetch_step;
    if fetch_step <= corun_step || fetch_step > q.pattern_group.patterns.len() {
        return Err(MeshError::UnsupportedPattern(format!(
            "invalid co-run range [{}, {})",
            corun_step, fetch_step
        )));
    }

    let started = Instant::now();

    // distinct seed values of the range's first subject
    let seed_var = q.pattern(corun_step).subject;
    let seed_col = step::id_col(q, seed_var)?;
    let uniq: BTreeSet<GraphId> = (0..q.result.rows())
        .map(|i| q.result.get(i, seed_col))
        .collect();

    // the probe's pattern group, remapped to probe scope
    let mut sub_pvars: HashMap<GraphId, GraphId> = HashMap::new();
    let mut sub_patterns = Vec::new();
    for i in corun_step..fetch_step {
        let p = q.pattern(i);
        let subject = remap(p.subject, &mut sub_pvars);
        let predicate = remap(p.predicate, &mut sub_pvars);
        let object = remap(p.object, &mut sub_pvars);
        sub_patterns.push(Pattern::new(subject, predicate, p.direction, object));
    }

    // probe query seeded with the distinct set as its single column, bound
    // to the remapped id of the seed variable
    let mut sub = SparqlQuery::new(PatternGroup::from_patterns(sub_patterns));
    sub.result.nvars = sub_pvars.len();
    sub.result.table = uniq.into_iter().collect();
    sub.result.col_num = 1;
    sub.result.add_var2col(sub_pvars[&seed_var], 0);
    sub.result.blind = false;
    sub.result.sync_row_num();
    let prepared = Instant::now();

    while !sub.is_finished() {
        step::execute_one_step(ctx, &mut sub)?;
    }
    let executed = Instant::now();
    let sub_result = sub.result;

    // join key: remapped variables that are id-bound on both sides, in
    // probe-id order for determinism
    let mut shared: Vec<(GraphId, GraphId)> = sub_pvars.iter().map(|(&o, &r)| (r, o)).collect();
    shared.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    let mut parent_cols = Vec::new();
    let mut probe_cols = Vec::new();
    for (renamed, orig) in shared {
        let parent_col = match q.result.binding(orig) {
            Some(b) if b.attr_type.is_none() => b.col,
            _ => continue,
        };
        if let Some(probe_col) = sub_result.var2col(renamed) {
            parent_cols.push(parent_col);
            probe_cols.push(probe_col);
        }
    }
    let key_len = parent_cols.len();

    let before = q.result.rows();
    let mut table = Vec::new();
    let mut attr_table = Vec::new();

    if sub_result.col_num > 2 {
        // large probes: sort the key projection and binary-search each row
        let mut keys = Vec::with_capacity(sub_result.rows() * key_len);
        for i in 0..sub_result.rows() {
            for &c in &probe_cols {
                keys.push(sub_result.get(i, c));
            }
        }
        sort_tuples(key_len, &mut keys);
        let mut probe = vec![0; key_len];
        for i in 0..q.result.rows() {
            for (k, &c) in parent_cols.iter().enumerate() {
                probe[k] = q.result.get(i, c);
            }
            if tuple_contains(key_len, &keys, &probe) {
                q.result.append_row_to(i, &mut table);
                if q.result.attr_col_num > 0 {
                    q.result.append_attr_row_to(i, &mut attr_table);
                }
            }
        }
    } else {
        // small probes: a set of key tuples
        let mut matches: HashSet<Vec<GraphId>> = HashSet::new();
        for i in 0..sub_result.rows() {
            matches.insert(probe_cols.iter().map(|&c| sub_result.get(i, c)).collect());
        }
        let mut probe = vec![0; key_len];
        for i in 0..q.result.rows() {
            for (k, &c) in parent_cols.iter().enumerate() {
                probe[k] = q.result.get(i, c);
            }
            if matches.contains(&probe) {
                q.result.append_row_to(i, &mut table);
                if q.result.attr_col_num > 0 {
                    q.result.append_attr_row_to(i, &mut attr_table);
                }
            }
        }
    }
    let joined = Instant::now();

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.sync_row_num();
    q.step = fetch_step;

    debug!(
        prepare_us = (prepared - started).as_micros() as u64,
        probe_us = (executed - prepared).as_micros() as u64,
        join_us = (joined - executed).as_micros() as u64,
        "co-run kept {} of {} rows",
        q.result.rows(),
        before
    );
    Ok(())
}
