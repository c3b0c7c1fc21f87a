// Step executor: advances a query by one triple pattern against the graph.
//
// Dispatch is a match over the (subject kind, object kind) pair, split by
// predicate class: known predicate, attribute predicate, and (under the
// `versatile` feature) variable predicate. Unsupported combinations fail
// the query rather than the worker.

use crate::config::ClusterConfig;
use crate::error::{MeshError, Result};
use crate::query::{AttrType, GraphId, SparqlQuery, VarKind, NO_LOCAL_VAR};
use crate::store::DistGraph;

/// Execution context of one engine worker.
pub struct StepCtx<'a> {
    pub graph: &'a DistGraph,
    /// Executing worker's tid (the substrate's per-worker read context).
    pub tid: usize,
    /// Owning engine's index, used for index striping. Differs from the
    /// executing engine's own index only during work-stealing.
    pub owner_index: usize,
    pub cfg: &'a ClusterConfig,
}

/// Column of `var` in the id matrix; attribute-bound and unbound variables
/// are plan errors at this point.
pub(crate) fn id_col(q: &SparqlQuery, var: GraphId) -> Result<usize> {
    match q.result.binding(var) {
        Some(b) if b.attr_type.is_none() => Ok(b.col),
        Some(_) => Err(MeshError::UnsupportedPattern(format!(
            "variable {} is bound to an attribute column",
            var
        ))),
        None => Err(MeshError::UnsupportedPattern(format!(
            "variable {} is not bound",
            var
        ))),
    }
}

/// Execute the pattern at `q.step`, incrementing `step` on success.
pub fn execute_one_step(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    if q.step == 0 && q.starts_from_index() {
        return index_to_unknown(ctx, q);
    }

    let pattern = q.current_pattern();

    // triple pattern with a variable predicate
    if pattern.predicate < 0 {
        #[cfg(feature = "versatile")]
        {
            return match (
                q.result.var_kind(pattern.subject),
                q.result.var_kind(pattern.object),
            ) {
                (VarKind::Const, VarKind::Unknown) => const_unknown_unknown(ctx, q),
                (VarKind::Known, VarKind::Unknown) => known_unknown_unknown(ctx, q),
                (s, o) => Err(MeshError::UnsupportedPattern(format!(
                    "variable predicate with {:?} subject and {:?} object",
                    s, o
                ))),
            };
        }
        #[cfg(not(feature = "versatile"))]
        {
            return Err(MeshError::UnsupportedFeature(
                "variable predicates require a build with the versatile feature".to_string(),
            ));
        }
    }

    // triple pattern with an attribute predicate
    if pattern.pred_type > 0 {
        if !ctx.cfg.enable_vattr {
            return Err(MeshError::UnsupportedFeature(
                "vertex attributes are disabled (enable_vattr)".to_string(),
            ));
        }
        return match (
            q.result.var_kind(pattern.subject),
            q.result.var_kind(pattern.object),
        ) {
            (VarKind::Const, VarKind::Unknown) => const_to_unknown_attr(ctx, q),
            (VarKind::Known, VarKind::Unknown) => known_to_unknown_attr(ctx, q),
            (s, o) => Err(MeshError::UnsupportedPattern(format!(
                "attribute pattern with {:?} subject and {:?} object",
                s, o
            ))),
        };
    }

    // triple pattern with a known predicate
    match (
        q.result.var_kind(pattern.subject),
        q.result.var_kind(pattern.object),
    ) {
        (VarKind::Const, VarKind::Unknown) => const_to_unknown(ctx, q),
        (VarKind::Known, VarKind::Unknown) => known_to_unknown(ctx, q),
        (VarKind::Known, VarKind::Known) => known_to_known(ctx, q),
        (VarKind::Known, VarKind::Const) => known_to_const(ctx, q),
        (VarKind::Const, o @ (VarKind::Const | VarKind::Known)) => {
            Err(MeshError::UnsupportedPattern(format!(
                "pattern from Const subject to {:?} object",
                o
            )))
        }
        (VarKind::Unknown, o) => Err(MeshError::UnsupportedPattern(format!(
            "pattern from Unknown subject to {:?} object",
            o
        ))),
    }
}

/// Emit the local-shard index entries of a class, striped by the owning
/// engine's index.
fn index_to_unknown(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    if q.result.col_num != 0 {
        return Err(MeshError::UnsupportedPattern(
            "index scan over a non-empty result".to_string(),
        ));
    }
    if pattern.object >= 0 {
        return Err(MeshError::UnsupportedPattern(
            "index scan must bind a pattern variable".to_string(),
        ));
    }

    let entries = ctx
        .graph
        .get_index_edges_local(ctx.tid, pattern.subject, pattern.direction);
    let mut table = Vec::new();
    let mut k = ctx.owner_index;
    while k < entries.len() {
        table.push(entries[k]);
        k += ctx.cfg.mt_threshold;
    }

    q.result.table = table;
    q.result.col_num = 1;
    q.result.add_var2col(pattern.object, 0);
    q.result.sync_row_num();
    q.step += 1;
    q.local_var = NO_LOCAL_VAR;
    Ok(())
}

fn const_to_unknown(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    if q.result.col_num != 0 {
        return Err(MeshError::UnsupportedPattern(
            "constant-start pattern over a non-empty result".to_string(),
        ));
    }

    q.result.table = ctx.graph.get_edges(
        ctx.tid,
        pattern.subject,
        pattern.direction,
        pattern.predicate,
    );
    q.result.col_num = 1;
    q.result.add_var2col(pattern.object, 0);
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

/// The a-priori value type of an attribute pattern.
fn attr_pattern_type(pred_type: i32) -> Result<AttrType> {
    AttrType::from_pred_type(pred_type).ok_or_else(|| {
        MeshError::UnsupportedPattern(format!("unknown attribute type discriminator {}", pred_type))
    })
}

fn const_to_unknown_attr(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    if pattern.direction != crate::query::Direction::Out {
        return Err(MeshError::UnsupportedPattern(
            "attribute patterns read outward".to_string(),
        ));
    }
    let expected = attr_pattern_type(pattern.pred_type)?;

    let mut attr_table = Vec::new();
    if let Some(value) =
        ctx.graph
            .get_vertex_attr(ctx.tid, pattern.subject, pattern.direction, pattern.predicate)
    {
        let found = value.attr_type();
        if found != expected {
            return Err(MeshError::InconsistentAttrType { expected, found });
        }
        attr_table.push(value);
    }

    q.result.attr_table = attr_table;
    q.result.add_attr_var2col(pattern.object, q.result.attr_col_num, expected);
    q.result.attr_col_num += 1;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

fn known_to_unknown(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    let col = id_col(q, pattern.subject)?;

    let mut table = Vec::with_capacity(q.result.table.len());
    let mut attr_table = Vec::new();
    for i in 0..q.result.rows() {
        let prev = q.result.get(i, col);
        for target in ctx
            .graph
            .get_edges(ctx.tid, prev, pattern.direction, pattern.predicate)
        {
            q.result.append_row_to(i, &mut table);
            if q.result.attr_col_num > 0 {
                q.result.append_attr_row_to(i, &mut attr_table);
            }
            table.push(target);
        }
    }

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.add_var2col(pattern.object, q.result.col_num);
    q.result.col_num += 1;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

fn known_to_unknown_attr(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    if pattern.direction != crate::query::Direction::Out {
        return Err(MeshError::UnsupportedPattern(
            "attribute patterns read outward".to_string(),
        ));
    }
    let expected = attr_pattern_type(pattern.pred_type)?;
    let col = id_col(q, pattern.subject)?;

    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..q.result.rows() {
        let prev = q.result.get(i, col);
        // rows without a value are dropped
        if let Some(value) =
            ctx.graph
                .get_vertex_attr(ctx.tid, prev, pattern.direction, pattern.predicate)
        {
            let found = value.attr_type();
            if found != expected {
                return Err(MeshError::InconsistentAttrType { expected, found });
            }
            q.result.append_row_to(i, &mut table);
            q.result.append_attr_row_to(i, &mut attr_table);
            attr_table.push(value);
        }
    }

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result
        .add_attr_var2col(pattern.object, q.result.attr_col_num, expected);
    q.result.attr_col_num += 1;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

fn known_to_known(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    let scol = id_col(q, pattern.subject)?;
    let ocol = id_col(q, pattern.object)?;

    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..q.result.rows() {
        let prev = q.result.get(i, scol);
        let end = q.result.get(i, ocol);
        let targets = ctx
            .graph
            .get_edges(ctx.tid, prev, pattern.direction, pattern.predicate);
        if targets.contains(&end) {
            q.result.append_row_to(i, &mut table);
            if q.result.attr_col_num > 0 {
                q.result.append_attr_row_to(i, &mut attr_table);
            }
        }
    }

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

fn known_to_const(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    let pattern = q.current_pattern();
    let scol = id_col(q, pattern.subject)?;

    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..q.result.rows() {
        let prev = q.result.get(i, scol);
        let targets = ctx
            .graph
            .get_edges(ctx.tid, prev, pattern.direction, pattern.predicate);
        if targets.contains(&pattern.object) {
            q.result.append_row_to(i, &mut table);
            if q.result.attr_col_num > 0 {
                q.result.append_attr_row_to(i, &mut attr_table);
            }
        }
    }

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

/// Enumerate the predicates of a constant subject, then the targets of each,
/// emitting a `(predicate, object)` two-column table.
#[cfg(feature = "versatile")]
fn const_unknown_unknown(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    use crate::query::PREDICATE_ID;

    let pattern = q.current_pattern();
    if q.result.col_num != 0 {
        return Err(MeshError::UnsupportedPattern(
            "constant-start pattern over a non-empty result".to_string(),
        ));
    }

    let predicates = ctx.graph.get_edges(
        ctx.tid,
        pattern.subject,
        pattern.direction,
        PREDICATE_ID,
    );
    let mut table = Vec::new();
    for pid in predicates {
        for target in ctx
            .graph
            .get_edges(ctx.tid, pattern.subject, pattern.direction, pid)
        {
            table.push(pid);
            table.push(target);
        }
    }

    q.result.table = table;
    q.result.col_num = 2;
    q.result.add_var2col(pattern.predicate, 0);
    q.result.add_var2col(pattern.object, 1);
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}

/// Row-wise generalization of [`const_unknown_unknown`].
#[cfg(feature = "versatile")]
fn known_unknown_unknown(ctx: &StepCtx, q: &mut SparqlQuery) -> Result<()> {
    use crate::query::PREDICATE_ID;

    let pattern = q.current_pattern();
    let col = id_col(q, pattern.subject)?;

    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..q.result.rows() {
        let prev = q.result.get(i, col);
        let predicates = ctx
            .graph
            .get_edges(ctx.tid, prev, pattern.direction, PREDICATE_ID);
        for pid in predicates {
            for target in ctx.graph.get_edges(ctx.tid, prev, pattern.direction, pid) {
                q.result.append_row_to(i, &mut table);
                if q.result.attr_col_num > 0 {
                    q.result.append_attr_row_to(i, &mut attr_table);
                }
                table.push(pid);
                table.push(target);
            }
        }
    }

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.add_var2col(pattern.predicate, q.result.col_num);
    q.result.add_var2col(pattern.object, q.result.col_num + 1);
    q.result.col_num += 2;
    q.result.sync_row_num();
    q.step += 1;
    Ok(())
}
