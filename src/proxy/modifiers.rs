// Final solution modifiers, applied by the proxy once every reply for a
// query has been merged: optional left-joins, DISTINCT, ORDER BY,
// OFFSET/LIMIT and projection onto the required variables.

use crate::error::{MeshError, Result};
use crate::query::{GraphId, ResultTable, SparqlQuery, DUMMY_ID};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Left-join an optional branch's result into the main result on their
/// shared variables. Unmatched rows keep the main bindings and fill the
/// branch-only columns with [`DUMMY_ID`]; branch attribute columns are not
/// carried.
pub fn left_join_optional(main: &mut ResultTable, branch: &ResultTable) {
    if main.col_num == 0 {
        return;
    }

    let mut shared: Vec<(usize, usize)> = Vec::new(); // (main col, branch col)
    let mut extras: Vec<(GraphId, usize)> = Vec::new(); // (var, branch col)
    for b in branch.bindings() {
        if b.attr_type.is_some() {
            continue;
        }
        match main.binding(b.var) {
            Some(m) if m.attr_type.is_none() => shared.push((m.col, b.col)),
            _ => extras.push((b.var, b.col)),
        }
    }

    let mut by_key: HashMap<Vec<GraphId>, Vec<usize>> = HashMap::new();
    for i in 0..branch.rows() {
        let key: Vec<GraphId> = shared.iter().map(|&(_, bc)| branch.get(i, bc)).collect();
        by_key.entry(key).or_default().push(i);
    }

    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..main.rows() {
        let key: Vec<GraphId> = shared.iter().map(|&(mc, _)| main.get(i, mc)).collect();
        match by_key.get(&key) {
            Some(matches) => {
                for &bi in matches {
                    main.append_row_to(i, &mut table);
                    if main.attr_col_num > 0 {
                        main.append_attr_row_to(i, &mut attr_table);
                    }
                    for &(_, bc) in &extras {
                        table.push(branch.get(bi, bc));
                    }
                }
            }
            None => {
                main.append_row_to(i, &mut table);
                if main.attr_col_num > 0 {
                    main.append_attr_row_to(i, &mut attr_table);
                }
                for _ in &extras {
                    table.push(DUMMY_ID);
                }
            }
        }
    }

    main.table = table;
    main.attr_table = attr_table;
    for (k, &(var, _)) in extras.iter().enumerate() {
        main.add_var2col(var, main.col_num + k);
    }
    main.col_num += extras.len();
    main.sync_row_num();
}

fn dedup_rows(result: &mut ResultTable) {
    if result.col_num == 0 {
        return;
    }
    let mut seen: HashSet<Vec<GraphId>> = HashSet::new();
    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    for i in 0..result.rows() {
        let mut row = Vec::with_capacity(result.col_num);
        result.append_row_to(i, &mut row);
        if seen.insert(row) {
            result.append_row_to(i, &mut table);
            if result.attr_col_num > 0 {
                result.append_attr_row_to(i, &mut attr_table);
            }
        }
    }
    result.table = table;
    result.attr_table = attr_table;
    result.sync_row_num();
}

fn sort_rows(q: &mut SparqlQuery) -> Result<()> {
    let mut keys = Vec::with_capacity(q.orders.len());
    for order in &q.orders {
        match q.result.binding(order.var) {
            Some(b) if b.attr_type.is_none() => keys.push((b.col, order.descending)),
            _ => {
                return Err(MeshError::UnsupportedPattern(format!(
                    "ordering by variable {} with no id binding",
                    order.var
                )))
            }
        }
    }

    let mut rows: Vec<usize> = (0..q.result.rows()).collect();
    rows.sort_by(|&a, &b| {
        for &(col, descending) in &keys {
            let va = q.result.get(a, col);
            let vb = q.result.get(b, col);
            let ord = if descending { vb.cmp(&va) } else { va.cmp(&vb) };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    let mut table = Vec::with_capacity(q.result.table.len());
    let mut attr_table = Vec::with_capacity(q.result.attr_table.len());
    for &i in &rows {
        q.result.append_row_to(i, &mut table);
        if q.result.attr_col_num > 0 {
            q.result.append_attr_row_to(i, &mut attr_table);
        }
    }
    q.result.table = table;
    q.result.attr_table = attr_table;
    Ok(())
}

fn apply_offset_limit(result: &mut ResultTable, offset: usize, limit: i64) {
    let rows = result.rows();
    let start = offset.min(rows);
    let end = if limit < 0 {
        rows
    } else {
        (start + limit as usize).min(rows)
    };

    result.table = result.table[start * result.col_num..end * result.col_num].to_vec();
    if result.attr_col_num > 0 {
        result.attr_table = result.attr_table[start * result.attr_col_num..end * result.attr_col_num].to_vec();
    }
    result.sync_row_num();
}

fn project(q: &mut SparqlQuery) -> Result<()> {
    if q.required_vars.is_empty() {
        return Ok(());
    }

    let mut id_cols = Vec::new();
    let mut attr_cols = Vec::new();
    for &var in &q.required_vars {
        match q.result.binding(var) {
            Some(b) => match b.attr_type {
                None => id_cols.push((var, b.col)),
                Some(t) => attr_cols.push((var, b.col, t)),
            },
            None => {
                return Err(MeshError::UnsupportedPattern(format!(
                    "projection of unbound variable {}",
                    var
                )))
            }
        }
    }

    let mut projected = ResultTable::new();
    projected.blind = q.result.blind;
    projected.nvars = q.result.nvars;
    for i in 0..q.result.rows() {
        for &(_, col) in &id_cols {
            projected.table.push(q.result.get(i, col));
        }
        for &(_, col, _) in &attr_cols {
            projected.attr_table.push(q.result.get_attr(i, col).clone());
        }
    }
    projected.col_num = id_cols.len();
    projected.attr_col_num = attr_cols.len();
    for (k, &(var, _)) in id_cols.iter().enumerate() {
        projected.add_var2col(var, k);
    }
    for (k, &(var, _, t)) in attr_cols.iter().enumerate() {
        projected.add_attr_var2col(var, k, t);
    }
    projected.sync_row_num();
    q.result = projected;
    Ok(())
}

/// Apply DISTINCT, ORDER BY, OFFSET/LIMIT and projection, in that order.
/// Blinded results carry no data and are returned untouched.
pub fn finalize(q: &mut SparqlQuery) -> Result<()> {
    if q.result.blind {
        return Ok(());
    }
    if q.distinct {
        dedup_rows(&mut q.result);
    }
    if !q.orders.is_empty() {
        sort_rows(q)?;
    }
    if q.offset > 0 || q.limit >= 0 {
        apply_offset_limit(&mut q.result, q.offset, q.limit);
    }
    project(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Order, PatternGroup};

    fn pairs(rows: &[(GraphId, GraphId)]) -> SparqlQuery {
        let mut q = SparqlQuery::new(PatternGroup::default());
        for &(a, b) in rows {
            q.result.table.push(a);
            q.result.table.push(b);
        }
        q.result.col_num = 2;
        q.result.add_var2col(-2, 0);
        q.result.add_var2col(-3, 1);
        q.result.sync_row_num();
        q
    }

    #[test]
    fn test_distinct_keeps_first_occurrence() {
        let mut q = pairs(&[(1, 2), (3, 4), (1, 2), (3, 5)]);
        q.distinct = true;
        finalize(&mut q).unwrap();
        assert_eq!(q.result.table, vec![1, 2, 3, 4, 3, 5]);
    }

    #[test]
    fn test_order_by_descending_then_limit() {
        let mut q = pairs(&[(1, 9), (3, 7), (2, 8)]);
        q.orders.push(Order::desc(-2));
        q.limit = 2;
        finalize(&mut q).unwrap();
        assert_eq!(q.result.table, vec![3, 7, 2, 8]);
        assert_eq!(q.result.row_num, 2);
    }

    #[test]
    fn test_offset_past_end_yields_empty() {
        let mut q = pairs(&[(1, 9), (2, 8)]);
        q.offset = 5;
        finalize(&mut q).unwrap();
        assert_eq!(q.result.row_num, 0);
        assert!(q.result.table.is_empty());
    }

    #[test]
    fn test_projection_reorders_columns() {
        let mut q = pairs(&[(1, 9), (2, 8)]);
        q.required_vars = vec![-3];
        finalize(&mut q).unwrap();
        assert_eq!(q.result.col_num, 1);
        assert_eq!(q.result.table, vec![9, 8]);
        assert_eq!(q.result.var2col(-3), Some(0));
        assert_eq!(q.result.var2col(-2), None);
    }

    #[test]
    fn test_projection_of_unbound_variable_fails() {
        let mut q = pairs(&[(1, 9)]);
        q.required_vars = vec![-9];
        assert!(finalize(&mut q).is_err());
    }

    #[test]
    fn test_left_join_fills_unmatched_with_dummy() {
        let mut main = pairs(&[(1, 9), (2, 8)]).result;
        // branch binds the shared ?x (-2) and a fresh ?z (-4)
        let mut branch = ResultTable::new();
        branch.table = vec![1, 100, 1, 101];
        branch.col_num = 2;
        branch.add_var2col(-2, 0);
        branch.add_var2col(-4, 1);
        branch.sync_row_num();

        left_join_optional(&mut main, &branch);
        assert_eq!(main.col_num, 3);
        assert_eq!(main.var2col(-4), Some(2));
        assert_eq!(
            main.table,
            vec![1, 9, 100, 1, 9, 101, 2, 8, DUMMY_ID]
        );
        assert_eq!(main.row_num, 3);
    }

    #[test]
    fn test_blind_result_skips_modifiers() {
        let mut q = pairs(&[(1, 9)]);
        q.result.blind = true;
        q.result.clear_data();
        q.result.row_num = 5;
        q.distinct = true;
        q.limit = 0;
        finalize(&mut q).unwrap();
        assert_eq!(q.result.row_num, 5);
    }
}
