// Row-level filter evaluation.
//
// Filters run when a pattern group finishes, before the blind-clear and the
// reply. Comparison is over identifiers; value-level filtering belongs to
// the dictionary collaborator and is out of scope for the core.

use crate::error::{MeshError, Result};
use crate::query::{CompareOp, Filter, GraphId, ResultTable, SparqlQuery, Term};

fn term_value(result: &ResultTable, row: usize, term: &Term) -> Result<GraphId> {
    match term {
        Term::Constant(c) => Ok(*c),
        Term::Variable(v) => match result.binding(*v) {
            Some(b) if b.attr_type.is_none() => Ok(result.get(row, b.col)),
            Some(_) => Err(MeshError::UnsupportedPattern(format!(
                "filter over attribute variable {}",
                v
            ))),
            None => Err(MeshError::UnsupportedPattern(format!(
                "filter over unbound variable {}",
                v
            ))),
        },
    }
}

fn eval(filter: &Filter, result: &ResultTable, row: usize) -> Result<bool> {
    match filter {
        Filter::Not(inner) => Ok(!eval(inner, result, row)?),
        Filter::And(a, b) => Ok(eval(a, result, row)? && eval(b, result, row)?),
        Filter::Or(a, b) => Ok(eval(a, result, row)? || eval(b, result, row)?),
        Filter::Compare { op, lhs, rhs } => {
            let l = term_value(result, row, lhs)?;
            let r = term_value(result, row, rhs)?;
            Ok(match op {
                CompareOp::Eq => l == r,
                CompareOp::Ne => l != r,
                CompareOp::Lt => l < r,
                CompareOp::Le => l <= r,
                CompareOp::Gt => l > r,
                CompareOp::Ge => l >= r,
            })
        }
    }
}

/// Drop rows failing any of the group's filters.
pub fn apply_filters(q: &mut SparqlQuery) -> Result<()> {
    if q.pattern_group.filters.is_empty() {
        return Ok(());
    }

    let filters = std::mem::take(&mut q.pattern_group.filters);
    let mut table = Vec::new();
    let mut attr_table = Vec::new();
    let mut outcome = Ok(());
    'rows: for i in 0..q.result.rows() {
        for filter in &filters {
            match eval(filter, &q.result, i) {
                Ok(true) => {}
                Ok(false) => continue 'rows,
                Err(e) => {
                    outcome = Err(e);
                    break 'rows;
                }
            }
        }
        q.result.append_row_to(i, &mut table);
        if q.result.attr_col_num > 0 {
            q.result.append_attr_row_to(i, &mut attr_table);
        }
    }
    q.pattern_group.filters = filters;
    outcome?;

    q.result.table = table;
    q.result.attr_table = attr_table;
    q.result.sync_row_num();
    Ok(())
}
