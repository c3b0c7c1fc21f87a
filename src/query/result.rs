// Intermediate result tables.
//
// A result is a dense row-major matrix of graph ids plus a parallel matrix
// of attribute values, with an ordered variable-to-column map. The map's
// order is the order of first binding, which downstream merges rely on.

use crate::query::{AttrType, AttrValue, GraphId};
use serde::{Deserialize, Serialize};

/// How a pattern position relates to the current result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Non-negative id known at plan time.
    Const,
    /// Pattern variable already bound to a column.
    Known,
    /// Pattern variable not yet bound.
    Unknown,
}

/// One entry of the variable-to-column map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarBinding {
    pub var: GraphId,
    pub col: usize,
    /// `Some` when the variable resolves into the attribute matrix.
    pub attr_type: Option<AttrType>,
}

/// Dense intermediate result of a partially executed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub col_num: usize,
    pub attr_col_num: usize,
    /// Authoritative row count on the wire; kept in sync with the id table
    /// by every mutation and preserved across a blind clear.
    pub row_num: usize,
    /// Discard the data before the final reply; the requestor only needs
    /// cardinality.
    pub blind: bool,
    /// Number of distinct pattern variables of the owning query.
    pub nvars: usize,
    pub table: Vec<GraphId>,
    pub attr_table: Vec<AttrValue>,
    v2c: Vec<VarBinding>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row count derived from the id table; while the table holds only
    /// attribute columns (a pure attribute fetch), the count is carried by
    /// the attribute table alone.
    pub fn rows(&self) -> usize {
        if self.col_num == 0 {
            self.attr_table.len() / self.attr_col_num.max(1)
        } else {
            self.table.len() / self.col_num
        }
    }

    /// Refresh `row_num` after a mutation.
    pub fn sync_row_num(&mut self) {
        self.row_num = self.rows();
    }

    pub fn get(&self, row: usize, col: usize) -> GraphId {
        self.table[row * self.col_num + col]
    }

    pub fn get_attr(&self, row: usize, col: usize) -> &AttrValue {
        &self.attr_table[row * self.attr_col_num + col]
    }

    /// Column of `var`, regardless of which matrix it resolves into.
    pub fn var2col(&self, var: GraphId) -> Option<usize> {
        self.binding(var).map(|b| b.col)
    }

    pub fn binding(&self, var: GraphId) -> Option<&VarBinding> {
        self.v2c.iter().find(|b| b.var == var)
    }

    /// Bind `var` to id column `col`. First bindings are appended so the map
    /// preserves binding order; rebinding an existing variable is a no-op.
    pub fn add_var2col(&mut self, var: GraphId, col: usize) {
        if self.binding(var).is_none() {
            self.v2c.push(VarBinding {
                var,
                col,
                attr_type: None,
            });
        }
    }

    /// Bind `var` to attribute column `col` with the observed value type.
    pub fn add_attr_var2col(&mut self, var: GraphId, col: usize, attr_type: AttrType) {
        if self.binding(var).is_none() {
            self.v2c.push(VarBinding {
                var,
                col,
                attr_type: Some(attr_type),
            });
        }
    }

    /// Bindings in order of first binding.
    pub fn bindings(&self) -> &[VarBinding] {
        &self.v2c
    }

    /// Classify a pattern position against the current bindings.
    pub fn var_kind(&self, id: GraphId) -> VarKind {
        if id >= 0 {
            VarKind::Const
        } else if self.binding(id).is_some() {
            VarKind::Known
        } else {
            VarKind::Unknown
        }
    }

    /// Append the id cells of row `row` to `out`.
    pub fn append_row_to(&self, row: usize, out: &mut Vec<GraphId>) {
        let start = row * self.col_num;
        out.extend_from_slice(&self.table[start..start + self.col_num]);
    }

    /// Append the attribute cells of row `row` to `out`.
    pub fn append_attr_row_to(&self, row: usize, out: &mut Vec<AttrValue>) {
        let start = row * self.attr_col_num;
        out.extend_from_slice(&self.attr_table[start..start + self.attr_col_num]);
    }

    /// Copy the schema (column counts, bindings, flags) of `other`, leaving
    /// the data untouched. Sibling sub-query replies share one schema by
    /// construction, so merges overwrite rather than reconcile.
    pub fn adopt_schema(&mut self, other: &ResultTable) {
        self.col_num = other.col_num;
        self.attr_col_num = other.attr_col_num;
        self.blind = other.blind;
        self.nvars = other.nvars;
        self.v2c = other.v2c.clone();
    }

    /// Append the rows of `other` and account for its (possibly blinded)
    /// row count.
    pub fn append_result(&mut self, other: &ResultTable) {
        self.table.extend_from_slice(&other.table);
        self.attr_table.extend_from_slice(&other.attr_table);
        self.row_num += other.row_num;
    }

    /// Drop the data while keeping the row count, for blind replies.
    pub fn clear_data(&mut self) {
        self.table.clear();
        self.attr_table.clear();
    }
}
