// Query data model: the shared identifier space, triple patterns, pattern
// groups with their filter/union/optional sub-groups, and solution modifiers.
//
// The SPARQL text parser and the planner live outside this crate; they hand
// the core an already-encoded `PatternGroup` where every IRI and literal has
// been mapped to an integer id by the dictionary service.

pub mod coder;
pub mod request;
pub mod result;

pub use coder::QueryCoder;
#[cfg(feature = "dynamic-load")]
pub use request::GraphLoad;
pub use request::{FailureKind, QueryStatus, SparqlQuery};
pub use result::{ResultTable, VarKind};

use serde::{Deserialize, Serialize};

/// Identifier in the shared vertex/predicate/literal id space. Non-negative
/// ids are dictionary constants; negative ids are pattern variables scoped
/// to one query. Id `-1` is reserved (see [`NO_LOCAL_VAR`]); planners assign
/// variables from `-2` downward.
pub type GraphId = i64;

/// Selector for the predicate index.
pub const PREDICATE_ID: GraphId = 0;
/// Selector for the type index.
pub const TYPE_ID: GraphId = 1;
/// Not-a-binding sentinel (unmatched optional columns, unknown dictionary
/// entries in collaborators).
pub const DUMMY_ID: GraphId = i64::MIN;
/// `local_var` value meaning "current rows were not hash-partitioned".
pub const NO_LOCAL_VAR: GraphId = -1;
/// `corun_step`/`fetch_step` value disabling the co-run optimization.
pub const NO_CORUN: usize = usize::MAX;

/// Edge traversal direction relative to the pattern subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

/// Value type tag of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Int,
    Long,
    Float,
    Double,
    Str,
}

impl AttrType {
    /// Decode the `pred_type` discriminator of an attribute pattern
    /// (`0` means edge pattern and has no attribute type).
    pub fn from_pred_type(pred_type: i32) -> Option<AttrType> {
        match pred_type {
            1 => Some(AttrType::Int),
            2 => Some(AttrType::Long),
            3 => Some(AttrType::Float),
            4 => Some(AttrType::Double),
            5 => Some(AttrType::Str),
            _ => None,
        }
    }
}

/// A vertex attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Long(_) => AttrType::Long,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Double(_) => AttrType::Double,
            AttrValue::Str(_) => AttrType::Str,
        }
    }
}

/// One triple pattern of a pattern group.
///
/// `pred_type == 0` is an edge pattern; a positive value marks an attribute
/// pattern whose value type is known a priori (see [`AttrType::from_pred_type`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub subject: GraphId,
    pub predicate: GraphId,
    pub direction: Direction,
    pub object: GraphId,
    pub pred_type: i32,
}

impl Pattern {
    pub fn new(subject: GraphId, predicate: GraphId, direction: Direction, object: GraphId) -> Self {
        Self {
            subject,
            predicate,
            direction,
            object,
            pred_type: 0,
        }
    }

    pub fn with_pred_type(mut self, pred_type: i32) -> Self {
        self.pred_type = pred_type;
        self
    }
}

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operand of a filter comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// A pattern variable, resolved against the result table row-wise.
    Variable(GraphId),
    /// A dictionary constant.
    Constant(GraphId),
}

/// A filter expression over one result row. Comparison is over identifiers;
/// value-level filtering belongs to the dictionary collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Not(Box<Filter>),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Compare { op: CompareOp, lhs: Term, rhs: Term },
}

/// One ORDER BY key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub var: GraphId,
    pub descending: bool,
}

impl Order {
    pub fn asc(var: GraphId) -> Self {
        Self {
            var,
            descending: false,
        }
    }

    pub fn desc(var: GraphId) -> Self {
        Self {
            var,
            descending: true,
        }
    }
}

/// An ordered sequence of triple patterns plus its sub-groups.
///
/// Union branches are complete alternative groups (the upstream parser folds
/// the base patterns into every branch); optional branches are evaluated by
/// the proxy as left-joins against the main result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternGroup {
    pub patterns: Vec<Pattern>,
    pub filters: Vec<Filter>,
    pub unions: Vec<PatternGroup>,
    pub optionals: Vec<PatternGroup>,
}

impl PatternGroup {
    pub fn from_patterns(patterns: Vec<Pattern>) -> Self {
        Self {
            patterns,
            ..Self::default()
        }
    }
}
