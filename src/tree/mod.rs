//! Statement and plan tree data model.
//!
//! The parser, rewriter, and optimizer live outside this crate; what crosses
//! the boundary is the tagged tree shapes defined here. [`QueryTree`] is the
//! analyzed-and-rewritten form the validator walks for locks and
//! dependencies, [`PlannedStatement`] is the per-statement output of the
//! optimizer that a [`crate::cache::CompiledPlan`] carries.

pub mod visit;

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::types::{CatalogId, ObjectId, TypeId};

/// Broad classification of a statement, fixed at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Plannable DML/select statement.
    Query,
    /// Utility command (DDL and friends); carries no optimizer plan.
    Utility,
    /// BEGIN/COMMIT/ROLLBACK and family. Never invalidated: these must stay
    /// executable even inside an aborted transaction.
    TransactionControl,
    /// Whitespace-only source text. Always valid, plans to nothing.
    Empty,
}

impl StatementKind {
    /// True for transaction control statements.
    pub fn is_transaction_control(self) -> bool {
        matches!(self, StatementKind::TransactionControl)
    }
}

/// Output of the external raw parser, captured verbatim by a plan source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatement {
    /// Statement classification.
    pub kind: StatementKind,
    /// Constant command tag ("SELECT", "INSERT", ...), `None` iff the
    /// source text was empty.
    pub tag: Option<&'static str>,
}

impl RawStatement {
    /// Builds a raw statement of the given kind.
    pub fn new(kind: StatementKind, tag: &'static str) -> Self {
        Self {
            kind,
            tag: Some(tag),
        }
    }

    /// The empty statement.
    pub fn empty() -> Self {
        Self {
            kind: StatementKind::Empty,
            tag: None,
        }
    }
}

/// How a query references a relation; decides the lock mode needed to
/// execute or replan the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationRole {
    /// Target of an INSERT/UPDATE/DELETE.
    Result,
    /// Referenced under an explicit row-lock clause.
    RowMarked,
    /// Plain read reference.
    Referenced,
}

/// A single relation reference inside a query or plan tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationRef {
    /// The referenced relation.
    pub relation: ObjectId,
    /// How the statement uses it.
    pub role: RelationRole,
}

impl RelationRef {
    /// Plain read reference to `relation`.
    pub fn read(relation: ObjectId) -> Self {
        Self {
            relation,
            role: RelationRole::Referenced,
        }
    }

    /// Write-target reference to `relation`.
    pub fn result(relation: ObjectId) -> Self {
        Self {
            relation,
            role: RelationRole::Result,
        }
    }

    /// Row-marked reference to `relation`.
    pub fn row_marked(relation: ObjectId) -> Self {
        Self {
            relation,
            role: RelationRole::RowMarked,
        }
    }
}

/// One output column of a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column label.
    pub name: String,
    /// Column type.
    pub ty: TypeId,
}

impl Column {
    /// Builds a column descriptor.
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Ordered result row description of a statement list.
///
/// Compared for equality when a source was completed with a fixed result
/// shape; a mismatch after reanalysis is a hard error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowShape {
    /// Result columns in output order.
    pub columns: Vec<Column>,
}

impl RowShape {
    /// Derives the result shape of an analyzed statement list.
    ///
    /// Exactly one tuple-returning query yields its shape; zero or several
    /// mean the statement list returns no (single) row stream and has no
    /// shape to pin.
    pub fn of_queries(queries: &[QueryTree]) -> Option<RowShape> {
        let mut returning = queries.iter().filter(|q| !q.result_columns.is_empty());
        let first = returning.next()?;
        if returning.next().is_some() {
            return None;
        }
        Some(RowShape {
            columns: first.result_columns.clone(),
        })
    }
}

/// Analyzed-and-rewritten form of one statement.
///
/// Subqueries appearing in FROM/WITH are held in `subqueries`; subqueries
/// inside expressions (IN/EXISTS and friends) in `sublinks`. The visitor in
/// [`visit`] walks all of them.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTree {
    /// Statement classification.
    pub kind: StatementKind,
    /// Relations referenced at this query level.
    pub relations: Vec<RelationRef>,
    /// Subqueries in FROM and WITH.
    pub subqueries: Vec<QueryTree>,
    /// Subqueries nested in expressions.
    pub sublinks: Vec<QueryTree>,
    /// Output columns; empty when the statement returns no tuples.
    pub result_columns: Vec<Column>,
}

impl QueryTree {
    /// A plannable query over the given relations.
    pub fn query(relations: Vec<RelationRef>) -> Self {
        Self {
            kind: StatementKind::Query,
            relations,
            subqueries: Vec::new(),
            sublinks: Vec::new(),
            result_columns: Vec::new(),
        }
    }

    /// A utility statement (no plan, no locks scanned).
    pub fn utility() -> Self {
        Self {
            kind: StatementKind::Utility,
            relations: Vec::new(),
            subqueries: Vec::new(),
            sublinks: Vec::new(),
            result_columns: Vec::new(),
        }
    }

    /// Attaches output columns.
    pub fn with_columns(mut self, columns: Vec<Column>) -> Self {
        self.result_columns = columns;
        self
    }

    /// Nests a FROM/WITH subquery.
    pub fn with_subquery(mut self, sub: QueryTree) -> Self {
        self.subqueries.push(sub);
        self
    }

    /// Nests an expression sublink.
    pub fn with_sublink(mut self, sub: QueryTree) -> Self {
        self.sublinks.push(sub);
        self
    }
}

/// Catalog-entry dependency recorded against a tree or plan.
///
/// `hash` identifies the entry within the catalog; a recorded or notified
/// hash of `0` matches any entry of that catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatalogInvalItem {
    /// Which system catalog the entry lives in.
    pub catalog: CatalogId,
    /// Hash of the entry's lookup key.
    pub hash: u64,
}

impl CatalogInvalItem {
    /// Builds an invalidation item.
    pub fn new(catalog: CatalogId, hash: u64) -> Self {
        Self { catalog, hash }
    }

    /// True if a notification for (`catalog`, `hash`) hits this item.
    pub fn matches(&self, catalog: CatalogId, hash: u64) -> bool {
        self.catalog == catalog && (hash == 0 || self.hash == 0 || self.hash == hash)
    }
}

/// Per-statement output of the optimizer.
///
/// The relation and catalog-item lists can be supersets of what the query
/// tree's analysis surfaced (inlined function bodies pull in more objects),
/// which is why invalidation scans both.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStatement {
    /// Statement classification.
    pub kind: StatementKind,
    /// Optimizer's total cost estimate for this statement.
    pub total_cost: f64,
    /// Plan validity is tied to the building transaction's visibility
    /// horizon (e.g. it reads another session's not-yet-committed schema).
    pub transient: bool,
    /// The optimizer specialized this plan to the current role.
    pub depends_on_role: bool,
    /// Relations the compiled plan touches.
    pub relations: Vec<RelationRef>,
    /// Catalog entries the compiled plan depends on.
    pub inval_items: Vec<CatalogInvalItem>,
}

impl PlannedStatement {
    /// A plain planned query with the given cost and relations.
    pub fn query(total_cost: f64, relations: Vec<RelationRef>) -> Self {
        Self {
            kind: StatementKind::Query,
            total_cost,
            transient: false,
            depends_on_role: false,
            relations,
            inval_items: Vec::new(),
        }
    }

    /// A planned utility statement; ignored by cost accounting.
    pub fn utility() -> Self {
        Self {
            kind: StatementKind::Utility,
            total_cost: 0.0,
            transient: false,
            depends_on_role: false,
            relations: Vec::new(),
            inval_items: Vec::new(),
        }
    }
}

/// Alternate parameter-type specification: instead of a fixed type list the
/// caller provides a resolver consulted at analysis time.
pub trait ParamResolver: Send + Sync {
    /// Resolved parameter types, in order.
    fn param_types(&self) -> Vec<TypeId>;
}

/// Parameter signature of a prepared statement.
#[derive(Clone)]
pub enum ParamSpec {
    /// No parameters.
    None,
    /// Fixed, ordered parameter types.
    Types(Vec<TypeId>),
    /// Caller-supplied resolver callback.
    Resolver(Arc<dyn ParamResolver>),
}

impl ParamSpec {
    /// Number of declared parameters (resolver specs resolve on demand).
    pub fn len(&self) -> usize {
        match self {
            ParamSpec::None => 0,
            ParamSpec::Types(types) => types.len(),
            ParamSpec::Resolver(resolver) => resolver.param_types().len(),
        }
    }

    /// True when the statement declares no parameters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stable fingerprint of the resolved parameter types, used to key the
    /// cross-session shared store.
    pub fn fingerprint(&self) -> u64 {
        let types = match self {
            ParamSpec::None => Vec::new(),
            ParamSpec::Types(types) => types.clone(),
            ParamSpec::Resolver(resolver) => resolver.param_types(),
        };
        let mut bytes = Vec::with_capacity(types.len() * 4);
        for ty in &types {
            bytes.extend_from_slice(&ty.0.to_le_bytes());
        }
        xxhash_rust::xxh64::xxh64(&bytes, 0)
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSpec::None => write!(f, "ParamSpec::None"),
            ParamSpec::Types(types) => f.debug_tuple("ParamSpec::Types").field(types).finish(),
            ParamSpec::Resolver(_) => write!(f, "ParamSpec::Resolver(..)"),
        }
    }
}

/// A bound parameter value supplied at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
}

/// Concrete parameter values a custom plan is specialized against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParams {
    values: SmallVec<[ParamValue; 4]>,
}

impl BoundParams {
    /// Wraps a value list.
    pub fn new(values: impl IntoIterator<Item = ParamValue>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    /// The bound values, in parameter order.
    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no values are bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Planner options fixed when a source is completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Plan for scrollable cursor access.
    pub scroll: bool,
    /// Caller demands a parameter-independent plan.
    pub force_generic: bool,
    /// Caller demands replanning against bound values.
    pub force_custom: bool,
}
