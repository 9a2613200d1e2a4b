//! Generic walk over the tagged query-tree node variants.
//!
//! Lock scans and dependency extraction both need every relation reference
//! in a tree, including the ones buried in FROM subqueries and expression
//! sublinks. Rather than each caller hand-rolling the recursion, they match
//! on the [`QueryNode`] tag handed to a visitor closure.

use super::{QueryTree, RelationRef, StatementKind};

/// One node surfaced during a walk.
#[derive(Debug, Clone, Copy)]
pub enum QueryNode<'a> {
    /// A relation reference at the current query level.
    Relation(&'a RelationRef),
    /// A subquery in FROM/WITH, about to be descended into.
    Subquery(&'a QueryTree),
    /// An expression sublink, about to be descended into.
    SubLink(&'a QueryTree),
}

/// Depth-first walk of `query`, invoking `visitor` for every node.
///
/// Utility statements carry no relation references of their own and are
/// skipped; a nested query inside one still gets walked by the caller that
/// unwrapped it.
pub fn walk_query<'a>(query: &'a QueryTree, visitor: &mut dyn FnMut(QueryNode<'a>)) {
    if query.kind == StatementKind::Utility {
        return;
    }
    for rel in &query.relations {
        visitor(QueryNode::Relation(rel));
    }
    for sub in &query.subqueries {
        visitor(QueryNode::Subquery(sub));
        walk_query(sub, visitor);
    }
    for sub in &query.sublinks {
        visitor(QueryNode::SubLink(sub));
        walk_query(sub, visitor);
    }
}

/// Invokes `f` for every relation reference in `query`, nested levels
/// included.
pub fn for_each_relation<'a>(query: &'a QueryTree, f: &mut dyn FnMut(&'a RelationRef)) {
    walk_query(query, &mut |node| {
        if let QueryNode::Relation(rel) = node {
            f(rel);
        }
    });
}
