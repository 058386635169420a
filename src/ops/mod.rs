// SPDX-License-Identifier: PMPL-1.0-or-later

//! Relational operators over immutable relations
//!
//! Every operator is a pure function of its inputs and returns a fresh,
//! deduplicated relation. The rule evaluator uses the row-level kernels in
//! [`join`] and [`aggregate`] directly; the relation-level wrappers here are
//! the public algebra.

pub mod aggregate;
pub mod join;

pub use aggregate::fold_groups;
pub use join::{antijoin_with, join_with, JoinOptions, JoinStats, JoinStrategy, KeySource};

use crate::error::{EvalError, EvalResult};
use crate::plan::AggFunc;
use crate::store::Relation;
use crate::types::{Column, ColumnType, Schema, Tuple};
use tracing::warn;

/// Tuples of `rel` satisfying `pred`
pub fn select<F>(rel: &Relation, pred: F) -> Relation
where
    F: Fn(&Tuple) -> bool,
{
    let rows = rel.iter().filter(|&t| pred(t)).cloned().collect();
    Relation::from_distinct(rel.name(), rel.schema().clone(), rows)
}

/// Map `rel` onto `columns` (any subset or reordering), removing duplicates
pub fn project(rel: &Relation, columns: &[usize]) -> EvalResult<Relation> {
    if let Some(&bad) = columns.iter().find(|&&c| c >= rel.arity()) {
        return Err(EvalError::InvalidPlan(format!(
            "projection column {} out of range for `{}` of arity {}",
            bad,
            rel.name(),
            rel.arity()
        )));
    }
    let schema = Schema::new(
        columns
            .iter()
            .map(|&c| rel.schema().columns[c].clone())
            .collect(),
    );
    let rows = rel
        .iter()
        .map(|t| columns.iter().map(|&c| t[c].clone()).collect::<Tuple>());
    Ok(Relation::new(rel.name(), schema, rows))
}

/// Set union; both sides must carry the same column types
pub fn union(a: &Relation, b: &Relation) -> EvalResult<Relation> {
    if a.arity() != b.arity() {
        return Err(EvalError::ArityMismatch {
            predicate: b.name().to_string(),
            expected: a.arity(),
            found: b.arity(),
        });
    }
    for (i, (x, y)) in a.schema().columns.iter().zip(&b.schema().columns).enumerate() {
        if x.ty != y.ty {
            return Err(EvalError::type_mismatch(
                format!("column {} of union `{}` / `{}`", i, a.name(), b.name()),
                x.ty,
                y.ty,
            ));
        }
    }
    Ok(Relation::new(
        a.name(),
        a.schema().clone(),
        a.iter().chain(b.iter()).cloned(),
    ))
}

/// Equi-join on `(left column, right column)` pairs; output is left ++ right
pub fn join(
    left: &Relation,
    right: &Relation,
    on: &[(usize, usize)],
    opts: JoinOptions,
) -> (Relation, JoinStats) {
    let left_keys: Vec<KeySource> = on.iter().map(|&(l, _)| KeySource::Column(l)).collect();
    let right_keys: Vec<usize> = on.iter().map(|&(_, r)| r).collect();
    let (rows, stats) = join_with(left.tuples(), &left_keys, right, &right_keys, opts, |l, r| {
        let mut out = Vec::with_capacity(l.len() + r.len());
        out.extend(l.iter().cloned());
        out.extend(r.iter().cloned());
        Some(out)
    });
    if stats.cartesian {
        warn!(
            left = left.name(),
            right = right.name(),
            rows = stats.output,
            "join without shared columns degraded to a cartesian product"
        );
    }
    let name = format!("{}_{}", left.name(), right.name());
    let schema = left.schema().concat(right.schema());
    (Relation::from_distinct(&name, schema, rows), stats)
}

/// Tuples of `left` with no partner in `right` on the given column pairs
pub fn antijoin(left: &Relation, right: &Relation, on: &[(usize, usize)]) -> Relation {
    let left_keys: Vec<KeySource> = on.iter().map(|&(l, _)| KeySource::Column(l)).collect();
    let right_keys: Vec<usize> = on.iter().map(|&(_, r)| r).collect();
    let rows = antijoin_with(left.tuples().to_vec(), &left_keys, right, &right_keys);
    Relation::from_distinct(left.name(), left.schema().clone(), rows)
}

/// Aggregate `rel` grouped by `group_by`.
///
/// The output has the grouping columns followed by one result column.
/// `count` ignores `target`; the other functions require it.
pub fn aggregate(
    rel: &Relation,
    group_by: &[usize],
    func: AggFunc,
    target: Option<usize>,
) -> EvalResult<Relation> {
    let arity = rel.arity();
    if let Some(&bad) = group_by.iter().chain(target.iter()).find(|&&c| c >= arity) {
        return Err(EvalError::InvalidPlan(format!(
            "aggregate column {} out of range for `{}`",
            bad,
            rel.name()
        )));
    }
    let result_ty = match (func, target) {
        (AggFunc::Count, _) => ColumnType::Int,
        (_, None) => {
            return Err(EvalError::InvalidPlan(format!(
                "{:?} over `{}` needs a target column",
                func,
                rel.name()
            )))
        }
        (AggFunc::Sum, Some(t)) => {
            let ty = rel.schema().columns[t].ty;
            if ty != ColumnType::Int {
                return Err(EvalError::type_mismatch("sum target", ColumnType::Int, ty));
            }
            ColumnType::Int
        }
        (AggFunc::Min | AggFunc::Max, Some(t)) => rel.schema().columns[t].ty,
    };

    let mut columns: Vec<Column> = group_by
        .iter()
        .map(|&c| rel.schema().columns[c].clone())
        .collect();
    columns.push(Column::new(&format!("{:?}", func).to_lowercase(), result_ty));

    let items = rel.iter().map(|t| {
        let key = group_by.iter().map(|&c| t[c].clone()).collect();
        (key, target.map(|c| t[c].clone()))
    });
    let rows = fold_groups(func, !group_by.is_empty(), items);
    Ok(Relation::from_distinct(rel.name(), Schema::new(columns), rows))
}
