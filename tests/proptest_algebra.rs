// SPDX-License-Identifier: PMPL-1.0-or-later

//! Algebraic properties of the relational operators and of fixpoint
//! evaluation

use proptest::prelude::*;
use qleval::ops::{self, JoinOptions};
use qleval::plan::{Expr, Literal, PredicateDef, Program, Query, QueryKind, Rule, SelectItem, Term};
use qleval::types::Column;
use qleval::{ColumnType, EvalConfig, Executor, FactStore, Relation, Schema, Tuple, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn pairs_relation(name: &str, pairs: &[(i64, i64)]) -> Relation {
    Relation::new(
        name,
        Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
        pairs
            .iter()
            .map(|&(a, b)| vec![Value::Int(a), Value::Int(b)]),
    )
}

fn arb_pairs(max: usize) -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..8, 0i64..8), 0..max)
}

fn row_set(rel: &Relation) -> BTreeSet<Tuple> {
    rel.iter().cloned().collect()
}

/// Naive transitive closure, for comparison
fn closure(pairs: &[(i64, i64)]) -> BTreeSet<(i64, i64)> {
    let mut known: BTreeSet<(i64, i64)> = pairs.iter().copied().collect();
    loop {
        let next: Vec<(i64, i64)> = known
            .iter()
            .flat_map(|&(a, b)| {
                pairs
                    .iter()
                    .filter(move |&&(c, _)| c == b)
                    .map(move |&(_, d)| (a, d))
            })
            .filter(|p| !known.contains(p))
            .collect();
        if next.is_empty() {
            return known;
        }
        known.extend(next);
    }
}

fn reach_program() -> Program {
    let cols = vec![
        Column::new("a", ColumnType::Int),
        Column::new("b", ColumnType::Int),
    ];
    let v = Term::var;
    let reach = PredicateDef::new(
        "reach",
        cols,
        vec![
            Rule::new(
                vec![v("x"), v("y")],
                vec![Literal::atom("edge", vec![v("x"), v("y")])],
            ),
            Rule::new(
                vec![v("x"), v("z")],
                vec![
                    Literal::atom("edge", vec![v("x"), v("y")]),
                    Literal::atom("reach", vec![v("y"), v("z")]),
                ],
            ),
        ],
    );
    let query = Query::new(
        "Reach",
        QueryKind::Table,
        vec![Literal::atom("reach", vec![v("a"), v("b")])],
        vec![
            SelectItem::new("a", Expr::var("a")),
            SelectItem::new("b", Expr::var("b")),
        ],
    );
    Program::new(vec![reach], vec![query])
}

fn edge_store(pairs: &[(i64, i64)]) -> Arc<FactStore> {
    let mut builder = FactStore::builder();
    builder
        .add_relation(
            "edge",
            Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
            pairs
                .iter()
                .map(|&(a, b)| vec![Value::Int(a), Value::Int(b)]),
        )
        .unwrap();
    Arc::new(builder.build())
}

proptest! {
    /// Projecting every column in order leaves a relation unchanged
    #[test]
    fn project_all_columns_is_identity(pairs in arb_pairs(40)) {
        let rel = pairs_relation("r", &pairs);
        let projected = ops::project(&rel, &[0, 1]).unwrap();
        prop_assert!(projected.same_tuples(&rel));
    }

    /// A join B equals B join A up to column order
    #[test]
    fn join_is_commutative(left in arb_pairs(30), right in arb_pairs(30)) {
        let a = pairs_relation("a", &left);
        let b = pairs_relation("b", &right);
        let (ab, _) = ops::join(&a, &b, &[(1, 0)], JoinOptions::default());
        let (ba, _) = ops::join(&b, &a, &[(0, 1)], JoinOptions::default());

        let swapped: BTreeSet<Tuple> = ab
            .iter()
            .map(|row| vec![row[2].clone(), row[3].clone(), row[0].clone(), row[1].clone()])
            .collect();
        prop_assert_eq!(swapped, row_set(&ba));
    }

    /// Partitioned probing produces the same tuples as a sequential probe
    #[test]
    fn parallel_join_matches_sequential(left in arb_pairs(60), right in arb_pairs(60)) {
        let a = pairs_relation("a", &left);
        let b = pairs_relation("b", &right);
        let parallel = JoinOptions { parallel: true, threshold: 1, ..JoinOptions::default() };
        let (seq, _) = ops::join(&a, &b, &[(1, 0)], JoinOptions::default());
        let (par, _) = ops::join(&a, &b, &[(1, 0)], parallel);
        prop_assert_eq!(row_set(&seq), row_set(&par));
    }

    /// Union with itself adds nothing
    #[test]
    fn union_is_idempotent(pairs in arb_pairs(40)) {
        let rel = pairs_relation("r", &pairs);
        let both = ops::union(&rel, &rel).unwrap();
        prop_assert!(both.same_tuples(&rel));
    }

    /// Semi-naive closure equals the naive closure, with or without workers
    #[test]
    fn fixpoint_matches_naive_closure(pairs in arb_pairs(25)) {
        let expected: BTreeSet<Tuple> = closure(&pairs)
            .into_iter()
            .map(|(a, b)| vec![Value::Int(a), Value::Int(b)])
            .collect();

        let serial = Executor::new(edge_store(&pairs), reach_program(), EvalConfig::default()).unwrap();
        let threaded = Executor::new(
            edge_store(&pairs),
            reach_program(),
            EvalConfig::default().with_threads(2).with_parallel_join_threshold(1),
        )
        .unwrap();

        let a = serial.run_query("Reach").unwrap();
        let b = threaded.run_query("Reach").unwrap();
        prop_assert_eq!(a.rows.iter().cloned().collect::<BTreeSet<_>>(), expected);
        prop_assert_eq!(a, b);
    }
}
