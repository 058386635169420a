// SPDX-License-Identifier: PMPL-1.0-or-later

//! Batch evaluation: failure isolation, shared predicate evaluation,
//! budgets, cancellation and static rejection

use qleval::plan::{
    AggFunc, Aggregate, Expr, Literal, PredicateDef, Program, Query, QueryKind, Rule, SelectItem,
    Term,
};
use qleval::types::Column;
use qleval::{ColumnType, EvalConfig, EvalError, Executor, FactStore, Schema, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn store() -> Arc<FactStore> {
    let mut builder = FactStore::builder();
    builder
        .add_relation(
            "node",
            Schema::new(vec![Column::new("n", ColumnType::Int)]),
            (1..=6).map(|i| vec![Value::Int(i)]),
        )
        .unwrap();
    builder
        .add_relation(
            "edge",
            Schema::new(vec![
                Column::new("from", ColumnType::Int),
                Column::new("to", ColumnType::Int),
            ]),
            vec![
                vec![Value::Int(1), Value::Int(2)],
                vec![Value::Int(2), Value::Int(3)],
                vec![Value::Int(4), Value::Int(5)],
            ],
        )
        .unwrap();
    Arc::new(builder.build())
}

fn unary(name: &str, rules: Vec<Rule>) -> PredicateDef {
    PredicateDef::new(name, vec![Column::new("n", ColumnType::Int)], rules)
}

fn x() -> Term {
    Term::var("x")
}

/// Nodes with an outgoing edge
fn has_succ() -> PredicateDef {
    unary(
        "has_succ",
        vec![Rule::new(
            vec![x()],
            vec![Literal::atom("edge", vec![x(), Term::Wildcard])],
        )],
    )
}

/// Nodes with an incoming edge
fn has_pred() -> PredicateDef {
    unary(
        "has_pred",
        vec![Rule::new(
            vec![x()],
            vec![Literal::atom("edge", vec![Term::Wildcard, x()])],
        )],
    )
}

/// Nodes with no incident edge
fn isolated() -> PredicateDef {
    unary(
        "isolated",
        vec![Rule::new(
            vec![x()],
            vec![
                Literal::atom("node", vec![x()]),
                Literal::not("has_succ", vec![x()]),
                Literal::not("has_pred", vec![x()]),
            ],
        )],
    )
}

fn select_x(name: &str, body: Vec<Literal>) -> Query {
    Query::new(
        name,
        QueryKind::Table,
        body,
        vec![SelectItem::new("x", Expr::var("x"))],
    )
}

fn program() -> Program {
    Program::new(
        vec![has_succ(), has_pred(), isolated()],
        vec![
            select_x("Isolated", vec![Literal::atom("isolated", vec![x()])]),
            select_x("Sources", vec![
                Literal::atom("has_succ", vec![x()]),
                Literal::not("has_pred", vec![x()]),
            ]),
            select_x("Broken", vec![Literal::atom("no_such_relation", vec![x()])]),
        ],
    )
}

#[test]
fn test_failures_are_isolated() {
    let exec = Executor::new(store(), program(), EvalConfig::default()).unwrap();
    let report = exec.run_all();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(
        report.outcome("Broken").and_then(|o| o.error()),
        Some(&EvalError::UnknownPredicate("no_such_relation".into()))
    );

    let isolated = report.outcome("Isolated").and_then(|o| o.rows()).unwrap();
    assert_eq!(isolated.rows, vec![vec![Value::Int(6)]]);
    let sources = report.outcome("Sources").and_then(|o| o.rows()).unwrap();
    assert_eq!(sources.rows, vec![vec![Value::Int(1)], vec![Value::Int(4)]]);

    assert_eq!(report.stats.queries_run, 3);
    assert_eq!(report.stats.queries_failed, 1);
}

#[test]
fn test_shared_predicates_evaluated_once_in_parallel() {
    let config = EvalConfig::default().with_threads(4);
    let exec = Executor::new(store(), program(), config).unwrap();

    for _ in 0..3 {
        let report = exec.run_all();
        assert_eq!(report.succeeded(), 2);
    }
    // has_succ, has_pred and isolated each form one stratum.
    assert_eq!(exec.stats().strata_evaluated, 3);
    assert_eq!(exec.stats().predicates_evaluated, 3);
}

#[test]
fn test_same_plan_same_result() {
    let first = Executor::new(store(), program(), EvalConfig::default()).unwrap();
    let second = Executor::new(store(), program(), EvalConfig::default().with_threads(3)).unwrap();
    assert_eq!(
        first.run_query("Isolated").unwrap(),
        second.run_query("Isolated").unwrap()
    );
    assert_eq!(store().fingerprint(), store().fingerprint());
}

#[test]
fn test_cancelled_batch() {
    let exec = Executor::new(store(), program(), EvalConfig::default()).unwrap();
    exec.cancel_token().cancel();
    let report = exec.run_all();
    assert_eq!(
        report.outcome("Isolated").and_then(|o| o.error()),
        Some(&EvalError::Cancelled)
    );
    assert_eq!(exec.stats().strata_evaluated, 0);
}

#[test]
fn test_unsafe_negation_rejected_before_evaluation() {
    let unsafe_pred = unary(
        "dangling",
        vec![Rule::new(
            vec![x()],
            vec![
                Literal::atom("node", vec![x()]),
                Literal::not("edge", vec![x(), Term::var("y")]),
            ],
        )],
    );
    let program = Program::new(
        vec![unsafe_pred],
        vec![select_x("Dangling", vec![Literal::atom("dangling", vec![x()])])],
    );
    let exec = Executor::new(store(), program, EvalConfig::default()).unwrap();

    let query = exec.program().query("Dangling").unwrap().clone();
    match exec.prepare(&query) {
        Err(EvalError::UnsafeNegation { vars, .. }) => assert_eq!(vars, vec!["y".to_string()]),
        other => panic!("expected unsafe negation, got {:?}", other.map(|p| p.strata)),
    }
    assert!(exec.run_query("Dangling").is_err());
    assert_eq!(exec.stats().strata_evaluated, 0);
}

#[test]
fn test_unsafe_negation_in_query_body() {
    let exec = Executor::new(store(), Program::default(), EvalConfig::default()).unwrap();
    let query = select_x(
        "Q",
        vec![
            Literal::atom("node", vec![x()]),
            Literal::not("edge", vec![Term::var("z"), x()]),
        ],
    );
    assert!(matches!(
        exec.prepare(&query),
        Err(EvalError::UnsafeNegation { .. })
    ));
}

#[test]
fn test_negative_cycle_rejected() {
    let p = unary(
        "p",
        vec![Rule::new(
            vec![x()],
            vec![Literal::atom("node", vec![x()]), Literal::not("q", vec![x()])],
        )],
    );
    let q = unary(
        "q",
        vec![Rule::new(vec![x()], vec![Literal::atom("p", vec![x()])])],
    );
    let program = Program::new(
        vec![p, q, has_succ()],
        vec![
            select_x("P", vec![Literal::atom("p", vec![x()])]),
            select_x("Succ", vec![Literal::atom("has_succ", vec![x()])]),
        ],
    );
    let exec = Executor::new(store(), program, EvalConfig::default()).unwrap();

    assert!(matches!(
        exec.run_query("P"),
        Err(EvalError::UnstratifiableNegation { via: "negation", .. })
    ));
    assert_eq!(exec.run_query("Succ").unwrap().len(), 3);
}

/// Transitive closure of `edge`
fn reach() -> PredicateDef {
    let v = Term::var;
    PredicateDef::new(
        "reach",
        vec![
            Column::new("a", ColumnType::Int),
            Column::new("b", ColumnType::Int),
        ],
        vec![
            Rule::new(
                vec![v("a"), v("b")],
                vec![Literal::atom("edge", vec![v("a"), v("b")])],
            ),
            Rule::new(
                vec![v("a"), v("c")],
                vec![
                    Literal::atom("reach", vec![v("a"), v("b")]),
                    Literal::atom("edge", vec![v("b"), v("c")]),
                ],
            ),
        ],
    )
}

/// One query per node reading the shared `reach` stratum
fn reach_queries() -> Vec<Query> {
    (1..=6i64)
        .map(|n| {
            select_x(
                &format!("From{}", n),
                vec![Literal::atom("reach", vec![Term::val(n), x()])],
            )
        })
        .collect()
}

#[test]
fn test_batch_over_shared_recursive_stratum_on_pool() {
    let config = EvalConfig::default()
        .with_threads(4)
        .with_parallel_join_threshold(1);
    let exec = Executor::new(store(), Program::new(vec![reach()], reach_queries()), config).unwrap();

    let report = exec.run_all();
    assert_eq!(report.succeeded(), 6);
    let from_one = report.outcome("From1").and_then(|o| o.rows()).unwrap();
    assert_eq!(from_one.rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);
    assert_eq!(exec.stats().strata_evaluated, 1);
}

#[test]
fn test_concurrent_callers_share_one_evaluation() {
    let config = EvalConfig::default()
        .with_threads(2)
        .with_parallel_join_threshold(1);
    let exec = Executor::new(store(), Program::new(vec![reach()], reach_queries()), config).unwrap();

    thread::scope(|scope| {
        for n in 1..=6 {
            let exec = &exec;
            scope.spawn(move || exec.run_query(&format!("From{}", n)).unwrap());
        }
    });
    assert_eq!(exec.stats().strata_evaluated, 1);
    assert_eq!(exec.stats().queries_run, 6);
}

#[test]
fn test_recursive_closure_cost_is_incremental() {
    let n = 80i64;
    let mut builder = FactStore::builder();
    builder
        .add_relation(
            "edge",
            Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
            (0..n).map(|i| vec![Value::Int(i), Value::Int(i + 1)]),
        )
        .unwrap();
    let exec = Executor::new(
        Arc::new(builder.build()),
        Program::new(vec![reach()], vec![]),
        EvalConfig::default(),
    )
    .unwrap();

    let reach = exec.relation("reach").unwrap();
    assert_eq!(reach.len() as i64, n * (n + 1) / 2);
    assert_eq!(exec.stats().rounds as i64, n + 1);
    // Rebuilding indices every round would hash each row once per later
    // round; growing them in place hashes each row once per index.
    assert!(reach.index_count() >= 1);
    assert_eq!(reach.indexed_rows(), reach.index_count() * reach.len());
}

#[test]
fn test_aggregation_cycle_rejected() {
    let counted = unary(
        "counted",
        vec![Rule::new(
            vec![x()],
            vec![
                Literal::atom("node", vec![x()]),
                Literal::Aggregate(Aggregate {
                    result: "c".into(),
                    func: AggFunc::Count,
                    target: None,
                    group_by: vec![],
                    body: vec![Literal::atom("feedback", vec![Term::var("y")])],
                }),
            ],
        )],
    );
    let feedback = unary(
        "feedback",
        vec![Rule::new(vec![x()], vec![Literal::atom("counted", vec![x()])])],
    );
    let program = Program::new(
        vec![counted, feedback, has_succ()],
        vec![
            select_x("Counted", vec![Literal::atom("counted", vec![x()])]),
            select_x("Succ", vec![Literal::atom("has_succ", vec![x()])]),
        ],
    );
    let exec = Executor::new(store(), program, EvalConfig::default()).unwrap();

    match exec.run_query("Counted") {
        Err(EvalError::UnstratifiableNegation { via, cycle, .. }) => {
            assert_eq!(via, "aggregation");
            assert!(cycle.contains(&"feedback".to_string()));
        }
        other => panic!("expected an aggregation cycle, got {:?}", other),
    }
    assert_eq!(exec.run_query("Succ").unwrap().len(), 3);
}

#[test]
fn test_executor_deadline() {
    let config = EvalConfig::default().with_timeout(Duration::from_millis(0));
    let exec = Executor::new(store(), program(), config).unwrap();

    assert!(matches!(
        exec.run_query("Isolated"),
        Err(EvalError::ResourceExhausted(_))
    ));
    let report = exec.run_all();
    assert!(matches!(
        report.outcome("Sources").and_then(|o| o.error()),
        Some(EvalError::ResourceExhausted(_))
    ));
    assert_eq!(exec.stats().strata_evaluated, 0);
}

#[test]
fn test_cartesian_join_over_tuple_limit() {
    let exec = Executor::new(
        store(),
        Program::default(),
        EvalConfig::default().with_max_tuples(20),
    )
    .unwrap();
    let pairs = Query::new(
        "Pairs",
        QueryKind::Table,
        vec![
            Literal::atom("node", vec![x()]),
            Literal::atom("node", vec![Term::var("y")]),
        ],
        vec![
            SelectItem::new("x", Expr::var("x")),
            SelectItem::new("y", Expr::var("y")),
        ],
    );
    assert!(matches!(
        exec.run(&pairs),
        Err(EvalError::ResourceExhausted(_))
    ));
}
