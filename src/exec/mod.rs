// SPDX-License-Identifier: PMPL-1.0-or-later

//! Plan executor
//!
//! An [`Executor`] owns one fact store and one program. Derived predicates
//! are validated and stratified once, when the executor is built; each
//! query then pulls in the strata it needs, lowest level first. A stratum
//! is evaluated at most once per executor and its relations are shared by
//! every later query through the [`PredicateCache`].
//!
//! Stratum evaluation is serialized by a lock that only the calling thread
//! takes, before it enters the worker pool. Pool workers never wait on it:
//! a batch evaluates every stratum its queries need up front and only then
//! spreads the query bodies over the pool.

pub mod cache;
pub mod context;

pub use cache::PredicateCache;
pub use context::{CancellationToken, EvalContext, EvalStats, StatsCollector};

use crate::config::EvalConfig;
use crate::error::{EvalError, EvalResult};
use crate::eval::{evaluate_stratum, project_select, CompiledBody};
use crate::plan::{check_predicate, check_query, stratify, PredicateDef, Program, Query, SchemaCatalog, Stratification};
use crate::results::{BatchReport, QueryOutcome, ResultSet};
use crate::store::{FactStore, Relation};
use crate::types::Schema;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A query that passed every static check, with the strata it reads
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query: Query,
    pub schema: Schema,
    /// Ordered by level, then id
    pub strata: Vec<usize>,
}

pub struct Executor {
    store: Arc<FactStore>,
    program: Program,
    config: EvalConfig,
    strata: Stratification,
    predicate_errors: HashMap<String, EvalError>,
    cache: PredicateCache,
    evaluation: Mutex<()>,
    stats: StatsCollector,
    cancel: CancellationToken,
    pool: Option<rayon::ThreadPool>,
}

impl Executor {
    /// Validate and stratify `program` against `store`.
    ///
    /// Only duplicate names fail construction. A predicate that does not
    /// validate is remembered, and every query reading it fails in
    /// [`Executor::prepare`].
    pub fn new(store: Arc<FactStore>, program: Program, config: EvalConfig) -> EvalResult<Self> {
        program.check_names()?;

        let mut predicate_errors = HashMap::new();
        {
            let catalog = SchemaCatalog::new(&store, &program.predicates);
            for pred in &program.predicates {
                if let Err(err) = check_predicate(pred, &catalog) {
                    warn!(predicate = %pred.name, error = %err, "invalid predicate");
                    predicate_errors.insert(pred.name.clone(), err);
                }
            }
        }

        let strata = stratify(&program.predicates);
        if !strata.is_valid() {
            warn!("program contains unstratifiable predicates");
        }
        let cache = PredicateCache::new(program.predicates.iter().map(|p| p.name.as_str()));

        let pool = if config.threads > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .build()
            {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!(error = %err, "falling back to single-threaded evaluation");
                    None
                }
            }
        } else {
            None
        };

        info!(
            predicates = program.predicates.len(),
            queries = program.queries.len(),
            strata = strata.strata.len(),
            threads = config.threads,
            "executor ready"
        );

        Ok(Self {
            store,
            program,
            config,
            strata,
            predicate_errors,
            cache,
            evaluation: Mutex::new(()),
            stats: StatsCollector::default(),
            cancel: CancellationToken::new(),
            pool,
        })
    }

    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn strata(&self) -> &Stratification {
        &self.strata
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> EvalStats {
        self.stats.snapshot()
    }

    /// Static error recorded for a derived predicate, if any
    pub fn predicate_error(&self, name: &str) -> Option<&EvalError> {
        self.strata
            .error_for(name)
            .or_else(|| self.predicate_errors.get(name))
    }

    fn context(&self) -> EvalContext<'_> {
        EvalContext::new(
            &self.store,
            &self.cache,
            &self.config,
            &self.stats,
            &self.cancel,
        )
        .with_parallelism(self.pool.is_some())
    }

    /// Run `op` on the executor's pool, or inline when there is none
    fn in_pool<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    fn check_strata(&self, ids: &[usize]) -> EvalResult<()> {
        for &id in ids {
            for name in &self.strata.strata[id].predicates {
                if let Some(err) = self.predicate_error(name) {
                    return Err(err.clone());
                }
            }
        }
        Ok(())
    }

    /// Run every static check for `query`; nothing is evaluated
    pub fn prepare(&self, query: &Query) -> EvalResult<PreparedQuery> {
        let catalog = SchemaCatalog::new(&self.store, &self.program.predicates);
        let schema = check_query(query, &catalog)?;
        let strata = self.strata.required(query.dependencies());
        self.check_strata(&strata)?;
        debug!(query = %query.name, strata = ?strata, "prepared");
        Ok(PreparedQuery {
            query: query.clone(),
            schema,
            strata,
        })
    }

    /// Evaluate the query of the program named `name`
    pub fn run_query(&self, name: &str) -> EvalResult<ResultSet> {
        let query = self
            .program
            .query(name)
            .ok_or_else(|| EvalError::InvalidPlan(format!("no query named `{}`", name)))?;
        self.run(query)
    }

    /// Prepare and evaluate `query`, which need not belong to the program
    pub fn run(&self, query: &Query) -> EvalResult<ResultSet> {
        let result = self.prepare(query).and_then(|prepared| self.execute(&prepared));
        self.stats.record_query(result.is_ok());
        result
    }

    pub fn execute(&self, prepared: &PreparedQuery) -> EvalResult<ResultSet> {
        let ctx = self.context();
        ctx.checkpoint()?;
        self.materialize(&ctx, &prepared.strata)?;
        self.in_pool(|| self.evaluate_body(&ctx, prepared))
    }

    /// Evaluate the body of a query whose strata are all published
    fn evaluate_body(&self, ctx: &EvalContext<'_>, prepared: &PreparedQuery) -> EvalResult<ResultSet> {
        let query = &prepared.query;
        let body = CompiledBody::compile(&query.body, None, ctx)?;
        let table = body.execute(ctx, ctx)?;
        let rows = project_select(ctx, &table, &query.select)?;
        ctx.check_size(rows.len(), &query.name)?;
        info!(query = %query.name, rows = rows.len(), "query evaluated");
        Ok(ResultSet::materialize(query, prepared.schema.clone(), rows))
    }

    /// Evaluate every query of the program. A failing query is reported in
    /// its outcome and does not affect the others.
    ///
    /// Every stratum needed by a query that prepares cleanly is evaluated
    /// first, under one context for the whole batch. The query bodies then
    /// run on the pool with nothing left to evaluate.
    pub fn run_all(&self) -> BatchReport {
        let queries = &self.program.queries;
        let prepared: Vec<EvalResult<PreparedQuery>> =
            queries.iter().map(|q| self.prepare(q)).collect();

        let mut needed: Vec<usize> = prepared
            .iter()
            .flatten()
            .flat_map(|p| p.strata.iter().copied())
            .collect();
        needed.sort_by_key(|&id| (self.strata.strata[id].level, id));
        needed.dedup();
        let failed = self.evaluate_strata(&self.context(), &needed);

        let outcome = |(query, prepared): (&Query, &EvalResult<PreparedQuery>)| {
            self.outcome_of(query, prepared, &failed)
        };
        let outcomes: Vec<QueryOutcome> = match &self.pool {
            Some(pool) => pool.install(|| queries.par_iter().zip(&prepared).map(outcome).collect()),
            None => queries.iter().zip(&prepared).map(outcome).collect(),
        };
        BatchReport::new(self.store.fingerprint(), outcomes, self.stats.snapshot())
    }

    fn outcome_of(
        &self,
        query: &Query,
        prepared: &EvalResult<PreparedQuery>,
        failed: &HashMap<usize, EvalError>,
    ) -> QueryOutcome {
        let started = Instant::now();
        let result = match prepared {
            Err(err) => Err(err.clone()),
            Ok(prepared) => match prepared.strata.iter().find_map(|id| failed.get(id)) {
                Some(err) => Err(err.clone()),
                None => {
                    let ctx = self.context();
                    ctx.checkpoint()
                        .and_then(|()| self.evaluate_body(&ctx, prepared))
                }
            },
        };
        self.stats.record_query(result.is_ok());
        if let Err(err) = &result {
            warn!(query = %query.name, kind = err.kind(), error = %err, "query failed");
        }
        QueryOutcome {
            query: query.name.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            result,
        }
    }

    /// Fully evaluated relation of a derived predicate, or a base relation
    pub fn relation(&self, name: &str) -> EvalResult<Arc<Relation>> {
        if !self.cache.is_derived(name) {
            return self.store.get_relation(name);
        }
        let strata = self.strata.required([name]);
        self.check_strata(&strata)?;
        let ctx = self.context();
        self.materialize(&ctx, &strata)?;
        ctx.resolve(name)
    }

    /// Publish every stratum of `ids`, failing with the first error in
    /// level order
    fn materialize(&self, ctx: &EvalContext<'_>, ids: &[usize]) -> EvalResult<()> {
        let failed = self.evaluate_strata(ctx, ids);
        match ids.iter().find_map(|id| failed.get(id)) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Split `ids`, ordered by level, into runs sharing one level
    fn levels<'i>(&self, ids: &'i [usize]) -> Vec<&'i [usize]> {
        let mut runs = Vec::new();
        let mut start = 0;
        while start < ids.len() {
            let level = self.strata.strata[ids[start]].level;
            let end = ids[start..]
                .iter()
                .position(|&id| self.strata.strata[id].level != level)
                .map_or(ids.len(), |offset| start + offset);
            runs.push(&ids[start..end]);
            start = end;
        }
        runs
    }

    /// Evaluate `ids` level by level on the pool; strata sharing a level
    /// run concurrently. A failed stratum does not stop unrelated ones, and
    /// a stratum above it fails with the same error. Returns the failures.
    fn evaluate_strata(&self, ctx: &EvalContext<'_>, ids: &[usize]) -> HashMap<usize, EvalError> {
        let mut failed = HashMap::new();
        if ids.iter().all(|&id| self.is_published(id)) {
            return failed;
        }
        let _guard = self
            .evaluation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for batch in self.levels(ids) {
            let mut runnable = Vec::with_capacity(batch.len());
            for &id in batch {
                let inherited = self.strata.strata[id]
                    .depends_on
                    .iter()
                    .find_map(|dep| failed.get(dep).cloned());
                match inherited {
                    Some(err) => {
                        failed.insert(id, err);
                    }
                    None => runnable.push(id),
                }
            }

            let evaluate = |&id: &usize| (id, self.ensure_stratum(ctx, id));
            let results: Vec<(usize, EvalResult<()>)> = match &self.pool {
                Some(pool) => pool.install(|| runnable.par_iter().map(evaluate).collect()),
                None => runnable.iter().map(evaluate).collect(),
            };
            failed.extend(
                results
                    .into_iter()
                    .filter_map(|(id, result)| result.err().map(|err| (id, err))),
            );
        }
        failed
    }

    fn is_published(&self, id: usize) -> bool {
        self.strata.strata[id]
            .predicates
            .iter()
            .all(|p| self.cache.is_published(p))
    }

    /// Evaluate and publish one stratum. Only called with the evaluation
    /// lock held, which makes publication at most once.
    fn ensure_stratum(&self, ctx: &EvalContext<'_>, id: usize) -> EvalResult<()> {
        if self.is_published(id) {
            return Ok(());
        }
        ctx.checkpoint()?;

        let stratum = &self.strata.strata[id];
        let defs: Vec<&PredicateDef> = stratum
            .predicates
            .iter()
            .filter_map(|name| self.program.predicate(name))
            .collect();
        let started = Instant::now();
        let output = evaluate_stratum(ctx, stratum, &defs)?;

        for relation in output.relations {
            let name = relation.name().to_string();
            self.cache.publish(&name, relation)?;
        }
        self.stats
            .record_stratum(defs.len(), output.rounds, output.derived);
        info!(
            stratum = id,
            level = stratum.level,
            predicates = %stratum.predicates.join(", "),
            rounds = output.rounds,
            derived = output.derived,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stratum evaluated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Expr, Literal, QueryKind, Rule, SelectItem, Term};
    use crate::types::{Column, ColumnType, Value};

    fn store() -> Arc<FactStore> {
        let mut builder = FactStore::builder();
        builder
            .add_relation(
                "edge",
                Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
                vec![
                    vec![Value::Int(1), Value::Int(2)],
                    vec![Value::Int(2), Value::Int(3)],
                ],
            )
            .unwrap();
        Arc::new(builder.build())
    }

    fn reach() -> PredicateDef {
        PredicateDef::new(
            "reach",
            vec![Column::new("a", ColumnType::Int), Column::new("b", ColumnType::Int)],
            vec![
                Rule::new(
                    vec![Term::var("x"), Term::var("y")],
                    vec![Literal::atom("edge", vec![Term::var("x"), Term::var("y")])],
                ),
                Rule::new(
                    vec![Term::var("x"), Term::var("z")],
                    vec![
                        Literal::atom("reach", vec![Term::var("x"), Term::var("y")]),
                        Literal::atom("edge", vec![Term::var("y"), Term::var("z")]),
                    ],
                ),
            ],
        )
    }

    fn from_one() -> Query {
        Query::new(
            "FromOne",
            QueryKind::Table,
            vec![Literal::atom("reach", vec![Term::val(1i64), Term::var("y")])],
            vec![SelectItem::new("y", Expr::var("y"))],
        )
    }

    #[test]
    fn test_run_query_and_reuse() {
        let program = Program::new(vec![reach()], vec![from_one()]);
        let exec = Executor::new(store(), program, EvalConfig::default()).unwrap();

        let result = exec.run_query("FromOne").unwrap();
        assert_eq!(result.rows, vec![vec![Value::Int(2)], vec![Value::Int(3)]]);

        exec.run_query("FromOne").unwrap();
        let stats = exec.stats();
        assert_eq!(stats.strata_evaluated, 1);
        assert_eq!(stats.queries_run, 2);
    }

    #[test]
    fn test_work_runs_on_own_pool() {
        let program = Program::new(vec![reach()], vec![from_one()]);
        let config = EvalConfig::default()
            .with_threads(3)
            .with_parallel_join_threshold(1);
        let exec = Executor::new(store(), program, config).unwrap();
        assert_eq!(exec.in_pool(rayon::current_num_threads), 3);
        assert!(exec.in_pool(|| rayon::current_thread_index().is_some()));

        let program = Program::new(vec![reach()], vec![from_one()]);
        let serial = Executor::new(store(), program, EvalConfig::default()).unwrap();
        assert_eq!(serial.in_pool(rayon::current_thread_index), None);
        assert_eq!(exec.run_query("FromOne").unwrap(), serial.run_query("FromOne").unwrap());
        assert_eq!(exec.relation("reach").unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_query_name() {
        let exec = Executor::new(store(), Program::default(), EvalConfig::default()).unwrap();
        assert!(matches!(exec.run_query("Nope"), Err(EvalError::InvalidPlan(_))));
    }

    #[test]
    fn test_relation_of_base_and_derived() {
        let program = Program::new(vec![reach()], vec![]);
        let exec = Executor::new(store(), program, EvalConfig::default()).unwrap();
        assert_eq!(exec.relation("edge").unwrap().len(), 2);
        assert_eq!(exec.relation("reach").unwrap().len(), 3);
        assert!(matches!(
            exec.relation("missing"),
            Err(EvalError::UnknownPredicate(_))
        ));
    }

    #[test]
    fn test_duplicate_predicate_rejected() {
        let program = Program::new(vec![reach(), reach()], vec![]);
        assert!(Executor::new(store(), program, EvalConfig::default()).is_err());
    }
}
