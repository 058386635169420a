// SPDX-License-Identifier: PMPL-1.0-or-later

//! Evaluation context threaded through every operator call

use crate::config::EvalConfig;
use crate::error::{EvalError, EvalResult};
use crate::eval::RelationEnv;
use crate::exec::cache::PredicateCache;
use crate::ops::{JoinOptions, JoinStats};
use crate::store::{FactStore, Relation};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation flag shared between the caller and the
/// executor. Checked between strata, fixpoint rounds and queries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Snapshot of evaluation counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalStats {
    pub strata_evaluated: usize,
    pub predicates_evaluated: usize,
    pub rounds: usize,
    pub tuples_derived: usize,
    pub joins: usize,
    pub cartesian_joins: usize,
    pub queries_run: usize,
    pub queries_failed: usize,
}

/// Thread-safe counters behind [`EvalStats`]
#[derive(Debug, Default)]
pub struct StatsCollector {
    strata_evaluated: AtomicUsize,
    predicates_evaluated: AtomicUsize,
    rounds: AtomicUsize,
    tuples_derived: AtomicUsize,
    joins: AtomicUsize,
    cartesian_joins: AtomicUsize,
    queries_run: AtomicUsize,
    queries_failed: AtomicUsize,
}

impl StatsCollector {
    pub fn record_join(&self, stats: &JoinStats) {
        self.joins.fetch_add(1, Ordering::Relaxed);
        if stats.cartesian {
            self.cartesian_joins.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_stratum(&self, predicates: usize, rounds: usize, derived: usize) {
        self.strata_evaluated.fetch_add(1, Ordering::Relaxed);
        self.predicates_evaluated.fetch_add(predicates, Ordering::Relaxed);
        self.rounds.fetch_add(rounds, Ordering::Relaxed);
        self.tuples_derived.fetch_add(derived, Ordering::Relaxed);
    }

    pub fn record_query(&self, ok: bool) {
        self.queries_run.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> EvalStats {
        EvalStats {
            strata_evaluated: self.strata_evaluated.load(Ordering::Relaxed),
            predicates_evaluated: self.predicates_evaluated.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            tuples_derived: self.tuples_derived.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            cartesian_joins: self.cartesian_joins.load(Ordering::Relaxed),
            queries_run: self.queries_run.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything an operator may consult: the fact store, published derived
/// relations, budgets, cancellation and statistics.
///
/// The context is read-only; the only shared mutable state behind it is the
/// write-once predicate cache and the atomic counters.
pub struct EvalContext<'a> {
    pub store: &'a FactStore,
    pub cache: &'a PredicateCache,
    pub config: &'a EvalConfig,
    pub stats: &'a StatsCollector,
    cancel: &'a CancellationToken,
    deadline: Option<Instant>,
    parallel: bool,
}

impl<'a> EvalContext<'a> {
    pub fn new(
        store: &'a FactStore,
        cache: &'a PredicateCache,
        config: &'a EvalConfig,
        stats: &'a StatsCollector,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            stats,
            cancel,
            deadline: config.timeout().map(|t| Instant::now() + t),
            parallel: false,
        }
    }

    /// Allow join probes to spread over the current rayon pool
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Published derived relation or base relation named `name`
    pub fn resolve(&self, name: &str) -> EvalResult<Arc<Relation>> {
        if self.cache.is_derived(name) {
            return self.cache.get(name).ok_or_else(|| {
                EvalError::InvalidPlan(format!(
                    "predicate `{}` read before its stratum was evaluated",
                    name
                ))
            });
        }
        self.store.get_relation(name)
    }

    pub fn check_cancelled(&self) -> EvalResult<()> {
        if self.cancel.is_cancelled() {
            Err(EvalError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn check_deadline(&self) -> EvalResult<()> {
        match (self.deadline, self.config.timeout_ms) {
            (Some(deadline), Some(ms)) if Instant::now() >= deadline => Err(
                EvalError::ResourceExhausted(format!("query exceeded its {} ms deadline", ms)),
            ),
            _ => Ok(()),
        }
    }

    /// Cancellation and deadline, checked between strata and rounds
    pub fn checkpoint(&self) -> EvalResult<()> {
        self.check_cancelled()?;
        self.check_deadline()
    }

    pub fn check_size(&self, len: usize, what: &str) -> EvalResult<()> {
        if len > self.config.max_tuples {
            return Err(EvalError::ResourceExhausted(format!(
                "`{}` grew to {} tuples, limit is {}",
                what, len, self.config.max_tuples
            )));
        }
        Ok(())
    }

    pub fn join_options(&self) -> JoinOptions {
        JoinOptions {
            parallel: self.parallel,
            threshold: self.config.parallel_join_threshold,
            limit: self.config.max_tuples,
        }
    }
}

impl RelationEnv for EvalContext<'_> {
    fn relation(&self, predicate: &str, _delta: bool) -> EvalResult<Arc<Relation>> {
        self.resolve(predicate)
    }
}
