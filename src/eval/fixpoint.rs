// SPDX-License-Identifier: PMPL-1.0-or-later

//! Semi-naive fixpoint evaluation of one stratum
//!
//! Round 1 evaluates the rules that read no predicate of the stratum. Every
//! later round evaluates each recursive rule once per recursive body atom,
//! with that atom reading the previous round's delta and every other atom
//! reading the full relation. Only tuples not yet known form the next delta;
//! evaluation stops at the first round that derives nothing.

use crate::error::{EvalError, EvalResult};
use crate::eval::body::{project_head, CompiledBody, RelationEnv};
use crate::exec::EvalContext;
use crate::plan::{Literal, PredicateDef, Rule, Stratum};
use crate::store::Relation;
use crate::types::{Schema, Tuple};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Fully evaluated relations of a stratum
#[derive(Debug)]
pub struct StratumOutput {
    pub relations: Vec<Relation>,
    /// Rounds run, counting the final round that derived nothing
    pub rounds: usize,
    pub derived: usize,
}

/// Member relations seen by the rule bodies of the current round
struct StratumEnv<'c, 'a> {
    ctx: &'c EvalContext<'a>,
    full: &'c HashMap<String, Arc<Relation>>,
    delta: &'c HashMap<String, Arc<Relation>>,
}

impl RelationEnv for StratumEnv<'_, '_> {
    fn relation(&self, predicate: &str, delta: bool) -> EvalResult<Arc<Relation>> {
        if delta {
            if let Some(rel) = self.delta.get(predicate) {
                return Ok(Arc::clone(rel));
            }
            if let Some(rel) = self.full.get(predicate) {
                return Ok(Arc::new(Relation::empty(predicate, rel.schema().clone())));
            }
        }
        match self.full.get(predicate) {
            Some(rel) => Ok(Arc::clone(rel)),
            None => self.ctx.resolve(predicate),
        }
    }
}

fn evaluate_rule(
    ctx: &EvalContext<'_>,
    env: &dyn RelationEnv,
    rule: &Rule,
    delta_at: Option<usize>,
) -> EvalResult<Vec<Tuple>> {
    let body = CompiledBody::compile(&rule.body, delta_at, env)?;
    let table = body.execute(ctx, env)?;
    project_head(&table, &rule.head)
}

/// Move freshly derived rows into delta relations
fn relations_of(
    rows: HashMap<String, Vec<Tuple>>,
    schemas: &HashMap<String, Schema>,
) -> HashMap<String, Arc<Relation>> {
    rows.into_iter()
        .map(|(name, tuples)| {
            let schema = schemas.get(&name).cloned().unwrap_or_default();
            let rel = Relation::from_distinct(&name, schema, tuples);
            (name, Arc::new(rel))
        })
        .collect()
}

/// Take sole ownership of a member relation once a round has released it
fn unshare(rel: Arc<Relation>) -> Relation {
    Arc::try_unwrap(rel).unwrap_or_else(|shared| shared.renamed(shared.name()))
}

/// Grow the accumulated relation of `name` by one delta
fn absorb(full: &mut HashMap<String, Arc<Relation>>, name: &str, delta: &Relation) {
    if let Some(rel) = full.remove(name) {
        let grown = unshare(rel).extended(delta.tuples().to_vec());
        full.insert(name.to_string(), Arc::new(grown));
    }
}

/// One semi-naive round: tuples derived through at least one delta atom
/// that are not already in `full`.
///
/// Novelty is checked against the all-column index of each `full`
/// relation. Inside [`evaluate_stratum`] that index lives as long as the
/// stratum and only ever receives the rows of each new delta.
pub fn derive_round(
    ctx: &EvalContext<'_>,
    defs: &[&PredicateDef],
    full: &HashMap<String, Arc<Relation>>,
    delta: &HashMap<String, Arc<Relation>>,
) -> EvalResult<HashMap<String, Vec<Tuple>>> {
    let members: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    let env = StratumEnv { ctx, full, delta };
    let mut fresh: HashMap<String, Vec<Tuple>> = HashMap::new();

    for def in defs {
        let known = full.get(&def.name);
        let mut seen: HashSet<Tuple> = HashSet::new();
        let mut out = Vec::new();
        for rule in &def.rules {
            for pos in rule.recursive_positions(&members) {
                let idle = match &rule.body[pos] {
                    Literal::Atom(atom) => delta.get(&atom.predicate).map_or(true, |r| r.is_empty()),
                    _ => true,
                };
                if idle {
                    continue;
                }
                for tuple in evaluate_rule(ctx, &env, rule, Some(pos))? {
                    let old = known.is_some_and(|rel| rel.contains(&tuple));
                    if !old && seen.insert(tuple.clone()) {
                        out.push(tuple);
                    }
                }
            }
        }
        if !out.is_empty() {
            fresh.insert(def.name.clone(), out);
        }
    }
    Ok(fresh)
}

/// Evaluate the predicates of `stratum` to their least fixpoint.
///
/// Each member keeps one accumulated relation for the whole stratum. Every
/// round appends its delta to it, so indices built by earlier rounds are
/// extended rather than rebuilt. Nothing is published here; the caller
/// receives the complete relations only if every round succeeded.
pub fn evaluate_stratum(
    ctx: &EvalContext<'_>,
    stratum: &Stratum,
    defs: &[&PredicateDef],
) -> EvalResult<StratumOutput> {
    let members: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    let schemas: HashMap<String, Schema> = defs
        .iter()
        .map(|d| (d.name.clone(), Schema::new(d.columns.clone())))
        .collect();
    let mut full: HashMap<String, Arc<Relation>> = schemas
        .iter()
        .map(|(name, schema)| (name.clone(), Arc::new(Relation::empty(name, schema.clone()))))
        .collect();

    ctx.checkpoint()?;
    let mut fresh: HashMap<String, Vec<Tuple>> = HashMap::new();
    {
        let none = HashMap::new();
        let env = StratumEnv {
            ctx,
            full: &full,
            delta: &none,
        };
        for def in defs {
            let mut seen: HashSet<Tuple> = HashSet::new();
            let mut rows = Vec::new();
            for rule in &def.rules {
                if !rule.recursive_positions(&members).is_empty() {
                    continue;
                }
                for tuple in evaluate_rule(ctx, &env, rule, None)? {
                    if seen.insert(tuple.clone()) {
                        rows.push(tuple);
                    }
                }
            }
            ctx.check_size(rows.len(), &def.name)?;
            if !rows.is_empty() {
                fresh.insert(def.name.clone(), rows);
            }
        }
    }

    let mut rounds = 1;
    loop {
        let new = fresh.values().map(Vec::len).sum::<usize>();
        let delta = relations_of(fresh, &schemas);
        for (name, rel) in &delta {
            absorb(&mut full, name, rel);
            if let Some(acc) = full.get(name) {
                ctx.check_size(acc.len(), name)?;
            }
        }
        debug!(stratum = stratum.id, round = rounds, new, "fixpoint round");

        if !stratum.recursive || delta.is_empty() {
            break;
        }
        rounds += 1;
        if rounds > ctx.config.max_rounds {
            return Err(EvalError::ResourceExhausted(format!(
                "stratum {} ({}) did not converge within {} rounds",
                stratum.id,
                stratum.predicates.join(", "),
                ctx.config.max_rounds
            )));
        }
        ctx.checkpoint()?;
        fresh = derive_round(ctx, defs, &full, &delta)?;
    }

    let relations: Vec<Relation> = defs
        .iter()
        .filter_map(|def| full.remove(&def.name))
        .map(unshare)
        .collect();
    let derived: usize = relations.iter().map(Relation::len).sum();

    Ok(StratumOutput {
        relations,
        rounds,
        derived,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvalConfig;
    use crate::exec::{CancellationToken, PredicateCache, StatsCollector};
    use crate::plan::{stratify, Term};
    use crate::store::FactStore;
    use crate::types::{Column, ColumnType, Value};

    fn chain(n: i64) -> FactStore {
        let mut builder = FactStore::builder();
        builder
            .add_relation(
                "edge",
                Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
                (0..n).map(|i| vec![Value::Int(i), Value::Int(i + 1)]),
            )
            .unwrap();
        builder.build()
    }

    fn reach() -> PredicateDef {
        let cols = vec![Column::new("a", ColumnType::Int), Column::new("b", ColumnType::Int)];
        PredicateDef::new(
            "reach",
            cols,
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

    #[test]
    fn test_chain_converges_in_length_plus_one_rounds() {
        let store = chain(3);
        let cache = PredicateCache::new(["reach"]);
        let config = EvalConfig::default();
        let stats = StatsCollector::default();
        let cancel = CancellationToken::new();
        let ctx = EvalContext::new(&store, &cache, &config, &stats, &cancel);

        let defs = vec![reach()];
        let strata = stratify(&defs);
        let stratum = strata.stratum_of("reach").unwrap();
        let out = evaluate_stratum(&ctx, stratum, &[&defs[0]]).unwrap();
        assert_eq!(out.rounds, 4);
        assert_eq!(out.derived, 6);
        assert!(out.relations[0].contains(&[Value::Int(0), Value::Int(3)]));

        // One more round over the fixpoint derives nothing.
        let full: HashMap<String, Arc<Relation>> = out
            .relations
            .into_iter()
            .map(|r| (r.name().to_string(), Arc::new(r)))
            .collect();
        let again = derive_round(&ctx, &[&defs[0]], &full, &full).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_accumulated_relation_is_indexed_once_per_row() {
        let n = 60;
        let store = chain(n);
        let cache = PredicateCache::new(["reach"]);
        let config = EvalConfig::default();
        let stats = StatsCollector::default();
        let cancel = CancellationToken::new();
        let ctx = EvalContext::new(&store, &cache, &config, &stats, &cancel);

        let defs = vec![reach()];
        let strata = stratify(&defs);
        let out = evaluate_stratum(&ctx, &strata.strata[0], &[&defs[0]]).unwrap();
        let reach = &out.relations[0];
        assert_eq!(out.rounds as i64, n + 1);
        assert_eq!(reach.len() as i64, n * (n + 1) / 2);

        // The membership index survives the stratum, and every row went into
        // each index exactly once instead of once per round.
        assert!(reach.has_index(&[0, 1]));
        assert!(reach.index_count() >= 1);
        assert_eq!(reach.indexed_rows(), reach.index_count() * reach.len());
    }

    #[test]
    fn test_round_budget() {
        let store = chain(10);
        let cache = PredicateCache::new(["reach"]);
        let config = EvalConfig::default().with_max_rounds(3);
        let stats = StatsCollector::default();
        let cancel = CancellationToken::new();
        let ctx = EvalContext::new(&store, &cache, &config, &stats, &cancel);

        let defs = vec![reach()];
        let strata = stratify(&defs);
        let err = evaluate_stratum(&ctx, &strata.strata[0], &[&defs[0]]).unwrap_err();
        assert!(matches!(err, EvalError::ResourceExhausted(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let store = chain(2);
        let cache = PredicateCache::new(["reach"]);
        let config = EvalConfig::default();
        let stats = StatsCollector::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = EvalContext::new(&store, &cache, &config, &stats, &cancel);

        let defs = vec![reach()];
        let strata = stratify(&defs);
        assert_eq!(
            evaluate_stratum(&ctx, &strata.strata[0], &[&defs[0]]).unwrap_err(),
            EvalError::Cancelled
        );
    }
}
