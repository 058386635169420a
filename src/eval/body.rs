// SPDX-License-Identifier: PMPL-1.0-or-later

//! Conjunction evaluation over binding tables
//!
//! A rule or query body is compiled into a sequence of steps that grow a
//! [`BindingTable`], starting from the unit table (one empty row). The step
//! order is chosen greedily: comparisons, assignments and negations run as
//! soon as their variables are bound, otherwise the atom with the most
//! bound arguments is joined next, smallest relation first.

use crate::error::{EvalError, EvalResult};
use crate::eval::expr::{CompiledCompare, CompiledExpr, SlotMap};
use crate::exec::EvalContext;
use crate::ops::{antijoin_with, fold_groups, join_with, KeySource};
use crate::plan::{AggFunc, Aggregate, Atom, Literal, SelectItem, Term};
use crate::store::Relation;
use crate::types::{Schema, Tuple, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{trace, warn};

/// Source of the relations a body reads
pub trait RelationEnv {
    /// Relation behind `predicate`; `delta` asks for the tuples derived in
    /// the previous fixpoint round instead of the full relation
    fn relation(&self, predicate: &str, delta: bool) -> EvalResult<Arc<Relation>>;
}

/// Rows of values for an ordered list of variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTable {
    pub vars: Vec<String>,
    pub rows: Vec<Tuple>,
}

impl BindingTable {
    /// No variables, one row: the identity of the natural join
    pub fn unit() -> Self {
        Self {
            vars: Vec::new(),
            rows: vec![Vec::new()],
        }
    }

    pub fn slot(&self, var: &str) -> Option<usize> {
        self.vars.iter().position(|v| v == var)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
enum ArgSlot {
    Const(Value),
    Bound(usize),
    /// First occurrence of an unbound variable; its value is appended
    Fresh,
    /// Must equal the atom argument at this position
    Repeat(usize),
    Wildcard,
}

#[derive(Debug)]
enum Source {
    Predicate { name: String, delta: bool },
    Aggregate(Box<CompiledAggregate>),
}

#[derive(Debug)]
struct CompiledAggregate {
    label: String,
    func: AggFunc,
    grouped: bool,
    body: CompiledBody,
    group_slots: Vec<usize>,
    target: Option<CompiledExpr>,
}

impl CompiledAggregate {
    fn evaluate(&self, ctx: &EvalContext<'_>, env: &dyn RelationEnv) -> EvalResult<Relation> {
        let inner = self.body.execute(ctx, env)?;
        let items = inner.rows.iter().map(|row| {
            let key: Vec<Value> = self.group_slots.iter().map(|&s| row[s].clone()).collect();
            let value = self.target.as_ref().and_then(|t| t.eval(row, ctx.store));
            (key, value)
        });
        let rows = fold_groups(self.func, self.grouped, items);
        let schema = rows
            .first()
            .map(|row| Schema::of_types(&row.iter().map(Value::ty).collect::<Vec<_>>()))
            .unwrap_or_default();
        Ok(Relation::from_distinct(&self.label, schema, rows))
    }
}

#[derive(Debug)]
enum Step {
    Join {
        source: Source,
        args: Vec<ArgSlot>,
        dedup: bool,
    },
    Negate {
        predicate: String,
        args: Vec<ArgSlot>,
    },
    Filter(CompiledCompare),
    Bind(CompiledExpr),
}

/// A body compiled into evaluation steps
#[derive(Debug)]
pub struct CompiledBody {
    steps: Vec<Step>,
    vars: Vec<String>,
}

impl CompiledBody {
    /// Compile `body`. When `delta_at` names a body position holding a
    /// positive atom, that atom reads the delta relation.
    pub fn compile(
        body: &[Literal],
        delta_at: Option<usize>,
        env: &dyn RelationEnv,
    ) -> EvalResult<Self> {
        let mut planner = Planner {
            env,
            slots: SlotMap::new(),
            vars: Vec::new(),
            steps: Vec::new(),
        };
        let mut remaining: Vec<usize> = (0..body.len()).collect();

        while !remaining.is_empty() {
            let bound: HashSet<String> = planner.slots.keys().cloned().collect();

            if let Some(k) = remaining
                .iter()
                .position(|&i| planner.is_ready_filter(&body[i]))
            {
                let i = remaining.remove(k);
                planner.push_filter(&body[i])?;
                continue;
            }

            if let Some(k) = remaining.iter().position(|&i| body[i].binding(&bound).is_some()) {
                let i = remaining.remove(k);
                if let Some((var, expr)) = body[i].binding(&bound) {
                    let compiled = CompiledExpr::compile(expr, &planner.slots)?;
                    planner.steps.push(Step::Bind(compiled));
                    planner.declare(var);
                }
                continue;
            }

            if let Some(k) = remaining.iter().position(|&i| match &body[i] {
                Literal::Not(atom) => atom.vars().all(|v| bound.contains(v)),
                _ => false,
            }) {
                let i = remaining.remove(k);
                if let Literal::Not(atom) = &body[i] {
                    planner.push_negation(atom)?;
                }
                continue;
            }

            let mut best: Option<(usize, usize, usize)> = None;
            for (k, &i) in remaining.iter().enumerate() {
                let (bound_args, size) = match &body[i] {
                    Literal::Atom(atom) => (
                        atom.args
                            .iter()
                            .filter(|t| match t {
                                Term::Const(_) => true,
                                Term::Var(v) => bound.contains(v),
                                Term::Wildcard => false,
                            })
                            .count(),
                        env.relation(&atom.predicate, delta_at == Some(i))?.len(),
                    ),
                    Literal::Aggregate(agg) => (
                        agg.group_by.iter().filter(|v| bound.contains(*v)).count()
                            + usize::from(bound.contains(&agg.result)),
                        1,
                    ),
                    _ => continue,
                };
                let better = match best {
                    None => true,
                    Some((_, b, s)) => bound_args > b || (bound_args == b && size < s),
                };
                if better {
                    best = Some((k, bound_args, size));
                }
            }

            let Some((k, _, _)) = best else {
                return Err(EvalError::InvalidPlan(format!(
                    "cannot order {} literal(s): their variables are never bound",
                    remaining.len()
                )));
            };
            let i = remaining.remove(k);
            match &body[i] {
                Literal::Atom(atom) => {
                    let source = Source::Predicate {
                        name: atom.predicate.clone(),
                        delta: delta_at == Some(i),
                    };
                    planner.push_join(source, &atom.args);
                }
                Literal::Aggregate(agg) => planner.push_aggregate(agg)?,
                _ => {}
            }
        }

        Ok(Self {
            steps: planner.steps,
            vars: planner.vars,
        })
    }

    /// Variables bound after the last step, in column order
    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn execute(&self, ctx: &EvalContext<'_>, env: &dyn RelationEnv) -> EvalResult<BindingTable> {
        let mut rows = BindingTable::unit().rows;
        for step in &self.steps {
            if rows.is_empty() {
                break;
            }
            rows = match step {
                Step::Join { source, args, dedup } => {
                    let rel = match source {
                        Source::Predicate { name, delta } => env.relation(name, *delta)?,
                        Source::Aggregate(agg) => Arc::new(agg.evaluate(ctx, env)?),
                    };
                    let mut out = join_atom(ctx, &rows, &rel, args)?;
                    if *dedup {
                        out.sort_unstable();
                        out.dedup();
                    }
                    ctx.check_size(out.len(), rel.name())?;
                    out
                }
                Step::Negate { predicate, args } => {
                    let rel = env.relation(predicate, false)?;
                    let (left_keys, right_keys) = key_columns(args);
                    antijoin_with(rows, &left_keys, &rel, &right_keys)
                }
                Step::Filter(cmp) => {
                    rows.retain(|row| cmp.test(row, ctx.store));
                    rows
                }
                Step::Bind(expr) => rows
                    .into_iter()
                    .filter_map(|mut row| {
                        let value = expr.eval(&row, ctx.store)?;
                        row.push(value);
                        Some(row)
                    })
                    .collect(),
            };
        }
        Ok(BindingTable {
            vars: self.vars.clone(),
            rows,
        })
    }
}

struct Planner<'e> {
    env: &'e dyn RelationEnv,
    slots: SlotMap,
    vars: Vec<String>,
    steps: Vec<Step>,
}

impl Planner<'_> {
    fn declare(&mut self, var: &str) {
        self.slots.insert(var.to_string(), self.vars.len());
        self.vars.push(var.to_string());
    }

    fn bound(&self, var: &str) -> bool {
        self.slots.contains_key(var)
    }

    fn is_ready_filter(&self, lit: &Literal) -> bool {
        match lit {
            Literal::Compare { left, right, .. } => left
                .vars()
                .into_iter()
                .chain(right.vars())
                .all(|v| self.bound(v)),
            Literal::Assign { var, expr } => {
                self.bound(var) && expr.vars().into_iter().all(|v| self.bound(v))
            }
            _ => false,
        }
    }

    fn push_filter(&mut self, lit: &Literal) -> EvalResult<()> {
        let step = match lit {
            Literal::Compare { op, left, right } => {
                CompiledCompare::compile(*op, left, right, &self.slots)?
            }
            Literal::Assign { var, expr } => {
                let slot = self.slots[var.as_str()];
                CompiledCompare::equality(slot, CompiledExpr::compile(expr, &self.slots)?)
            }
            _ => return Ok(()),
        };
        self.steps.push(Step::Filter(step));
        Ok(())
    }

    fn push_negation(&mut self, atom: &Atom) -> EvalResult<()> {
        let args = self.arg_slots(&atom.args);
        if args
            .iter()
            .any(|a| matches!(a, ArgSlot::Fresh | ArgSlot::Repeat(_)))
        {
            return Err(EvalError::UnsafeNegation {
                context: "body".into(),
                predicate: atom.predicate.clone(),
                vars: atom
                    .vars()
                    .filter(|v| !self.bound(v))
                    .map(str::to_string)
                    .collect(),
            });
        }
        self.steps.push(Step::Negate {
            predicate: atom.predicate.clone(),
            args,
        });
        Ok(())
    }

    fn push_join(&mut self, source: Source, terms: &[Term]) {
        let args = self.arg_slots(terms);
        let dedup = args.iter().any(|a| matches!(a, ArgSlot::Wildcard));
        for (term, arg) in terms.iter().zip(&args) {
            if let (Term::Var(v), ArgSlot::Fresh) = (term, arg) {
                self.declare(v);
            }
        }
        self.steps.push(Step::Join {
            source,
            args,
            dedup,
        });
    }

    fn push_aggregate(&mut self, agg: &Aggregate) -> EvalResult<()> {
        let body = CompiledBody::compile(&agg.body, None, self.env)?;
        let inner_slots: SlotMap = body
            .vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();
        let group_slots = agg
            .group_by
            .iter()
            .map(|v| {
                inner_slots
                    .get(v)
                    .copied()
                    .ok_or_else(|| EvalError::unbound(format!("aggregate `{}`", agg.result), v))
            })
            .collect::<EvalResult<Vec<_>>>()?;
        let target = agg
            .target
            .as_ref()
            .map(|t| CompiledExpr::compile(t, &inner_slots))
            .transpose()?;

        let compiled = CompiledAggregate {
            label: format!("{}#{:?}", agg.result, agg.func).to_lowercase(),
            func: agg.func,
            grouped: !agg.group_by.is_empty(),
            body,
            group_slots,
            target,
        };
        let mut terms: Vec<Term> = agg.group_by.iter().map(|v| Term::var(v)).collect();
        terms.push(Term::var(&agg.result));
        self.push_join(Source::Aggregate(Box::new(compiled)), &terms);
        Ok(())
    }

    fn arg_slots(&self, terms: &[Term]) -> Vec<ArgSlot> {
        let mut first: HashMap<&str, usize> = HashMap::new();
        terms
            .iter()
            .enumerate()
            .map(|(j, term)| match term {
                Term::Const(value) => ArgSlot::Const(value.clone()),
                Term::Wildcard => ArgSlot::Wildcard,
                Term::Var(v) => {
                    if let Some(&slot) = self.slots.get(v) {
                        ArgSlot::Bound(slot)
                    } else if let Some(&pos) = first.get(v.as_str()) {
                        ArgSlot::Repeat(pos)
                    } else {
                        first.insert(v.as_str(), j);
                        ArgSlot::Fresh
                    }
                }
            })
            .collect()
    }
}

fn key_columns(args: &[ArgSlot]) -> (Vec<KeySource>, Vec<usize>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        match arg {
            ArgSlot::Const(value) => {
                left.push(KeySource::Const(value.clone()));
                right.push(i);
            }
            ArgSlot::Bound(slot) => {
                left.push(KeySource::Column(*slot));
                right.push(i);
            }
            _ => {}
        }
    }
    (left, right)
}

fn join_atom(
    ctx: &EvalContext<'_>,
    rows: &[Tuple],
    rel: &Relation,
    args: &[ArgSlot],
) -> EvalResult<Vec<Tuple>> {
    let (left_keys, right_keys) = key_columns(args);
    let emit = |l: &Tuple, r: &Tuple| -> Option<Tuple> {
        let mut out = Vec::with_capacity(l.len() + args.len());
        out.extend(l.iter().cloned());
        for (i, arg) in args.iter().enumerate() {
            match arg {
                ArgSlot::Fresh => out.push(r[i].clone()),
                ArgSlot::Repeat(j) if r[i] != r[*j] => return None,
                _ => {}
            }
        }
        Some(out)
    };
    let (out, stats) = join_with(rows, &left_keys, rel, &right_keys, ctx.join_options(), emit);
    ctx.stats.record_join(&stats);
    if stats.truncated {
        return Err(EvalError::ResourceExhausted(format!(
            "join with `{}` passed {} tuples, limit is {}",
            rel.name(),
            stats.output,
            ctx.config.max_tuples
        )));
    }
    if stats.cartesian {
        warn!(
            relation = rel.name(),
            left = stats.left,
            right = stats.right,
            "atom shares no bound variable with the rows so far; cartesian product"
        );
    } else {
        trace!(
            relation = rel.name(),
            strategy = ?stats.strategy,
            output = stats.output,
            "join"
        );
    }
    Ok(out)
}

/// Instantiate head terms for every row
pub fn project_head(table: &BindingTable, head: &[Term]) -> EvalResult<Vec<Tuple>> {
    let cols = head
        .iter()
        .map(|term| match term {
            Term::Var(v) => table
                .slot(v)
                .map(KeySource::Column)
                .ok_or_else(|| EvalError::unbound("rule head", v)),
            Term::Const(value) => Ok(KeySource::Const(value.clone())),
            Term::Wildcard => Err(EvalError::InvalidPlan("wildcard in rule head".into())),
        })
        .collect::<EvalResult<Vec<_>>>()?;
    Ok(table
        .rows
        .iter()
        .map(|row| {
            cols.iter()
                .map(|c| match c {
                    KeySource::Column(i) => row[*i].clone(),
                    KeySource::Const(v) => v.clone(),
                })
                .collect()
        })
        .collect())
}

/// Evaluate select expressions for every row; rows whose expressions fail
/// to evaluate are dropped
pub fn project_select(
    ctx: &EvalContext<'_>,
    table: &BindingTable,
    select: &[SelectItem],
) -> EvalResult<Vec<Tuple>> {
    let slots: SlotMap = table
        .vars
        .iter()
        .enumerate()
        .map(|(i, v)| (v.clone(), i))
        .collect();
    let exprs = select
        .iter()
        .map(|item| CompiledExpr::compile(&item.expr, &slots))
        .collect::<EvalResult<Vec<_>>>()?;
    Ok(table
        .rows
        .iter()
        .filter_map(|row| {
            exprs
                .iter()
                .map(|e| e.eval(row, ctx.store))
                .collect::<Option<Tuple>>()
        })
        .collect())
}
