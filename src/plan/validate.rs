// SPDX-License-Identifier: PMPL-1.0-or-later

//! Static plan validation
//!
//! Every rule body and query body is checked before evaluation starts:
//! predicates must exist with the right arity, each variable must have one
//! column type across all literals, comparisons and head terms may only use
//! bound variables, and negated atoms may only use variables bound by the
//! positive part of the conjunction.

use crate::error::{EvalError, EvalResult};
use crate::plan::{AggFunc, Aggregate, Atom, CmpOp, Expr, Literal, PredicateDef, Query, QueryKind, Term};
use crate::store::FactStore;
use crate::types::{Column, ColumnType, Schema};
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// Variable name to column type, built incrementally per conjunction
pub type TypeEnv = HashMap<String, ColumnType>;

/// Resolves predicate names to schemas: derived predicates first, then base
/// relations of the store
pub struct SchemaCatalog<'a> {
    store: &'a FactStore,
    derived: HashMap<&'a str, Schema>,
}

impl<'a> SchemaCatalog<'a> {
    pub fn new(store: &'a FactStore, predicates: &'a [PredicateDef]) -> Self {
        let derived = predicates
            .iter()
            .map(|p| (p.name.as_str(), Schema::new(p.columns.clone())))
            .collect();
        Self { store, derived }
    }

    pub fn schema(&self, name: &str) -> EvalResult<Schema> {
        if let Some(schema) = self.derived.get(name) {
            return Ok(schema.clone());
        }
        self.store
            .schema(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownPredicate(name.to_string()))
    }
}

/// Validate every rule of a derived predicate
pub fn check_predicate(pred: &PredicateDef, catalog: &SchemaCatalog<'_>) -> EvalResult<()> {
    if catalog.store.has_relation(&pred.name) {
        return Err(EvalError::InvalidPlan(format!(
            "derived predicate `{}` shadows a base relation",
            pred.name
        )));
    }
    for (i, rule) in pred.rules.iter().enumerate() {
        let context = format!("rule {} of `{}`", i, pred.name);
        if rule.head.len() != pred.columns.len() {
            return Err(EvalError::ArityMismatch {
                predicate: pred.name.clone(),
                expected: pred.columns.len(),
                found: rule.head.len(),
            });
        }
        let env = check_body(&context, &rule.body, catalog)?;
        for (term, column) in rule.head.iter().zip(&pred.columns) {
            match term {
                Term::Var(var) => {
                    let ty = env
                        .get(var)
                        .copied()
                        .ok_or_else(|| EvalError::unbound(format!("head of {}", context), var))?;
                    expect_type(&format!("head column `{}` of {}", column.name, context), column.ty, ty)?;
                }
                Term::Const(value) => {
                    expect_type(&format!("head column `{}` of {}", column.name, context), column.ty, value.ty())?;
                }
                Term::Wildcard => {
                    return Err(EvalError::InvalidPlan(format!(
                        "wildcard in head of {}",
                        context
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Validate a query and return the schema of its output columns
pub fn check_query(query: &Query, catalog: &SchemaCatalog<'_>) -> EvalResult<Schema> {
    let context = format!("query `{}`", query.name);
    if query.select.is_empty() {
        return Err(EvalError::InvalidPlan(format!("{} selects nothing", context)));
    }
    let env = check_body(&context, &query.body, catalog)?;

    let mut columns = Vec::with_capacity(query.select.len());
    for item in &query.select {
        let ty = expr_type(&format!("select `{}` of {}", item.name, context), &item.expr, &env)?;
        columns.push(Column::new(&item.name, ty));
    }

    if query.kind == QueryKind::Diagnostic {
        let expected = [ColumnType::Entity, ColumnType::String, ColumnType::Int];
        if columns.len() != expected.len() {
            return Err(EvalError::InvalidPlan(format!(
                "diagnostic {} must select (entity, message, severity), found {} column(s)",
                context,
                columns.len()
            )));
        }
        for (column, ty) in columns.iter().zip(expected) {
            expect_type(&format!("diagnostic column `{}` of {}", column.name, context), ty, column.ty)?;
        }
    }

    Ok(Schema::new(columns))
}

/// Check a conjunction and return the types of the variables it binds
pub(crate) fn check_body(
    context: &str,
    body: &[Literal],
    catalog: &SchemaCatalog<'_>,
) -> EvalResult<TypeEnv> {
    let mut env = TypeEnv::new();

    // Positive atoms bind first; their column types seed the environment.
    for lit in body {
        if let Literal::Atom(atom) = lit {
            bind_atom(context, atom, catalog, &mut env)?;
        }
    }

    for lit in body {
        if let Literal::Aggregate(agg) = lit {
            check_aggregate(context, agg, catalog, &mut env)?;
        }
    }

    // Assignments and equalities bind in dependency order.
    let mut pending: Vec<&Literal> = body
        .iter()
        .filter(|lit| matches!(lit, Literal::Assign { .. } | Literal::Compare { .. }))
        .collect();
    loop {
        let bound: HashSet<String> = env.keys().cloned().collect();
        let next = pending
            .iter()
            .position(|lit| lit.binding(&bound).is_some());
        let Some(pos) = next else { break };
        let lit = pending.remove(pos);
        if let Some((var, expr)) = lit.binding(&bound) {
            let ty = expr_type(context, expr, &env)?;
            env.insert(var.to_string(), ty);
        }
    }

    for lit in pending {
        match lit {
            Literal::Assign { var, expr } => {
                let ty = expr_type(context, expr, &env)?;
                let bound = env
                    .get(var)
                    .copied()
                    .ok_or_else(|| EvalError::unbound(context, var))?;
                expect_type(&format!("`{}` in {}", var, context), bound, ty)?;
            }
            Literal::Compare { op, left, right } => {
                check_compare(context, *op, left, right, &env)?;
            }
            _ => {}
        }
    }

    for lit in body {
        if let Literal::Not(atom) = lit {
            check_negation(context, atom, catalog, &env)?;
        }
    }

    Ok(env)
}

fn bind_atom(
    context: &str,
    atom: &Atom,
    catalog: &SchemaCatalog<'_>,
    env: &mut TypeEnv,
) -> EvalResult<()> {
    let schema = catalog.schema(&atom.predicate)?;
    check_arity(atom, &schema)?;
    for (term, column) in atom.args.iter().zip(&schema.columns) {
        let where_ = format!("argument `{}` of `{}` in {}", column.name, atom.predicate, context);
        match term {
            Term::Var(var) => match env.get(var) {
                Some(&ty) => expect_type(&where_, ty, column.ty)?,
                None => {
                    env.insert(var.clone(), column.ty);
                }
            },
            Term::Const(value) => expect_type(&where_, column.ty, value.ty())?,
            Term::Wildcard => {}
        }
    }
    Ok(())
}

fn check_negation(
    context: &str,
    atom: &Atom,
    catalog: &SchemaCatalog<'_>,
    env: &TypeEnv,
) -> EvalResult<()> {
    let schema = catalog.schema(&atom.predicate)?;
    check_arity(atom, &schema)?;

    let mut named = HashSet::new();
    let unbound: Vec<String> = atom
        .vars()
        .filter(|var| !env.contains_key(*var) && named.insert(*var))
        .map(str::to_string)
        .collect();
    if !unbound.is_empty() {
        return Err(EvalError::UnsafeNegation {
            context: context.to_string(),
            predicate: atom.predicate.clone(),
            vars: unbound,
        });
    }

    for (term, column) in atom.args.iter().zip(&schema.columns) {
        let where_ = format!("argument `{}` of `not {}` in {}", column.name, atom.predicate, context);
        match term {
            Term::Var(var) => expect_type(&where_, column.ty, env[var])?,
            Term::Const(value) => expect_type(&where_, column.ty, value.ty())?,
            Term::Wildcard => {}
        }
    }
    Ok(())
}

fn check_aggregate(
    context: &str,
    agg: &Aggregate,
    catalog: &SchemaCatalog<'_>,
    env: &mut TypeEnv,
) -> EvalResult<()> {
    let inner_context = format!("aggregate `{}` in {}", agg.result, context);
    let inner = check_body(&inner_context, &agg.body, catalog)?;

    for var in &agg.group_by {
        let ty = inner
            .get(var)
            .copied()
            .ok_or_else(|| EvalError::unbound(&inner_context, var))?;
        bind_or_expect(&inner_context, env, var, ty)?;
    }

    let target = agg
        .target
        .as_ref()
        .map(|expr| expr_type(&inner_context, expr, &inner))
        .transpose()?;

    let result_ty = match (agg.func, target) {
        (AggFunc::Count, _) => ColumnType::Int,
        (AggFunc::Sum, Some(ty)) => {
            expect_type(&inner_context, ColumnType::Int, ty)?;
            ColumnType::Int
        }
        (AggFunc::Min | AggFunc::Max, Some(ty)) => ty,
        (func, None) => {
            return Err(EvalError::InvalidPlan(format!(
                "{:?} in {} needs a target expression",
                func, inner_context
            )));
        }
    };
    bind_or_expect(&inner_context, env, &agg.result, result_ty)
}

fn check_compare(
    context: &str,
    op: CmpOp,
    left: &Expr,
    right: &Expr,
    env: &TypeEnv,
) -> EvalResult<()> {
    let lty = expr_type(context, left, env)?;
    let rty = expr_type(context, right, env)?;
    match op {
        CmpOp::Eq | CmpOp::Ne => expect_type(context, lty, rty),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if !matches!(lty, ColumnType::Int | ColumnType::String) {
                return Err(EvalError::type_mismatch(context, ColumnType::Int, lty));
            }
            expect_type(context, lty, rty)
        }
        CmpOp::Matches => {
            expect_type(context, ColumnType::String, lty)?;
            match right {
                Expr::Const(value) => {
                    let pattern = value.as_str().ok_or_else(|| {
                        EvalError::type_mismatch(context, ColumnType::String, value.ty())
                    })?;
                    Regex::new(pattern).map_err(|err| {
                        EvalError::InvalidPlan(format!("bad pattern in {}: {}", context, err))
                    })?;
                    Ok(())
                }
                _ => Err(EvalError::InvalidPlan(format!(
                    "pattern of `matches` in {} must be a string constant",
                    context
                ))),
            }
        }
    }
}

/// Infer the type of an expression under `env`
pub(crate) fn expr_type(context: &str, expr: &Expr, env: &TypeEnv) -> EvalResult<ColumnType> {
    match expr {
        Expr::Var(var) => env
            .get(var)
            .copied()
            .ok_or_else(|| EvalError::unbound(context, var)),
        Expr::Const(value) => Ok(value.ty()),
        Expr::Concat(parts) => {
            for part in parts {
                expr_type(context, part, env)?;
            }
            Ok(ColumnType::String)
        }
        Expr::Arith { op, left, right } => {
            let where_ = format!("{:?} in {}", op, context);
            expect_type(&where_, ColumnType::Int, expr_type(context, left, env)?)?;
            expect_type(&where_, ColumnType::Int, expr_type(context, right, env)?)?;
            Ok(ColumnType::Int)
        }
    }
}

fn bind_or_expect(context: &str, env: &mut TypeEnv, var: &str, ty: ColumnType) -> EvalResult<()> {
    match env.get(var) {
        Some(&bound) => expect_type(&format!("`{}` in {}", var, context), bound, ty),
        None => {
            env.insert(var.to_string(), ty);
            Ok(())
        }
    }
}

fn check_arity(atom: &Atom, schema: &Schema) -> EvalResult<()> {
    if atom.args.len() != schema.arity() {
        return Err(EvalError::ArityMismatch {
            predicate: atom.predicate.clone(),
            expected: schema.arity(),
            found: atom.args.len(),
        });
    }
    Ok(())
}

fn expect_type(context: &str, expected: ColumnType, found: ColumnType) -> EvalResult<()> {
    if expected == found {
        Ok(())
    } else {
        Err(EvalError::type_mismatch(context, expected, found))
    }
}
