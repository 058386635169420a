// SPDX-License-Identifier: PMPL-1.0-or-later

//! Resolved logical plans
//!
//! Queries reach the evaluator already compiled: a [`Program`] holds the
//! derived predicates (each a set of rules) and the queries to run. Plans
//! are declarative payloads, usually loaded from JSON, and only the
//! evaluator binds them to relations.

pub mod stratify;
pub mod validate;

pub use stratify::{stratify, DependencyGraph, Polarity, Stratification, Stratum};
pub use validate::{check_predicate, check_query, SchemaCatalog, TypeEnv};

use crate::error::{EvalError, EvalResult};
use crate::types::{Column, Value};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A program argument position
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Term {
    Var(String),
    Const(Value),
    Wildcard,
}

impl Term {
    pub fn var(name: &str) -> Self {
        Term::Var(name.to_string())
    }

    pub fn val(value: impl Into<Value>) -> Self {
        Term::Const(value.into())
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Term::Var(name) => Some(name),
            _ => None,
        }
    }
}

/// Predicate application `p(t1, .., tn)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: String,
    pub args: Vec<Term>,
}

impl Atom {
    pub fn new(predicate: &str, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.to_string(),
            args,
        }
    }

    /// Variables in argument order, repeats included
    pub fn vars(&self) -> impl Iterator<Item = &str> {
        self.args.iter().filter_map(Term::as_var)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Regular-expression match; the right operand is a string constant
    Matches,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    Var(String),
    Const(Value),
    /// String concatenation; entities render as their label
    Concat(Vec<Expr>),
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_string())
    }

    pub fn val(value: impl Into<Value>) -> Self {
        Expr::Const(value.into())
    }

    pub fn concat(parts: Vec<Expr>) -> Self {
        Expr::Concat(parts)
    }

    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn vars(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Var(name) => out.push(name),
            Expr::Const(_) => {}
            Expr::Concat(parts) => parts.iter().for_each(|p| p.collect_vars(out)),
            Expr::Arith { left, right, .. } => {
                left.collect_vars(out);
                right.collect_vars(out);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
}

/// `result = func(target | body)` grouped by `group_by`.
///
/// The inner body is closed: only the `group_by` variables (and `result`)
/// connect it to the enclosing conjunction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub result: String,
    pub func: AggFunc,
    #[serde(default)]
    pub target: Option<Expr>,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub body: Vec<Literal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Literal {
    Atom(Atom),
    Not(Atom),
    Compare { op: CmpOp, left: Expr, right: Expr },
    /// Binds a fresh variable, or checks equality when already bound
    Assign { var: String, expr: Expr },
    Aggregate(Aggregate),
}

impl Literal {
    pub fn atom(predicate: &str, args: Vec<Term>) -> Self {
        Literal::Atom(Atom::new(predicate, args))
    }

    pub fn not(predicate: &str, args: Vec<Term>) -> Self {
        Literal::Not(Atom::new(predicate, args))
    }

    pub fn compare(op: CmpOp, left: Expr, right: Expr) -> Self {
        Literal::Compare { op, left, right }
    }

    pub fn assign(var: &str, expr: Expr) -> Self {
        Literal::Assign {
            var: var.to_string(),
            expr,
        }
    }

    /// Predicates this literal reads, with the polarity of the dependency
    pub fn dependencies(&self) -> Vec<(&str, Polarity)> {
        match self {
            Literal::Atom(atom) => vec![(atom.predicate.as_str(), Polarity::Positive)],
            Literal::Not(atom) => vec![(atom.predicate.as_str(), Polarity::Negative)],
            Literal::Compare { .. } | Literal::Assign { .. } => Vec::new(),
            Literal::Aggregate(agg) => agg
                .body
                .iter()
                .flat_map(|lit| lit.dependencies())
                .map(|(name, _)| (name, Polarity::Aggregate))
                .collect(),
        }
    }

    /// If this literal can bind a variable given `bound`, the variable and
    /// the expression computing it.
    ///
    /// `v = e` binds `v` once every variable of `e` is bound, and so does a
    /// comparison `v == e` (in either operand order) whose other side is
    /// fully bound.
    pub fn binding<'a>(&'a self, bound: &HashSet<String>) -> Option<(&'a str, &'a Expr)> {
        let ready = |expr: &Expr| expr.vars().iter().all(|v| bound.contains(*v));
        match self {
            Literal::Assign { var, expr } if !bound.contains(var) && ready(expr) => {
                Some((var.as_str(), expr))
            }
            Literal::Compare {
                op: CmpOp::Eq,
                left,
                right,
            } => match (left, right) {
                (Expr::Var(v), other) if !bound.contains(v) && ready(other) => {
                    Some((v.as_str(), other))
                }
                (other, Expr::Var(v)) if !bound.contains(v) && ready(other) => {
                    Some((v.as_str(), other))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// `head :- body`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub head: Vec<Term>,
    pub body: Vec<Literal>,
}

impl Rule {
    pub fn new(head: Vec<Term>, body: Vec<Literal>) -> Self {
        Self { head, body }
    }

    /// Positive atoms of the body reading a predicate in `members`
    pub fn recursive_positions(&self, members: &HashSet<&str>) -> Vec<usize> {
        self.body
            .iter()
            .enumerate()
            .filter_map(|(i, lit)| match lit {
                Literal::Atom(atom) if members.contains(atom.predicate.as_str()) => Some(i),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateDef {
    pub name: String,
    pub columns: Vec<Column>,
    pub rules: Vec<Rule>,
}

impl PredicateDef {
    pub fn new(name: &str, columns: Vec<Column>, rules: Vec<Rule>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rules,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    /// Any output shape
    #[default]
    Table,
    /// Exactly `(entity, message, severity)`
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectItem {
    pub name: String,
    pub expr: Expr,
}

impl SelectItem {
    pub fn new(name: &str, expr: Expr) -> Self {
        Self {
            name: name.to_string(),
            expr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    #[serde(default)]
    pub kind: QueryKind,
    pub body: Vec<Literal>,
    pub select: Vec<SelectItem>,
}

impl Query {
    pub fn new(name: &str, kind: QueryKind, body: Vec<Literal>, select: Vec<SelectItem>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            body,
            select,
        }
    }

    /// Predicates read directly by the query body
    pub fn dependencies(&self) -> Vec<&str> {
        self.body
            .iter()
            .flat_map(|lit| lit.dependencies())
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub predicates: Vec<PredicateDef>,
    #[serde(default)]
    pub queries: Vec<Query>,
}

impl Program {
    pub fn new(predicates: Vec<PredicateDef>, queries: Vec<Query>) -> Self {
        Self {
            predicates,
            queries,
        }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parsing query plan")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading query plan {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("loading {}", path.display()))
    }

    pub fn predicate(&self, name: &str) -> Option<&PredicateDef> {
        self.predicates.iter().find(|p| p.name == name)
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }

    /// Reject duplicate predicate or query names
    pub fn check_names(&self) -> EvalResult<()> {
        let mut seen = HashSet::new();
        for pred in &self.predicates {
            if !seen.insert(pred.name.as_str()) {
                return Err(EvalError::InvalidPlan(format!(
                    "predicate `{}` defined twice",
                    pred.name
                )));
            }
        }
        let mut queries = HashSet::new();
        for query in &self.queries {
            if !queries.insert(query.name.as_str()) {
                return Err(EvalError::InvalidPlan(format!(
                    "query `{}` defined twice",
                    query.name
                )));
            }
        }
        Ok(())
    }
}
