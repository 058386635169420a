// SPDX-License-Identifier: PMPL-1.0-or-later

//! Dependency graph and stratification of derived predicates
//!
//! Strongly connected components are found with Tarjan's algorithm. Edges
//! point from a predicate to the predicates its rules read, so Tarjan emits
//! every component after all components it depends on; the emission order is
//! therefore already a valid evaluation order.

use crate::error::EvalError;
use crate::plan::PredicateDef;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// How a rule body reads a predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Positive,
    Negative,
    /// Read inside an aggregate body
    Aggregate,
}

impl Polarity {
    /// Edges that must not close a cycle
    pub fn is_monotone(self) -> bool {
        matches!(self, Polarity::Positive)
    }

    fn describe(self) -> &'static str {
        match self {
            Polarity::Positive => "recursion",
            Polarity::Negative => "negation",
            Polarity::Aggregate => "aggregation",
        }
    }
}

/// Dependencies among derived predicates; base relations are leaves and
/// are left out.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Vec<(usize, Polarity)>>,
}

impl DependencyGraph {
    pub fn build(predicates: &[PredicateDef]) -> Self {
        let names: Vec<String> = predicates.iter().map(|p| p.name.clone()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();

        let edges = predicates
            .iter()
            .map(|pred| {
                let mut out: Vec<(usize, Polarity)> = Vec::new();
                for rule in &pred.rules {
                    for lit in &rule.body {
                        for (dep, polarity) in lit.dependencies() {
                            if let Some(&target) = index.get(dep) {
                                if !out.contains(&(target, polarity)) {
                                    out.push((target, polarity));
                                }
                            }
                        }
                    }
                }
                out
            })
            .collect();

        Self {
            names,
            index,
            edges,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Derived predicates read directly by `name`
    pub fn dependencies(&self, name: &str) -> Vec<(&str, Polarity)> {
        self.index
            .get(name)
            .map(|&i| {
                self.edges[i]
                    .iter()
                    .map(|&(t, p)| (self.names[t].as_str(), p))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Strongly connected components, dependencies first
    fn components(&self) -> Vec<Vec<usize>> {
        let mut tarjan = Tarjan {
            graph: self,
            counter: 0,
            index: vec![None; self.len()],
            lowlink: vec![0; self.len()],
            on_stack: vec![false; self.len()],
            stack: Vec::new(),
            out: Vec::new(),
        };
        for node in 0..self.len() {
            if tarjan.index[node].is_none() {
                tarjan.visit(node);
            }
        }
        tarjan.out
    }

    /// Shortest path `from -> .. -> to` staying inside `members`
    fn path_within(&self, from: usize, to: usize, members: &HashSet<usize>) -> Vec<usize> {
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                break;
            }
            for &(next, _) in &self.edges[node] {
                if members.contains(&next) && seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        let mut path = vec![to];
        let mut cur = to;
        while cur != from {
            match parent.get(&cur) {
                Some(&p) => {
                    path.push(p);
                    cur = p;
                }
                None => break,
            }
        }
        path.reverse();
        path
    }
}

struct Tarjan<'g> {
    graph: &'g DependencyGraph,
    counter: usize,
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    out: Vec<Vec<usize>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, node: usize) {
        self.index[node] = Some(self.counter);
        self.lowlink[node] = self.counter;
        self.counter += 1;
        self.stack.push(node);
        self.on_stack[node] = true;

        let graph = self.graph;
        for &(next, _) in &graph.edges[node] {
            match self.index[next] {
                None => {
                    self.visit(next);
                    self.lowlink[node] = self.lowlink[node].min(self.lowlink[next]);
                }
                Some(idx) if self.on_stack[next] => {
                    self.lowlink[node] = self.lowlink[node].min(idx);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[node]) == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack[member] = false;
                component.push(member);
                if member == node {
                    break;
                }
            }
            component.sort_unstable();
            self.out.push(component);
        }
    }
}

/// A maximal set of mutually recursive predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stratum {
    pub id: usize,
    pub predicates: Vec<String>,
    /// Whether any member reads a member of the same stratum
    pub recursive: bool,
    /// Strata read directly, all with a smaller id
    pub depends_on: Vec<usize>,
    /// Longest dependency chain below this stratum; strata sharing a level
    /// never depend on each other
    pub level: usize,
}

impl Stratum {
    pub fn contains(&self, name: &str) -> bool {
        self.predicates.iter().any(|p| p == name)
    }
}

#[derive(Debug, Default)]
pub struct Stratification {
    pub strata: Vec<Stratum>,
    stratum_of: HashMap<String, usize>,
    invalid: HashMap<String, EvalError>,
}

impl Stratification {
    pub fn stratum_of(&self, name: &str) -> Option<&Stratum> {
        self.stratum_of.get(name).map(|&id| &self.strata[id])
    }

    /// Error recorded for a predicate that sits on a non-monotone cycle
    pub fn error_for(&self, name: &str) -> Option<&EvalError> {
        self.invalid.get(name)
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }

    /// Strata transitively needed to evaluate `roots`, ordered by level and
    /// then id. Names that are not derived predicates are ignored.
    pub fn required<'a, I>(&self, roots: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut needed: BTreeSet<usize> = BTreeSet::new();
        let mut work: Vec<usize> = roots
            .into_iter()
            .filter_map(|name| self.stratum_of.get(name).copied())
            .collect();
        while let Some(id) = work.pop() {
            if needed.insert(id) {
                work.extend(self.strata[id].depends_on.iter().copied());
            }
        }
        let mut ids: Vec<usize> = needed.into_iter().collect();
        ids.sort_by_key(|&id| (self.strata[id].level, id));
        ids
    }

    pub fn max_level(&self) -> usize {
        self.strata.iter().map(|s| s.level).max().unwrap_or(0)
    }
}

/// Partition derived predicates into strata.
///
/// A component containing a negative or aggregate edge between two of its
/// members cannot be stratified; every member of it is recorded as invalid
/// with an `UnstratifiableNegation` naming the offending cycle. The
/// component is still returned as a stratum so that unrelated predicates
/// keep their positions.
pub fn stratify(predicates: &[PredicateDef]) -> Stratification {
    let graph = DependencyGraph::build(predicates);
    let components = graph.components();

    let mut component_of = vec![0usize; graph.len()];
    for (id, members) in components.iter().enumerate() {
        for &m in members {
            component_of[m] = id;
        }
    }

    let mut result = Stratification::default();
    for (id, members) in components.iter().enumerate() {
        let member_set: HashSet<usize> = members.iter().copied().collect();
        let mut depends_on: BTreeSet<usize> = BTreeSet::new();
        let mut recursive = false;
        let mut violation: Option<(usize, usize, Polarity)> = None;

        for &m in members {
            for &(target, polarity) in &graph.edges[m] {
                if member_set.contains(&target) {
                    recursive = true;
                    if !polarity.is_monotone() && violation.is_none() {
                        violation = Some((m, target, polarity));
                    }
                } else {
                    depends_on.insert(component_of[target]);
                }
            }
        }

        if let Some((from, to, polarity)) = violation {
            let mut cycle: Vec<String> = vec![graph.names[from].clone()];
            cycle.extend(
                graph
                    .path_within(to, from, &member_set)
                    .into_iter()
                    .map(|n| graph.names[n].clone()),
            );
            for &m in members {
                result.invalid.insert(
                    graph.names[m].clone(),
                    EvalError::UnstratifiableNegation {
                        predicate: graph.names[m].clone(),
                        via: polarity.describe(),
                        cycle: cycle.clone(),
                    },
                );
            }
        }

        let level = depends_on
            .iter()
            .map(|&d| result.strata[d].level + 1)
            .max()
            .unwrap_or(0);
        let predicates: Vec<String> = members.iter().map(|&m| graph.names[m].clone()).collect();
        for name in &predicates {
            result.stratum_of.insert(name.clone(), id);
        }
        result.strata.push(Stratum {
            id,
            predicates,
            recursive,
            depends_on: depends_on.into_iter().collect(),
            level,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Literal, Rule, Term};
    use crate::types::{Column, ColumnType};

    fn pred(name: &str, body: Vec<Literal>) -> PredicateDef {
        PredicateDef::new(
            name,
            vec![Column::new("x", ColumnType::Int)],
            vec![Rule::new(vec![Term::var("x")], body)],
        )
    }

    fn pos(name: &str) -> Literal {
        Literal::atom(name, vec![Term::var("x")])
    }

    fn neg(name: &str) -> Literal {
        Literal::not(name, vec![Term::var("x")])
    }

    #[test]
    fn test_dependencies_come_first() {
        let preds = vec![
            pred("top", vec![pos("base"), neg("mid")]),
            pred("mid", vec![pos("low")]),
            pred("low", vec![pos("base")]),
        ];
        let strat = stratify(&preds);
        assert!(strat.is_valid());
        let low = strat.stratum_of("low").unwrap();
        let mid = strat.stratum_of("mid").unwrap();
        let top = strat.stratum_of("top").unwrap();
        assert!(low.id < mid.id && mid.id < top.id);
        assert_eq!((low.level, mid.level, top.level), (0, 1, 2));
        assert!(!top.recursive);
        assert_eq!(strat.required(["top"]), vec![low.id, mid.id, top.id]);
        assert_eq!(strat.required(["mid"]), vec![low.id, mid.id]);
    }

    #[test]
    fn test_mutual_recursion_shares_stratum() {
        let preds = vec![
            pred("even", vec![pos("zero")]),
            pred("odd", vec![pos("even")]),
            pred("even2", vec![pos("odd")]),
        ];
        let mut preds = preds;
        preds[0].rules.push(Rule::new(vec![Term::var("x")], vec![pos("odd")]));
        let strat = stratify(&preds);
        let even = strat.stratum_of("even").unwrap();
        assert!(even.recursive);
        assert!(even.contains("odd"));
        assert_eq!(strat.stratum_of("odd").unwrap().id, even.id);
        assert!(strat.stratum_of("even2").unwrap().id > even.id);
    }

    #[test]
    fn test_self_loop_is_recursive() {
        let preds = vec![pred("reach", vec![pos("reach")])];
        let strat = stratify(&preds);
        assert!(strat.stratum_of("reach").unwrap().recursive);
    }

    #[test]
    fn test_negative_cycle_rejected() {
        let preds = vec![
            pred("p", vec![pos("base"), neg("q")]),
            pred("q", vec![pos("p")]),
            pred("ok", vec![pos("base")]),
        ];
        let strat = stratify(&preds);
        assert!(!strat.is_valid());
        assert!(strat.error_for("ok").is_none());
        match strat.error_for("q") {
            Some(EvalError::UnstratifiableNegation { via, cycle, .. }) => {
                assert_eq!(*via, "negation");
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_independent_strata_share_level() {
        let preds = vec![
            pred("a", vec![pos("base")]),
            pred("b", vec![pos("base")]),
            pred("c", vec![pos("a"), pos("b")]),
        ];
        let strat = stratify(&preds);
        assert_eq!(strat.stratum_of("a").unwrap().level, 0);
        assert_eq!(strat.stratum_of("b").unwrap().level, 0);
        assert_eq!(strat.stratum_of("c").unwrap().level, 1);
        assert_eq!(strat.max_level(), 1);
    }
}
