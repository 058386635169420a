// SPDX-License-Identifier: PMPL-1.0-or-later

//! Equi-join and antijoin kernels
//!
//! The left side is a slice of rows (often an intermediate binding table),
//! the right side is a stored [`Relation`] so that its cached indices can be
//! probed. Key values on the left may be constants, which is how an atom
//! argument such as `p(x, 3)` restricts the right relation.

use crate::store::index::key_of;
use crate::store::Relation;
use crate::types::{Tuple, Value};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a left-side key component comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Column(usize),
    Const(Value),
}

impl KeySource {
    fn read<'a>(&'a self, row: &'a [Value]) -> &'a Value {
        match self {
            KeySource::Column(idx) => &row[*idx],
            KeySource::Const(value) => value,
        }
    }
}

fn left_key(row: &[Value], keys: &[KeySource]) -> Vec<Value> {
    keys.iter().map(|k| k.read(row).clone()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Whether probing may be spread over the rayon pool
    pub parallel: bool,
    /// Minimum driving-side size before probing goes parallel
    pub threshold: usize,
    /// Most output tuples to produce; past it the join stops early and
    /// reports itself truncated
    pub limit: usize,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            threshold: 8192,
            limit: usize::MAX,
        }
    }
}

impl JoinOptions {
    fn go_parallel(&self, len: usize) -> bool {
        self.parallel && len >= self.threshold.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// Probe a (possibly lazily built) index of the right relation
    IndexProbe,
    /// Hash the left rows and stream the right relation
    BuildLeft,
    /// No key columns
    Cartesian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinStats {
    pub strategy: JoinStrategy,
    /// A real cross product; joining against a single empty row is not one
    pub cartesian: bool,
    pub left: usize,
    pub right: usize,
    pub output: usize,
    /// Output passed `JoinOptions::limit` and was cut short
    pub truncated: bool,
}

/// Counts emitted tuples so every probe can stop once the limit is passed
struct Budget {
    limit: usize,
    emitted: AtomicUsize,
}

impl Budget {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            emitted: AtomicUsize::new(0),
        }
    }

    fn spent(&self) -> bool {
        self.emitted.load(Ordering::Relaxed) > self.limit
    }

    /// Run one probe unless the budget is already spent
    fn charge(&self, probe: impl FnOnce() -> Vec<Tuple>) -> Vec<Tuple> {
        if self.spent() {
            return Vec::new();
        }
        let rows = probe();
        self.emitted.fetch_add(rows.len(), Ordering::Relaxed);
        rows
    }
}

fn probe_chunk(len: usize) -> usize {
    (len / (rayon::current_num_threads() * 4)).max(256)
}

/// Join `left` rows with `right` on `left_keys[i] == right[right_keys[i]]`.
///
/// Every matching pair is handed to `emit`, which builds the output row or
/// returns `None` to drop the pair. Once more than `opts.limit` rows have
/// been produced no further probes run, so the output overshoots the limit
/// by at most the rows of the probes already in flight.
pub fn join_with<F>(
    left: &[Tuple],
    left_keys: &[KeySource],
    right: &Relation,
    right_keys: &[usize],
    opts: JoinOptions,
    emit: F,
) -> (Vec<Tuple>, JoinStats)
where
    F: Fn(&Tuple, &Tuple) -> Option<Tuple> + Sync,
{
    debug_assert_eq!(left_keys.len(), right_keys.len());

    let strategy = if right_keys.is_empty() {
        JoinStrategy::Cartesian
    } else if right.has_index(right_keys) || left.len() <= right.len() {
        JoinStrategy::IndexProbe
    } else {
        JoinStrategy::BuildLeft
    };

    let budget = Budget::new(opts.limit);
    let out: Vec<Tuple> = match strategy {
        JoinStrategy::Cartesian => {
            let pairs = |l: &Tuple| -> Vec<Tuple> {
                budget.charge(|| right.iter().filter_map(|r| emit(l, r)).collect())
            };
            if opts.go_parallel(left.len().saturating_mul(right.len())) && left.len() > 1 {
                left.par_iter().flat_map_iter(pairs).collect()
            } else {
                left.iter().flat_map(pairs).collect()
            }
        }
        JoinStrategy::IndexProbe => {
            let index = right.index(right_keys);
            let tuples = right.tuples();
            let probe = |l: &Tuple| -> Vec<Tuple> {
                budget.charge(|| {
                    let key = left_key(l, left_keys);
                    index
                        .get(&key)
                        .iter()
                        .filter_map(|&i| emit(l, &tuples[i]))
                        .collect()
                })
            };
            if opts.go_parallel(left.len()) {
                left.par_chunks(probe_chunk(left.len()))
                    .flat_map_iter(|chunk| chunk.iter().flat_map(&probe))
                    .collect()
            } else {
                left.iter().flat_map(probe).collect()
            }
        }
        JoinStrategy::BuildLeft => {
            let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
            for (i, row) in left.iter().enumerate() {
                table.entry(left_key(row, left_keys)).or_default().push(i);
            }
            let stream = |r: &Tuple| -> Vec<Tuple> {
                match table.get(&key_of(r, right_keys)) {
                    Some(rows) => {
                        budget.charge(|| rows.iter().filter_map(|&i| emit(&left[i], r)).collect())
                    }
                    None => Vec::new(),
                }
            };
            if opts.go_parallel(right.len()) {
                right
                    .tuples()
                    .par_chunks(probe_chunk(right.len()))
                    .flat_map_iter(|chunk| chunk.iter().flat_map(&stream))
                    .collect()
            } else {
                right.iter().flat_map(stream).collect()
            }
        }
    };

    let unit_left = left.len() == 1 && left[0].is_empty();
    let stats = JoinStats {
        strategy,
        cartesian: strategy == JoinStrategy::Cartesian && !unit_left && !right.is_empty(),
        left: left.len(),
        right: right.len(),
        output: out.len(),
        truncated: budget.spent(),
    };
    (out, stats)
}

/// Keep the rows of `left` that have no match in `right`
pub fn antijoin_with(
    mut left: Vec<Tuple>,
    left_keys: &[KeySource],
    right: &Relation,
    right_keys: &[usize],
) -> Vec<Tuple> {
    if right.is_empty() {
        return left;
    }
    if right_keys.is_empty() {
        left.clear();
        return left;
    }
    let index = right.index(right_keys);
    left.retain(|row| !index.contains_key(&left_key(row, left_keys)));
    left
}
