// SPDX-License-Identifier: PMPL-1.0-or-later

//! Grouped aggregation
//!
//! The input is consumed completely before any group is emitted, so an
//! aggregate always sees a fully materialized relation.

use crate::plan::AggFunc;
use crate::types::{Tuple, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(i64),
    Best(Option<Value>),
}

impl Accumulator {
    fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Accumulator::Count(0),
            AggFunc::Sum => Accumulator::Sum(0),
            AggFunc::Min | AggFunc::Max => Accumulator::Best(None),
        }
    }

    fn add(&mut self, func: AggFunc, value: Option<Value>) {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(total) => {
                if let Some(Value::Int(v)) = value {
                    *total = total.wrapping_add(v);
                }
            }
            Accumulator::Best(best) => {
                let Some(value) = value else { return };
                let replace = match best {
                    None => true,
                    Some(current) => match func {
                        AggFunc::Min => value < *current,
                        _ => value > *current,
                    },
                };
                if replace {
                    *best = Some(value);
                }
            }
        }
    }

    fn finish(self) -> Option<Value> {
        match self {
            Accumulator::Count(n) | Accumulator::Sum(n) => Some(Value::Int(n)),
            Accumulator::Best(best) => best,
        }
    }
}

/// Fold `(group key, target value)` items into one tuple per group:
/// the key followed by the aggregate.
///
/// Without grouping there is exactly one implicit group, so `count` and
/// `sum` over an empty input still yield `0`. `min` and `max` of an empty
/// group yield nothing.
pub fn fold_groups<I>(func: AggFunc, grouped: bool, items: I) -> Vec<Tuple>
where
    I: IntoIterator<Item = (Vec<Value>, Option<Value>)>,
{
    let mut groups: HashMap<Vec<Value>, Accumulator> = HashMap::new();
    if !grouped {
        groups.insert(Vec::new(), Accumulator::new(func));
    }
    for (key, value) in items {
        groups
            .entry(key)
            .or_insert_with(|| Accumulator::new(func))
            .add(func, value);
    }
    groups
        .into_iter()
        .filter_map(|(mut key, acc)| {
            acc.finish().map(|v| {
                key.push(v);
                key
            })
        })
        .collect()
}
