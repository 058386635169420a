// SPDX-License-Identifier: PMPL-1.0-or-later

//! Write-once cache of derived predicate relations

use crate::error::{EvalError, EvalResult};
use crate::store::Relation;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// One slot per derived predicate, filled at most once per run.
///
/// The slot set is fixed when the executor is built, so lookups never take
/// a lock; a second publish for the same predicate is an internal error.
#[derive(Debug, Default)]
pub struct PredicateCache {
    slots: HashMap<String, OnceLock<Arc<Relation>>>,
}

impl PredicateCache {
    pub fn new<'a, I>(names: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self {
            slots: names
                .into_iter()
                .map(|n| (n.to_string(), OnceLock::new()))
                .collect(),
        }
    }

    pub fn is_derived(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.slots.get(name).is_some_and(|slot| slot.get().is_some())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Relation>> {
        self.slots.get(name).and_then(|slot| slot.get()).cloned()
    }

    pub fn publish(&self, name: &str, relation: Relation) -> EvalResult<Arc<Relation>> {
        let slot = self.slots.get(name).ok_or_else(|| {
            EvalError::InvalidPlan(format!("`{}` is not a derived predicate", name))
        })?;
        let relation = Arc::new(relation);
        slot.set(Arc::clone(&relation)).map_err(|_| {
            EvalError::InvalidPlan(format!("predicate `{}` evaluated twice", name))
        })?;
        Ok(relation)
    }

    pub fn published_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.get().is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
