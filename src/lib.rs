// SPDX-License-Identifier: PMPL-1.0-or-later

//! qleval: query evaluation over extracted program fact databases.
//!
//! An extractor turns source code into a read-only [`store::FactStore`] of
//! typed relations. Queries arrive as compiled [`plan::Program`]s: derived
//! predicates defined by Datalog-style rules plus the queries that read
//! them. The [`exec::Executor`] stratifies the predicates, evaluates each
//! stratum to its least fixpoint with semi-naive iteration, caches derived
//! relations across queries and materializes results.
//!
//! LAYERS:
//! 1. **Store**: base relations, entity table, lazy hash indices.
//! 2. **Ops**: select, project, union, join, antijoin, aggregate.
//! 3. **Plan**: rule/query model, validation and stratification.
//! 4. **Eval**: body compilation and the fixpoint loop.
//! 5. **Exec**: scheduling, predicate cache, budgets and cancellation.

pub mod config;
pub mod error;
pub mod eval;
pub mod exec;
pub mod ops;
pub mod plan;
pub mod results;
pub mod store;
pub mod types;

pub use config::EvalConfig;
pub use error::{EvalError, EvalResult};
pub use exec::{CancellationToken, EvalStats, Executor, PreparedQuery};
pub use plan::{Program, Query};
pub use results::{BatchReport, Diagnostic, QueryOutcome, ResultSet};
pub use store::{FactStore, Relation};
pub use types::{ColumnType, EntityId, Schema, Tuple, Value};
