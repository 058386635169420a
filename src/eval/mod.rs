// SPDX-License-Identifier: PMPL-1.0-or-later

//! Rule and query body evaluation
//!
//! `body` turns a conjunction into joins, antijoins, filters and bindings
//! over a binding table; `fixpoint` drives recursive strata to their least
//! fixpoint with semi-naive iteration.

pub mod body;
pub mod expr;
pub mod fixpoint;

pub use body::{project_head, project_select, BindingTable, CompiledBody, RelationEnv};
pub use expr::{CompiledCompare, CompiledExpr};
pub use fixpoint::{derive_round, evaluate_stratum, StratumOutput};
