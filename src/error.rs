// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error taxonomy of the evaluator

use crate::types::ColumnType;
use thiserror::Error;

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Everything that can go wrong while planning or evaluating a query.
///
/// Static variants are raised while a query is prepared and never after
/// evaluation has started. Runtime variants abort only the query that
/// raised them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unknown predicate `{0}`")]
    UnknownPredicate(String),

    #[error(
        "unsafe negation in {context}: variable(s) {} of `not {predicate}` are not bound by the conjunction",
        .vars.join(", ")
    )]
    UnsafeNegation {
        context: String,
        predicate: String,
        vars: Vec<String>,
    },

    #[error(
        "unstratifiable {via}: `{predicate}` depends on itself through {via} ({})",
        .cycle.join(" -> ")
    )]
    UnstratifiableNegation {
        predicate: String,
        via: &'static str,
        cycle: Vec<String>,
    },

    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("arity mismatch for `{predicate}`: expected {expected} column(s), found {found}")]
    ArityMismatch {
        predicate: String,
        expected: usize,
        found: usize,
    },

    #[error("variable `{var}` is not bound in {context}")]
    UnboundVariable { context: String, var: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("resource budget exhausted: {0}")]
    ResourceExhausted(String),

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("malformed fact store: {0}")]
    MalformedStore(String),
}

impl EvalError {
    pub fn type_mismatch(context: impl Into<String>, expected: ColumnType, found: ColumnType) -> Self {
        EvalError::TypeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }

    pub fn unbound(context: impl Into<String>, var: &str) -> Self {
        EvalError::UnboundVariable {
            context: context.into(),
            var: var.to_string(),
        }
    }

    /// Whether the error is detected before any evaluation begins
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            EvalError::UnknownPredicate(_)
                | EvalError::UnsafeNegation { .. }
                | EvalError::UnstratifiableNegation { .. }
                | EvalError::TypeMismatch { .. }
                | EvalError::ArityMismatch { .. }
                | EvalError::UnboundVariable { .. }
                | EvalError::InvalidPlan(_)
        )
    }

    /// Stable short name, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            EvalError::UnknownPredicate(_) => "UnknownPredicate",
            EvalError::UnsafeNegation { .. } => "UnsafeNegation",
            EvalError::UnstratifiableNegation { .. } => "UnstratifiableNegation",
            EvalError::TypeMismatch { .. } => "TypeMismatch",
            EvalError::ArityMismatch { .. } => "ArityMismatch",
            EvalError::UnboundVariable { .. } => "UnboundVariable",
            EvalError::InvalidPlan(_) => "InvalidPlan",
            EvalError::ResourceExhausted(_) => "ResourceExhausted",
            EvalError::Cancelled => "Cancelled",
            EvalError::MalformedStore(_) => "MalformedStore",
        }
    }
}
