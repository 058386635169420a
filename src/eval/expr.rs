// SPDX-License-Identifier: PMPL-1.0-or-later

//! Expressions and comparisons compiled against a binding layout

use crate::error::{EvalError, EvalResult};
use crate::plan::{ArithOp, CmpOp, Expr};
use crate::store::FactStore;
use crate::types::Value;
use regex::Regex;
use std::collections::HashMap;

/// Variable name to column position in a binding row
pub type SlotMap = HashMap<String, usize>;

#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Slot(usize),
    Const(Value),
    Concat(Vec<CompiledExpr>),
    Arith {
        op: ArithOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
}

impl CompiledExpr {
    pub fn compile(expr: &Expr, slots: &SlotMap) -> EvalResult<Self> {
        Ok(match expr {
            Expr::Var(name) => CompiledExpr::Slot(
                *slots
                    .get(name)
                    .ok_or_else(|| EvalError::unbound("expression", name))?,
            ),
            Expr::Const(value) => CompiledExpr::Const(value.clone()),
            Expr::Concat(parts) => CompiledExpr::Concat(
                parts
                    .iter()
                    .map(|p| Self::compile(p, slots))
                    .collect::<EvalResult<_>>()?,
            ),
            Expr::Arith { op, left, right } => CompiledExpr::Arith {
                op: *op,
                left: Box::new(Self::compile(left, slots)?),
                right: Box::new(Self::compile(right, slots)?),
            },
        })
    }

    /// Value of the expression for `row`; `None` drops the row (division
    /// by zero, or an operand of the wrong type)
    pub fn eval(&self, row: &[Value], store: &FactStore) -> Option<Value> {
        match self {
            CompiledExpr::Slot(idx) => row.get(*idx).cloned(),
            CompiledExpr::Const(value) => Some(value.clone()),
            CompiledExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&store.render(&part.eval(row, store)?));
                }
                Some(Value::string(&out))
            }
            CompiledExpr::Arith { op, left, right } => {
                let a = left.eval(row, store)?.as_int()?;
                let b = right.eval(row, store)?.as_int()?;
                let v = match op {
                    ArithOp::Add => a.wrapping_add(b),
                    ArithOp::Sub => a.wrapping_sub(b),
                    ArithOp::Mul => a.wrapping_mul(b),
                    ArithOp::Div => a.checked_div(b).or_else(|| (b != 0).then(|| a.wrapping_div(b)))?,
                    ArithOp::Rem => a.checked_rem(b).or_else(|| (b != 0).then(|| a.wrapping_rem(b)))?,
                };
                Some(Value::Int(v))
            }
        }
    }
}

/// A comparison literal ready to filter binding rows
#[derive(Debug, Clone)]
pub struct CompiledCompare {
    op: CmpOp,
    left: CompiledExpr,
    right: CompiledExpr,
    pattern: Option<Regex>,
}

impl CompiledCompare {
    pub fn compile(op: CmpOp, left: &Expr, right: &Expr, slots: &SlotMap) -> EvalResult<Self> {
        let pattern = match (op, right) {
            (CmpOp::Matches, Expr::Const(Value::String(p))) => Some(
                Regex::new(p)
                    .map_err(|err| EvalError::InvalidPlan(format!("bad pattern `{}`: {}", p, err)))?,
            ),
            (CmpOp::Matches, _) => {
                return Err(EvalError::InvalidPlan(
                    "`matches` needs a string constant pattern".into(),
                ))
            }
            _ => None,
        };
        Ok(Self {
            op,
            left: CompiledExpr::compile(left, slots)?,
            right: CompiledExpr::compile(right, slots)?,
            pattern,
        })
    }

    /// Equality check used when an assignment targets an already bound
    /// variable
    pub fn equality(slot: usize, expr: CompiledExpr) -> Self {
        Self {
            op: CmpOp::Eq,
            left: CompiledExpr::Slot(slot),
            right: expr,
            pattern: None,
        }
    }

    pub fn test(&self, row: &[Value], store: &FactStore) -> bool {
        let Some(a) = self.left.eval(row, store) else {
            return false;
        };
        if let Some(re) = &self.pattern {
            return a.as_str().map(|s| re.is_match(s)).unwrap_or(false);
        }
        let Some(b) = self.right.eval(row, store) else {
            return false;
        };
        match self.op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Matches => false,
        }
    }
}
