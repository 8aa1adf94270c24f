//! Numeric primops: thin wrappers around the `+`/`-`/`*`/`/`/`<` operator
//! semantics already implemented for the AST-level `BinOp` forms
//! (spec §4.8's `add`/`sub`/`mul`/`div`/`lessThan`), so a primop and its
//! infix counterpart can never silently drift apart.

use crate::ast::BinOp;
use crate::error::ErrorValue;
use crate::eval::{add_finished, arith_finished, as_number, compare_values, EvalState};
use crate::pos::PosIdx;
use crate::value::{Finished, Value};

fn force_finished(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<Finished, ErrorValue> {
    v.force(state, pos)?;
    Ok(v.finished_ref().clone_finished())
}

pub fn add(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_finished(state, &args[0], pos)?;
    let r = force_finished(state, &args[1], pos)?;
    add_finished(state, &l, &r, pos)
}

pub fn sub(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = as_number(&force_finished(state, &args[0], pos)?, pos)?;
    let r = as_number(&force_finished(state, &args[1], pos)?, pos)?;
    arith_finished(BinOp::Sub, l, r, pos)
}

pub fn mul(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = as_number(&force_finished(state, &args[0], pos)?, pos)?;
    let r = as_number(&force_finished(state, &args[1], pos)?, pos)?;
    arith_finished(BinOp::Mul, l, r, pos)
}

pub fn div(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = as_number(&force_finished(state, &args[0], pos)?, pos)?;
    let r = as_number(&force_finished(state, &args[1], pos)?, pos)?;
    arith_finished(BinOp::Div, l, r, pos)
}

pub fn less_than(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_finished(state, &args[0], pos)?;
    let r = force_finished(state, &args[1], pos)?;
    let ord = compare_values(state, &l, &r, pos)?;
    Ok(Finished::Bool(ord == std::cmp::Ordering::Less))
}
