//! Value representation and memory model (spec §3 "Value").
//!
//! A [`Value`] is a handle (`Rc<RefCell<Repr>>`) to a mutable cell rather
//! than an immutable tagged union: forcing a thunk overwrites the cell's
//! contents in place, so every other handle pointing at the same cell
//! observes the memoized result too (spec §4.2 "Thunk protocol"). This is
//! the idiomatic-Rust rendering of spec §9's "arena-based ownership
//! strategy" note — `Rc` supplies the sharing, `RefCell` the in-place
//! overwrite, and cycles (recursive attrsets, `let rec`) are accepted to
//! leak rather than chased by a tracing collector, same trade-off
//! `Rc<RefCell<_>>`-based lazy graphs make throughout the Rust ecosystem.

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::ast::ExprRef;
use crate::bindings::Bindings;
use crate::context::StringContext;
use crate::env::Env;
use crate::error::ErrorValue;
use crate::eval::EvalState;
use crate::list::NixList;
use crate::pos::PosIdx;
use crate::store::SourceAccessorId;
use crate::symbol::Symbol;

/// An immutable string plus its build-time dependency context (spec §3).
#[derive(Debug, Clone)]
pub struct NixString {
    pub bytes: Rc<str>,
    pub context: StringContext,
}

impl NixString {
    #[must_use]
    pub fn plain(s: impl Into<Rc<str>>) -> Self {
        Self { bytes: s.into(), context: StringContext::new() }
    }

    #[must_use]
    pub fn with_context(s: impl Into<Rc<str>>, context: StringContext) -> Self {
        Self { bytes: s.into(), context }
    }
}

/// A path value: the accessor it's relative to, plus an absolute,
/// already-canonicalised path string (spec §3).
#[derive(Debug, Clone)]
pub struct NixPath {
    pub accessor: SourceAccessorId,
    pub path: Rc<str>,
}

/// A lambda value: captured environment plus a pointer to the `Lambda`
/// AST node (spec §3).
#[derive(Debug)]
pub struct LambdaData {
    pub env: Rc<Env>,
    pub node: ExprRef,
}

pub type PrimOpFn = fn(&mut EvalState, &mut [Value], PosIdx) -> Result<Finished, ErrorValue>;

/// Descriptor for one builtin function (spec §3, §4.8).
pub struct PrimOpDescriptor {
    pub name: &'static str,
    pub arity: u8,
    pub func: PrimOpFn,
    pub arg_names: Option<&'static [&'static str]>,
    pub doc: Option<&'static str>,
    /// Internal primops (`__foo`) are only reachable via `builtins.foo`,
    /// never as a bare global (spec §4.8).
    pub internal: bool,
}

impl fmt::Debug for PrimOpDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimOpDescriptor").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

/// A curried partial application of a primop: `applied.len() < descriptor.arity`.
/// Applying one more argument either grows this (if still under arity) or
/// performs the call (spec §3, §4.2 case 4).
#[derive(Debug)]
pub struct PrimOpAppData {
    pub descriptor: Rc<PrimOpDescriptor>,
    pub applied: Vec<Value>,
}

/// Contract for an opaque foreign value (spec §3 "External").
pub trait ExternalValue: fmt::Debug {
    fn type_name(&self) -> &'static str;
    fn show(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn coerce_to_string(&self) -> Option<String> {
        None
    }
    fn values_equal(&self, other: &dyn ExternalValue) -> bool;
}

/// A finished (WHNF) value — every variant a cell can settle into once
/// forcing succeeds (spec §3's closed `Value` list, minus the in-flight
/// Thunk/App/Blackhole states which live in [`Repr`] instead).
#[derive(Debug, Clone)]
pub enum Finished {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str(NixString),
    Path(NixPath),
    Attrs(Bindings),
    List(NixList),
    Lambda(Rc<LambdaData>),
    PrimOp(Rc<PrimOpDescriptor>),
    PrimOpApp(Rc<PrimOpAppData>),
    External(Rc<dyn ExternalValue>),
}

impl Finished {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Null => "null",
            Self::Str(_) => "string",
            Self::Path(_) => "path",
            Self::Attrs(_) => "set",
            Self::List(_) => "list",
            Self::Lambda(_) | Self::PrimOp(_) | Self::PrimOpApp(_) => "lambda",
            Self::External(e) => e.type_name(),
        }
    }

    /// `Attrs` is deliberately excluded here even though a `__functor` set
    /// is callable (spec §4.2 case 5) — recognising that requires a
    /// `Symbol` lookup, which needs a `SymbolTable`, so `call_function`
    /// checks it directly instead of through this cheap approximation.
    #[must_use]
    pub fn is_callable(&self) -> bool {
        matches!(self, Self::Lambda(_) | Self::PrimOp(_) | Self::PrimOpApp(_))
    }
}

struct ThunkData {
    env: Rc<Env>,
    expr: ExprRef,
}

impl fmt::Debug for ThunkData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThunkData").finish_non_exhaustive()
    }
}

struct AppData {
    fun: Value,
    arg: Value,
}

impl fmt::Debug for AppData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppData").finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Repr {
    Thunk(ThunkData),
    App(AppData),
    Blackhole,
    Finished(Finished),
    /// A previous `force` failed. Retrying observes the same error rather
    /// than `InfiniteRecursion` (spec §4.2: "the cell must remain
    /// observably re-forceable" after a failed force).
    Failed(ErrorValue),
}

/// Handle to a mutable value cell (spec §3 "Value", "Invariants").
#[derive(Debug, Clone)]
pub struct Value(Rc<RefCell<Repr>>);

impl Value {
    fn new(repr: Repr) -> Self {
        Self(Rc::new(RefCell::new(repr)))
    }

    #[must_use]
    pub fn thunk(env: Rc<Env>, expr: ExprRef) -> Self {
        Self::new(Repr::Thunk(ThunkData { env, expr }))
    }

    #[must_use]
    pub fn app(fun: Value, arg: Value) -> Self {
        Self::new(Repr::App(AppData { fun, arg }))
    }

    #[must_use]
    pub fn blackhole() -> Self {
        Self::new(Repr::Blackhole)
    }

    #[must_use]
    pub fn finished(v: Finished) -> Self {
        Self::new(Repr::Finished(v))
    }

    #[must_use]
    pub fn int(i: i64) -> Self {
        Self::finished(Finished::Int(i))
    }

    #[must_use]
    pub fn float(f: f64) -> Self {
        Self::finished(Finished::Float(f))
    }

    #[must_use]
    pub fn bool(b: bool) -> Self {
        Self::finished(Finished::Bool(b))
    }

    #[must_use]
    pub fn null() -> Self {
        Self::finished(Finished::Null)
    }

    #[must_use]
    pub fn string_plain(s: impl Into<Rc<str>>) -> Self {
        Self::finished(Finished::Str(NixString::plain(s)))
    }

    #[must_use]
    pub fn string(ns: NixString) -> Self {
        Self::finished(Finished::Str(ns))
    }

    #[must_use]
    pub fn attrs(b: Bindings) -> Self {
        Self::finished(Finished::Attrs(b))
    }

    #[must_use]
    pub fn list(l: NixList) -> Self {
        Self::finished(Finished::List(l))
    }

    #[must_use]
    pub fn lambda(env: Rc<Env>, node: ExprRef) -> Self {
        Self::finished(Finished::Lambda(Rc::new(LambdaData { env, node })))
    }

    #[must_use]
    pub fn primop(descriptor: Rc<PrimOpDescriptor>) -> Self {
        Self::finished(Finished::PrimOp(descriptor))
    }

    /// Identity test used by `eqValues` rule 1 ("same pointer ⇒ equal").
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// `true` once the cell holds a finished value (spec §8 "WHNF
    /// sufficiency" — never true while Thunk/App/Blackhole).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(*self.0.borrow(), Repr::Finished(_))
    }

    /// Borrows the finished content. Panics if called before forcing —
    /// an internal invariant violation (spec §4.4 rule 11), never a user
    /// facing error.
    #[must_use]
    pub fn finished_ref(&self) -> FinishedRef<'_> {
        FinishedRef(Ref::map(self.0.borrow(), |r| match r {
            Repr::Finished(f) => f,
            _ => panic!("value accessed before forcing"),
        }))
    }

    /// Forces this cell to WHNF (spec §4.2 `forceValue`). A no-op if
    /// already finished. Installs `Blackhole` *before* recursing into the
    /// thunk's expression so a self-referential access observes it
    /// (spec §4.2 "Detail floor").
    pub fn force(&self, state: &mut EvalState, pos: PosIdx) -> Result<(), ErrorValue> {
        let pending = {
            let mut repr = self.0.borrow_mut();
            match &*repr {
                Repr::Finished(_) => return Ok(()),
                Repr::Blackhole => return Err(ErrorValue::infinite_recursion(pos)),
                Repr::Failed(e) => return Err(e.clone()),
                Repr::Thunk(_) => {
                    let Repr::Thunk(t) = std::mem::replace(&mut *repr, Repr::Blackhole) else { unreachable!() };
                    Pending::Thunk(t)
                }
                Repr::App(_) => {
                    let Repr::App(a) = std::mem::replace(&mut *repr, Repr::Blackhole) else { unreachable!() };
                    Pending::App(a)
                }
            }
        };
        let result = match pending {
            Pending::Thunk(t) => crate::eval::eval_expr(state, &t.env, &t.expr),
            Pending::App(a) => {
                a.fun.force(state, pos)?;
                let mut args = [a.arg];
                crate::eval::call_function_value(state, &a.fun, &mut args, pos)
            }
        };
        match result {
            Ok(finished) => {
                *self.0.borrow_mut() = Repr::Finished(finished);
                Ok(())
            }
            Err(e) => {
                *self.0.borrow_mut() = Repr::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Forces `self`, then recursively forces every reachable attribute
    /// value and list element exactly once (spec §4.2 `forceValueDeep`).
    pub fn force_deep(&self, state: &mut EvalState, pos: PosIdx) -> Result<(), ErrorValue> {
        let mut seen = Vec::new();
        self.force_deep_inner(state, pos, &mut seen)
    }

    fn force_deep_inner(&self, state: &mut EvalState, pos: PosIdx, seen: &mut Vec<Value>) -> Result<(), ErrorValue> {
        self.force(state, pos)?;
        if seen.iter().any(|v| v.ptr_eq(self)) {
            return Ok(());
        }
        seen.push(self.clone());
        let kind = self.finished_ref().clone_finished();
        match kind {
            Finished::Attrs(attrs) => {
                for a in attrs.iter() {
                    a.value.force_deep_inner(state, a.pos, seen)?;
                }
            }
            Finished::List(list) => {
                for v in list.iter() {
                    v.force_deep_inner(state, pos, seen)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    #[cfg(test)]
    #[must_use]
    pub fn debug_as_int(&self) -> Option<i64> {
        match &*self.0.borrow() {
            Repr::Finished(Finished::Int(i)) => Some(*i),
            _ => None,
        }
    }
}

enum Pending {
    Thunk(ThunkData),
    App(AppData),
}

/// A `Ref`-guarded view of a [`Value`]'s finished content.
pub struct FinishedRef<'a>(Ref<'a, Finished>);

impl FinishedRef<'_> {
    #[must_use]
    pub fn clone_finished(&self) -> Finished {
        self.0.clone()
    }
}

impl std::ops::Deref for FinishedRef<'_> {
    type Target = Finished;
    fn deref(&self) -> &Finished {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_values_are_noop_to_force() {
        let mut state = crate::eval::EvalState::for_tests();
        let v = Value::int(42);
        v.force(&mut state, PosIdx::NONE).unwrap();
        assert_eq!(v.debug_as_int(), Some(42));
    }

    #[test]
    fn blackhole_observation_is_infinite_recursion() {
        let mut state = crate::eval::EvalState::for_tests();
        let v = Value::blackhole();
        let err = v.force(&mut state, PosIdx::NONE).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InfiniteRecursion);
    }
}
