//! Evaluator core (spec §4.2): thunk forcing, function application,
//! operator semantics, coercions, and equality.
//!
//! [`EvalState`] is the session handle threaded through every call —
//! symbol/position tables, the external `Store`, configuration, the
//! tracer, and the call-depth counter — mirroring the single `EvalState`
//! god-object the teacher's `namespace.rs`/`session_manager.rs` carry for
//! an interpreter session.

use std::rc::Rc;

use crate::ast::{AttrPathPart, BinOp, ExprKind, ExprRef, Formals, Param, VarResolution, VarRef};
use crate::bindings::{Bindings, BindingsBuilder};
use crate::config::EvalConfig;
use crate::context::StringContext;
use crate::env::Env;
use crate::error::{ErrorKind, ErrorValue};
use crate::list::NixList;
use crate::pos::PositionTable;
use crate::pos::PosIdx;
use crate::store::{NullStore, SourceAccessorId, Store};
use crate::symbol::{Symbol, SymbolTable};
use crate::tracer::{EvalTracer, NoopTracer, TraceEvent};
use crate::value::{Finished, LambdaData, NixPath, NixString, PrimOpAppData, Value};

/// Symbols looked up so often by the evaluator itself (`__functor`,
/// `outPath`, ...) that interning them once at startup, rather than on
/// every attrset construction/select, is worth the field.
pub struct CommonSymbols {
    pub type_: Symbol,
    pub derivation: Symbol,
    pub out_path: Symbol,
    pub drv_path: Symbol,
    pub to_string: Symbol,
    pub functor: Symbol,
    pub overrides: Symbol,
    pub file: Symbol,
    pub line: Symbol,
    pub column: Symbol,
}

impl CommonSymbols {
    fn new(symbols: &mut SymbolTable) -> Self {
        Self {
            type_: symbols.create("type"),
            derivation: symbols.create("derivation"),
            out_path: symbols.create("outPath"),
            drv_path: symbols.create("drvPath"),
            to_string: symbols.create("__toString"),
            functor: symbols.create("__functor"),
            overrides: symbols.create("__overrides"),
            file: symbols.create("file"),
            line: symbols.create("line"),
            column: symbols.create("column"),
        }
    }
}

/// The evaluator session: interning tables, the external collaborators,
/// configuration, and the mutable call-depth counter (spec §4.2, §4.9).
pub struct EvalState {
    pub symbols: SymbolTable,
    pub positions: PositionTable,
    pub store: Rc<dyn Store>,
    pub config: EvalConfig,
    pub tracer: Box<dyn EvalTracer>,
    pub common: CommonSymbols,
    pub default_accessor: SourceAccessorId,
    /// Import-Resolution and File-Eval caches backing `builtins.import`
    /// (spec §4.6). Always present; `import` only becomes reachable from
    /// Nix code once [`Self::parser`] and [`Self::globals_env`] are set.
    pub file_evaluator: crate::file_eval::FileEvaluator,
    /// The host's Parser collaborator (spec §6) — absent for sessions
    /// that only evaluate in-memory ASTs and never call `import`.
    pub parser: Option<Rc<dyn crate::file_eval::Parser>>,
    /// The root `with`-frame built by [`crate::primops::base_env`],
    /// reused as the lexical environment every imported file evaluates
    /// in, exactly like a user-supplied `env` argument to `evalFile`.
    pub globals_env: Option<Rc<Env>>,
    call_depth: usize,
}

impl EvalState {
    #[must_use]
    pub fn new(store: Rc<dyn Store>, config: EvalConfig, tracer: Box<dyn EvalTracer>) -> Self {
        let mut symbols = SymbolTable::new();
        let common = CommonSymbols::new(&mut symbols);
        Self {
            symbols,
            positions: PositionTable::new(),
            store,
            config,
            tracer,
            common,
            default_accessor: SourceAccessorId(0),
            file_evaluator: crate::file_eval::FileEvaluator::new(),
            parser: None,
            globals_env: None,
            call_depth: 0,
        }
    }

    /// A session with a [`NullStore`] and [`NoopTracer`], for unit tests
    /// that only exercise in-memory expression evaluation.
    #[must_use]
    pub fn for_tests() -> Self {
        Self::new(Rc::new(NullStore), EvalConfig::default(), Box::new(NoopTracer))
    }

    fn enter_call(&mut self, pos: PosIdx) -> Result<(), ErrorValue> {
        self.call_depth += 1;
        if self.call_depth > self.config.max_call_depth {
            self.call_depth -= 1;
            return Err(ErrorValue::new(ErrorKind::EvalError, pos, "stack overflow (max-call-depth exceeded)"));
        }
        if self.config.trace_function_calls {
            self.tracer.on_event(&TraceEvent::FunctionCall { pos });
        }
        Ok(())
    }

    fn exit_call(&mut self, pos: PosIdx) {
        self.call_depth -= 1;
        if self.config.trace_function_calls {
            self.tracer.on_event(&TraceEvent::FunctionReturn { pos });
        }
    }
}

/// `eval(expr, value_out)` (spec §4.2): reduces `expr` in `env` to a
/// freshly allocated, not-yet-forced [`Value`]. Forcing is left to the
/// caller — the top-level entry point is itself lazy, matching
/// `evalFile`'s contract (spec §4.6).
#[must_use]
pub fn eval(env: &Rc<Env>, expr: &ExprRef) -> Value {
    Value::thunk(env.clone(), expr.clone())
}

/// Reduces `expr` in `env` straight to WHNF (spec §4.2 `forceValue`
/// applied to the result of `eval`). Every `ExprKind` is handled inline
/// rather than through virtual dispatch, per spec §9's note that the
/// AST is a closed tagged union, not a class hierarchy.
pub fn eval_expr(state: &mut EvalState, env: &Rc<Env>, expr: &ExprRef) -> Result<Finished, ErrorValue> {
    match &expr.kind {
        ExprKind::Int(i) => Ok(Finished::Int(*i)),
        ExprKind::Float(f) => Ok(Finished::Float(*f)),
        ExprKind::Str(s) => Ok(Finished::Str(NixString::plain(s.clone()))),
        ExprKind::Path(p) => Ok(Finished::Path(NixPath { accessor: state.default_accessor, path: p.clone() })),
        ExprKind::Var(v) => {
            let cell = lookup_var(state, env, v, expr.pos)?;
            cell.force(state, expr.pos)?;
            if state.config.trace_function_calls {
                state.tracer.on_event(&TraceEvent::ThunkForced { pos: expr.pos });
            }
            Ok(cell.finished_ref().clone_finished())
        }
        ExprKind::Select { base, path, default } => eval_select(state, env, base, path, default.as_ref(), expr.pos),
        ExprKind::HasAttr { base, path } => eval_has_attr(state, env, base, path),
        ExprKind::Attrs { rec, statics, dynamics } => eval_attrs(state, env, *rec, statics, dynamics, expr.pos),
        ExprKind::List(items) => {
            let vals: Vec<Value> = items.iter().map(|i| maybe_thunk(env, i)).collect();
            Ok(Finished::List(NixList::from_vec(vals)))
        }
        ExprKind::Lambda { .. } => Ok(Finished::Lambda(Rc::new(LambdaData { env: env.clone(), node: expr.clone() }))),
        ExprKind::Call { fun, args } => eval_call(state, env, fun, args, expr.pos),
        ExprKind::Let { statics, dynamics, body } => {
            let _ = dynamics; // no static displacement exists for a dynamic let-binding; unreachable lexically
            let child = build_rec_env(env, statics);
            eval_expr(state, &child, body)
        }
        ExprKind::With { env_expr, body } => {
            let with_value = Value::thunk(env.clone(), env_expr.clone());
            let child = Env::with_frame(env, with_value);
            eval_expr(state, &child, body)
        }
        ExprKind::If { cond, then_branch, else_branch } => {
            if force_bool(state, env, cond)? {
                eval_expr(state, env, then_branch)
            } else {
                eval_expr(state, env, else_branch)
            }
        }
        ExprKind::Assert { cond, body } => {
            eval_assert(state, env, cond, expr.pos)?;
            eval_expr(state, env, body)
        }
        ExprKind::Not(e) => Ok(Finished::Bool(!force_bool(state, env, e)?)),
        ExprKind::And(a, b) => Ok(Finished::Bool(force_bool(state, env, a)? && force_bool(state, env, b)?)),
        ExprKind::Or(a, b) => Ok(Finished::Bool(force_bool(state, env, a)? || force_bool(state, env, b)?)),
        ExprKind::Impl(a, b) => Ok(Finished::Bool(!force_bool(state, env, a)? || force_bool(state, env, b)?)),
        ExprKind::BinOp { op, lhs, rhs } => eval_binop(state, env, *op, lhs, rhs, expr.pos),
        ExprKind::ConcatStrings(parts) => eval_concat_strings(state, env, parts, expr.pos),
        ExprKind::Pos => Ok(eval_pos_value(state, expr.pos)),
        ExprKind::BlackHole => Err(ErrorValue::infinite_recursion(expr.pos)),
    }
}

fn force_bool(state: &mut EvalState, env: &Rc<Env>, expr: &ExprRef) -> Result<bool, ErrorValue> {
    match eval_expr(state, env, expr)? {
        Finished::Bool(b) => Ok(b),
        other => {
            Err(ErrorValue::type_error(expr.pos, format!("value is {} while a Boolean was expected", other.type_name())))
        }
    }
}

fn eval_assert(state: &mut EvalState, env: &Rc<Env>, cond: &ExprRef, pos: PosIdx) -> Result<(), ErrorValue> {
    if let ExprKind::BinOp { op: BinOp::Eq, lhs, rhs } = &cond.kind {
        let lv = eval(env, lhs);
        let rv = eval(env, rhs);
        if let Err(diff) = assert_eq_values(state, &lv, &rv, pos)? {
            return Err(ErrorValue::new(ErrorKind::AssertionError, pos, "assertion failed: lhs == rhs does not hold")
                .with_eq_diff(diff));
        }
        return Ok(());
    }
    if force_bool(state, env, cond)? {
        Ok(())
    } else {
        Err(ErrorValue::new(ErrorKind::AssertionError, pos, "assertion failed"))
    }
}

/// Evaluates `ExprKind::Pos` to `{ file, line, column }` (spec §4.2 `Pos`
/// node, backing `builtins.__curPos`-style introspection).
fn eval_pos_value(state: &mut EvalState, pos: PosIdx) -> Finished {
    let mut b = BindingsBuilder::with_capacity(3);
    match state.positions.resolve(pos) {
        Some(resolved) => {
            let _ = b.insert(state.common.file, PosIdx::NONE, Value::string_plain(resolved.file.clone()));
            let _ = b.insert(state.common.line, PosIdx::NONE, Value::int(i64::from(resolved.line)));
            let _ = b.insert(state.common.column, PosIdx::NONE, Value::int(i64::from(resolved.column)));
        }
        None => {
            let _ = b.insert(state.common.file, PosIdx::NONE, Value::string_plain(""));
            let _ = b.insert(state.common.line, PosIdx::NONE, Value::int(0));
            let _ = b.insert(state.common.column, PosIdx::NONE, Value::int(0));
        }
    }
    Finished::Attrs(b.finish(pos))
}

// ---------------------------------------------------------------------
// Variable lookup.
// ---------------------------------------------------------------------

/// `lookupVar` (spec §4.2): resolves a reference to its (unforced) cell,
/// either a direct lexical slot or, for `with`-sourced names, a walk
/// through the chain of enclosing `with` frames.
fn lookup_var(state: &mut EvalState, env: &Rc<Env>, v: &VarRef, pos: PosIdx) -> Result<Value, ErrorValue> {
    match v.resolution.get() {
        VarResolution::FromEnv { level, displ } => Ok(env.ancestor(level).get_slot(displ)),
        VarResolution::FromWith => {
            let mut cur = env.clone();
            loop {
                if let Some(with_value) = cur.with_value.clone() {
                    with_value.force(state, pos)?;
                    match &*with_value.finished_ref() {
                        Finished::Attrs(attrs) => {
                            if let Some(attr) = attrs.get(v.name) {
                                return Ok(attr.value.clone());
                            }
                        }
                        other => {
                            return Err(ErrorValue::type_error(
                                pos,
                                format!("value is {} while a set was expected", other.type_name()),
                            ));
                        }
                    }
                }
                match cur.parent.clone() {
                    Some(p) => cur = p,
                    None => return Err(ErrorValue::undefined_variable(pos, state.symbols.get(v.name))),
                }
            }
        }
        VarResolution::Unresolved => Err(ErrorValue::undefined_variable(pos, state.symbols.get(v.name))),
    }
}

// ---------------------------------------------------------------------
// Laziness helper: maybeThunk.
// ---------------------------------------------------------------------

/// `maybeThunk` (spec §4.3): short-circuits constants and already-bound
/// lexical variables to avoid an indirection, falling back to a plain
/// thunk otherwise. Safe to call only when `env` is already fully built
/// (call arguments, list elements, non-`rec` attrset members) — `rec`
/// attrsets and `let` build `env` incrementally in this very pass, so
/// they use a plain [`Value::thunk`] for every member instead to avoid
/// peeking at a slot before it has been filled.
fn maybe_thunk(env: &Rc<Env>, expr: &ExprRef) -> Value {
    match &expr.kind {
        ExprKind::Int(i) => Value::int(*i),
        ExprKind::Float(f) => Value::float(*f),
        ExprKind::Str(s) => Value::string_plain(s.clone()),
        ExprKind::Var(v) => match v.resolution.get() {
            VarResolution::FromEnv { level, displ } => env.ancestor(level).get_slot(displ),
            _ => Value::thunk(env.clone(), expr.clone()),
        },
        _ => Value::thunk(env.clone(), expr.clone()),
    }
}

/// Builds a child [`Env`] with one slot per static attr, each a plain
/// thunk over that slot's own expression (shared by `rec { ... }` and
/// `let ... in`, spec §4.3).
fn build_rec_env(env: &Rc<Env>, statics: &[crate::ast::StaticAttr]) -> Rc<Env> {
    let child = Env::child_with_capacity(env, statics.len());
    for a in statics {
        child.push_slot(Value::thunk(child.clone(), a.value.clone()));
    }
    child
}

// ---------------------------------------------------------------------
// Attribute sets.
// ---------------------------------------------------------------------

fn eval_attrs(
    state: &mut EvalState,
    env: &Rc<Env>,
    rec: bool,
    statics: &[crate::ast::StaticAttr],
    dynamics: &[crate::ast::DynamicAttr],
    pos: PosIdx,
) -> Result<Finished, ErrorValue> {
    if !rec {
        let mut builder = BindingsBuilder::with_capacity(statics.len() + dynamics.len());
        for a in statics {
            builder
                .insert(a.name, a.pos, maybe_thunk(env, &a.value))
                .map_err(|d| duplicate_attr_error(state, d))?;
        }
        insert_dynamic_attrs(state, env, dynamics, &mut builder)?;
        return Ok(Finished::Attrs(builder.finish(pos)));
    }

    let child = build_rec_env(env, statics);
    let name_to_displ: Vec<(Symbol, u32)> = statics.iter().enumerate().map(|(i, a)| (a.name, i as u32)).collect();

    if let Some(&(_, overrides_displ)) = name_to_displ.iter().find(|(n, _)| *n == state.common.overrides) {
        let overrides_cell = child.get_slot(overrides_displ);
        overrides_cell.force(state, pos)?;
        let overrides = match &*overrides_cell.finished_ref() {
            Finished::Attrs(a) => a.clone(),
            other => {
                return Err(ErrorValue::type_error(pos, format!("__overrides is {}, not a set", other.type_name())))
            }
        };
        for over_attr in overrides.iter() {
            if let Some(&(_, displ)) = name_to_displ.iter().find(|(n, _)| *n == over_attr.name) {
                child.set_slot(displ, over_attr.value.clone());
            }
        }
    }

    let mut builder = BindingsBuilder::with_capacity(statics.len() + dynamics.len());
    for (i, a) in statics.iter().enumerate() {
        builder.insert_or_replace(a.name, a.pos, child.get_slot(i as u32));
    }
    if let Some(&(_, overrides_displ)) = name_to_displ.iter().find(|(n, _)| *n == state.common.overrides) {
        let overrides_cell = child.get_slot(overrides_displ);
        if let Finished::Attrs(overrides) = &*overrides_cell.finished_ref() {
            for over_attr in overrides.iter() {
                if !name_to_displ.iter().any(|(n, _)| *n == over_attr.name) {
                    builder.insert_or_replace(over_attr.name, over_attr.pos, over_attr.value.clone());
                }
            }
        }
    }
    insert_dynamic_attrs(state, &child, dynamics, &mut builder)?;
    Ok(Finished::Attrs(builder.finish(pos)))
}

fn insert_dynamic_attrs(
    state: &mut EvalState,
    env: &Rc<Env>,
    dynamics: &[crate::ast::DynamicAttr],
    builder: &mut BindingsBuilder,
) -> Result<(), ErrorValue> {
    for d in dynamics {
        let name_val = eval_expr(state, env, &d.name)?;
        let sym = match name_val {
            Finished::Null => continue,
            Finished::Str(s) => state.symbols.create(&s.bytes),
            other => {
                return Err(ErrorValue::type_error(
                    d.name_pos,
                    format!("value is {} while a string was expected", other.type_name()),
                ))
            }
        };
        builder
            .insert(sym, d.name_pos, maybe_thunk(env, &d.value))
            .map_err(|dup| duplicate_attr_error(state, dup))?;
    }
    Ok(())
}

fn duplicate_attr_error(state: &EvalState, d: crate::bindings::DuplicateAttr) -> ErrorValue {
    ErrorValue::new(
        ErrorKind::EvalError,
        d.second_pos,
        format!("attribute '{}' already defined", state.symbols.get(d.name)),
    )
    .with_frame(d.first_pos, "first defined here")
}

// ---------------------------------------------------------------------
// Select / HasAttr.
// ---------------------------------------------------------------------

fn resolve_attr_path_symbol(state: &mut EvalState, env: &Rc<Env>, part: &AttrPathPart) -> Result<Symbol, ErrorValue> {
    match part {
        AttrPathPart::Static(s) => Ok(*s),
        AttrPathPart::Dynamic(e) => match eval_expr(state, env, e)? {
            Finished::Str(s) => Ok(state.symbols.create(&s.bytes)),
            other => {
                Err(ErrorValue::type_error(e.pos, format!("value is {} while a string was expected", other.type_name())))
            }
        },
    }
}

fn eval_select(
    state: &mut EvalState,
    env: &Rc<Env>,
    base: &ExprRef,
    path: &[AttrPathPart],
    default: Option<&ExprRef>,
    pos: PosIdx,
) -> Result<Finished, ErrorValue> {
    let mut current = eval_expr(state, env, base)?;
    for part in path {
        let sym = resolve_attr_path_symbol(state, env, part)?;
        let attrs = match &current {
            Finished::Attrs(a) => a.clone(),
            other => {
                if let Some(d) = default {
                    return eval_expr(state, env, d);
                }
                return Err(ErrorValue::type_error(
                    pos,
                    format!("value is {} while a set was expected", other.type_name()),
                ));
            }
        };
        match attrs.get(sym) {
            Some(attr) => {
                attr.value.force(state, attr.pos)?;
                current = attr.value.finished_ref().clone_finished();
            }
            None => {
                if let Some(d) = default {
                    return eval_expr(state, env, d);
                }
                return Err(attribute_missing_error(state, &attrs, sym, pos));
            }
        }
    }
    Ok(current)
}

/// Unlike `eval_select`, `?` never turns a not-yet-resolvable
/// self-reference into an error: spec §8 scenario 4 requires
/// `let x = x; in x ? foo` to yield `false`, not `InfiniteRecursion`,
/// since `?` only needs to know whether the base is *currently* an
/// attrset, not fully resolve it. Any other error still propagates.
fn force_for_has_attr(value: &Value, state: &mut EvalState, pos: PosIdx) -> Result<Option<Finished>, ErrorValue> {
    match value.force(state, pos) {
        Ok(()) => Ok(Some(value.finished_ref().clone_finished())),
        Err(e) if matches!(e.kind, ErrorKind::InfiniteRecursion) => Ok(None),
        Err(e) => Err(e),
    }
}

fn eval_has_attr(state: &mut EvalState, env: &Rc<Env>, base: &ExprRef, path: &[AttrPathPart]) -> Result<Finished, ErrorValue> {
    let base_value = match &base.kind {
        ExprKind::Var(v) => lookup_var(state, env, v, base.pos)?,
        _ => Value::thunk(env.clone(), base.clone()),
    };
    let mut current = match force_for_has_attr(&base_value, state, base.pos)? {
        Some(f) => f,
        None => return Ok(Finished::Bool(false)),
    };
    for part in path {
        let sym = resolve_attr_path_symbol(state, env, part)?;
        let attrs = match &current {
            Finished::Attrs(a) => a.clone(),
            _ => return Ok(Finished::Bool(false)),
        };
        match attrs.get(sym) {
            Some(attr) => match force_for_has_attr(&attr.value, state, attr.pos)? {
                Some(f) => current = f,
                None => return Ok(Finished::Bool(false)),
            },
            None => return Ok(Finished::Bool(false)),
        }
    }
    Ok(Finished::Bool(true))
}

fn attribute_missing_error(state: &EvalState, attrs: &Bindings, missing: Symbol, pos: PosIdx) -> ErrorValue {
    let name = state.symbols.get(missing);
    let candidates: Vec<&str> = attrs.iter().map(|a| state.symbols.get(a.name)).collect();
    let suggestions = suggest(name, candidates.into_iter());
    let msg = if suggestions.is_empty() {
        format!("attribute '{name}' missing")
    } else {
        format!("attribute '{name}' missing, did you mean {}?", suggestions.join(", "))
    };
    ErrorValue::new(ErrorKind::EvalError, pos, msg)
}

/// Up to 3 candidates within Levenshtein distance 2 of `target`, closest
/// first (spec §4.2 "Levenshtein-style suggestion list").
fn suggest<'a>(target: &str, candidates: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> =
        candidates.map(|c| (levenshtein(target, c), c)).filter(|(d, _)| *d <= 2 && *d > 0).collect();
    scored.sort_by_key(|(d, name)| (*d, *name));
    scored.into_iter().take(3).map(|(_, c)| c.to_string()).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, &ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let tmp = row[j + 1];
            row[j + 1] = if ca == cb { prev } else { 1 + prev.min(row[j]).min(row[j + 1]) };
            prev = tmp;
        }
    }
    row[b.len()]
}

// ---------------------------------------------------------------------
// Function application.
// ---------------------------------------------------------------------

fn eval_call(state: &mut EvalState, env: &Rc<Env>, fun: &ExprRef, args: &[ExprRef], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let fun_value = Value::finished(eval_expr(state, env, fun)?);
    let mut arg_values: Vec<Value> = args.iter().map(|a| maybe_thunk(env, a)).collect();
    call_function_value(state, &fun_value, &mut arg_values, pos)
}

/// `callFunction` (spec §4.2): applies `fun` (forced at the top of every
/// iteration) to `args` one case at a time, currying through partial
/// primop/lambda application until `args` is exhausted.
pub fn call_function_value(state: &mut EvalState, fun: &Value, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    state.enter_call(pos)?;
    let result = call_function_inner(state, fun, args, pos);
    state.exit_call(pos);
    result
}

fn call_function_inner(state: &mut EvalState, fun: &Value, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let mut fun = fun.clone();
    let mut args: &mut [Value] = args;
    loop {
        fun.force(state, pos)?;
        let finished = fun.finished_ref().clone_finished();
        match finished {
            Finished::Lambda(ldata) => {
                let ExprKind::Lambda { param, body, .. } = &ldata.node.kind else {
                    unreachable!("LambdaData always points at an ExprKind::Lambda node")
                };
                debug_assert!(!args.is_empty(), "callFunction invoked with no arguments");
                match param {
                    Param::Simple(_) => {
                        let new_env = Env::child_with_capacity(&ldata.env, 1);
                        new_env.push_slot(args[0].clone());
                        let body_result = eval_expr(state, &new_env, body)?;
                        if args.len() == 1 {
                            return Ok(body_result);
                        }
                        fun = Value::finished(body_result);
                        args = &mut args[1..];
                    }
                    Param::Destructured(formals) => {
                        let new_env = bind_formals(state, &ldata.env, formals, &args[0], pos)?;
                        let body_result = eval_expr(state, &new_env, body)?;
                        if args.len() == 1 {
                            return Ok(body_result);
                        }
                        fun = Value::finished(body_result);
                        args = &mut args[1..];
                    }
                }
            }
            Finished::PrimOp(desc) => {
                let arity = desc.arity as usize;
                if args.len() < arity {
                    return Ok(Finished::PrimOpApp(Rc::new(PrimOpAppData { descriptor: desc, applied: args.to_vec() })));
                }
                if state.config.trace_function_calls {
                    state.tracer.on_event(&TraceEvent::PrimOpCall { name: desc.name, pos });
                }
                let mut call_args: Vec<Value> = args[..arity].to_vec();
                let result = (desc.func)(state, &mut call_args, pos)?;
                if args.len() == arity {
                    return Ok(result);
                }
                fun = Value::finished(result);
                args = &mut args[arity..];
            }
            Finished::PrimOpApp(app) => {
                let remaining = app.descriptor.arity as usize - app.applied.len();
                if args.len() < remaining {
                    let mut new_applied = app.applied.clone();
                    new_applied.extend_from_slice(args);
                    return Ok(Finished::PrimOpApp(Rc::new(PrimOpAppData { descriptor: app.descriptor.clone(), applied: new_applied })));
                }
                if state.config.trace_function_calls {
                    state.tracer.on_event(&TraceEvent::PrimOpCall { name: app.descriptor.name, pos });
                }
                let mut call_args = app.applied.clone();
                call_args.extend_from_slice(&args[..remaining]);
                let result = (app.descriptor.func)(state, &mut call_args, pos)?;
                if args.len() == remaining {
                    return Ok(result);
                }
                fun = Value::finished(result);
                args = &mut args[remaining..];
            }
            Finished::Attrs(attrs) => {
                let Some(functor_attr) = attrs.get(state.common.functor) else {
                    return Err(ErrorValue::type_error(pos, "attempt to call something which is not a function (a set)"));
                };
                let functor = functor_attr.value.clone();
                let mut new_args: Vec<Value> = Vec::with_capacity(args.len() + 1);
                new_args.push(fun.clone());
                new_args.extend_from_slice(args);
                return call_function_value(state, &functor, &mut new_args, pos);
            }
            other => {
                return Err(ErrorValue::type_error(
                    pos,
                    format!("attempt to call something which is not a function (a {})", other.type_name()),
                ));
            }
        }
    }
}

fn bind_formals(state: &mut EvalState, parent: &Rc<Env>, formals: &Formals, arg: &Value, pos: PosIdx) -> Result<Rc<Env>, ErrorValue> {
    arg.force(state, pos)?;
    let attrs = match &*arg.finished_ref() {
        Finished::Attrs(a) => a.clone(),
        other => {
            return Err(ErrorValue::type_error(pos, format!("value is {} while a set was expected", other.type_name())))
        }
    };
    let total_slots = formals.formals.len() + usize::from(formals.alias.is_some());
    let new_env = Env::child_with_capacity(parent, total_slots);
    for _ in 0..total_slots {
        new_env.push_slot(Value::blackhole());
    }
    if formals.alias.is_some() {
        new_env.set_slot(formals.formals.len() as u32, Value::attrs(attrs.clone()));
    }
    for (i, formal) in formals.formals.iter().enumerate() {
        let value = match attrs.get(formal.name) {
            Some(attr) => attr.value.clone(),
            None => match &formal.default {
                Some(default_expr) => Value::thunk(new_env.clone(), default_expr.clone()),
                None => return Err(ErrorValue::missing_argument(pos, state.symbols.get(formal.name))),
            },
        };
        new_env.set_slot(i as u32, value);
    }
    if !formals.ellipsis {
        if let Some(extra) = attrs.iter().find(|a| !formals.formals.iter().any(|f| f.name == a.name)) {
            let candidates = formals.formals.iter().map(|f| state.symbols.get(f.name));
            let name = state.symbols.get(extra.name).to_string();
            let suggestions = suggest(&name, candidates);
            let msg = if suggestions.is_empty() {
                format!("function called with unexpected argument '{name}'")
            } else {
                format!("function called with unexpected argument '{name}', did you mean {}?", suggestions.join(", "))
            };
            return Err(ErrorValue::type_error(pos, msg));
        }
    }
    Ok(new_env)
}

/// `autoCallFunction` (spec §6): calls `fun` supplying each formal from
/// `available` when present, falling back to its default, without
/// requiring the caller to pre-build an exact argument attrset (used by
/// hosts invoking a user-supplied expression with a fixed pool of
/// auto-arguments, e.g. `--arg`/`--argstr` or a module-system style call).
pub fn auto_call_function(state: &mut EvalState, fun: &Value, available: &Bindings, pos: PosIdx) -> Result<Finished, ErrorValue> {
    fun.force(state, pos)?;
    // Extract just the formal names while the borrow is alive, then drop it
    // before calling back into `call_function_value` (which re-borrows `fun`).
    let formal_names: Option<Vec<Symbol>> = match &*fun.finished_ref() {
        Finished::Lambda(ldata) => match &ldata.node.kind {
            ExprKind::Lambda { param: Param::Destructured(formals), .. } => {
                Some(formals.formals.iter().map(|f| f.name).collect())
            }
            _ => None,
        },
        _ => None,
    };
    let Some(formal_names) = formal_names else {
        let mut args = [Value::attrs(available.clone())];
        return call_function_value(state, fun, &mut args, pos);
    };
    let mut builder = BindingsBuilder::with_capacity(formal_names.len());
    for name in formal_names {
        if let Some(attr) = available.get(name) {
            let _ = builder.insert(name, attr.pos, attr.value.clone());
        }
    }
    let provided = Value::attrs(builder.finish(pos));
    let mut args = [provided];
    call_function_value(state, fun, &mut args, pos)
}

// ---------------------------------------------------------------------
// Operators.
// ---------------------------------------------------------------------

fn eval_binop(state: &mut EvalState, env: &Rc<Env>, op: BinOp, lhs: &ExprRef, rhs: &ExprRef, pos: PosIdx) -> Result<Finished, ErrorValue> {
    match op {
        BinOp::Eq => Ok(Finished::Bool(eq_values(state, &eval(env, lhs), &eval(env, rhs), pos)?)),
        BinOp::NEq => Ok(Finished::Bool(!eq_values(state, &eval(env, lhs), &eval(env, rhs), pos)?)),
        BinOp::Update => {
            let l = force_attrs(state, env, lhs)?;
            let r = force_attrs(state, env, rhs)?;
            Ok(Finished::Attrs(l.update(&r)))
        }
        BinOp::ConcatLists => {
            let l = force_list(state, env, lhs)?;
            let r = force_list(state, env, rhs)?;
            Ok(Finished::List(l.concat(&r)))
        }
        BinOp::Add => eval_add(state, env, lhs, rhs, pos),
        BinOp::Sub | BinOp::Mul | BinOp::Div => eval_arith(state, env, op, lhs, rhs, pos),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => eval_compare(state, env, op, lhs, rhs, pos),
    }
}

fn force_attrs(state: &mut EvalState, env: &Rc<Env>, expr: &ExprRef) -> Result<Bindings, ErrorValue> {
    match eval_expr(state, env, expr)? {
        Finished::Attrs(a) => Ok(a),
        other => Err(ErrorValue::type_error(expr.pos, format!("value is {} while a set was expected", other.type_name()))),
    }
}

fn force_list(state: &mut EvalState, env: &Rc<Env>, expr: &ExprRef) -> Result<NixList, ErrorValue> {
    match eval_expr(state, env, expr)? {
        Finished::List(l) => Ok(l),
        other => Err(ErrorValue::type_error(expr.pos, format!("value is {} while a list was expected", other.type_name()))),
    }
}

/// A number that's either `Int` or `Float`, with the promotion rule
/// "int op float => float" applied uniformly (spec §4.2). `pub(crate)` so
/// the arithmetic primops (`builtins.add` and friends) share this instead
/// of re-deriving the int/float promotion rule.
#[derive(Clone, Copy)]
pub(crate) enum Num {
    Int(i64),
    Float(f64),
}

pub(crate) fn as_number(f: &Finished, pos: PosIdx) -> Result<Num, ErrorValue> {
    match f {
        Finished::Int(i) => Ok(Num::Int(*i)),
        Finished::Float(x) => Ok(Num::Float(*x)),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a number was expected", other.type_name()))),
    }
}

fn eval_add(state: &mut EvalState, env: &Rc<Env>, lhs: &ExprRef, rhs: &ExprRef, pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = eval_expr(state, env, lhs)?;
    let r = eval_expr(state, env, rhs)?;
    add_finished(state, &l, &r, pos)
}

/// The `+` operator's type dispatch (spec §4.2): string if either side is
/// a string, path if the LHS is a path, else numeric with int/float
/// promotion. Shared between the `BinOp::Add` evaluator path and
/// `builtins.add`/`builtins.concatStringsSep`-adjacent primops.
pub(crate) fn add_finished(state: &mut EvalState, l: &Finished, r: &Finished, pos: PosIdx) -> Result<Finished, ErrorValue> {
    if matches!(l, Finished::Str(_)) || matches!(r, Finished::Str(_)) {
        let mut ctx = StringContext::new();
        let mut out = coerce_to_string(state, l, &mut ctx, false, false, false, pos)?;
        out.push_str(&coerce_to_string(state, r, &mut ctx, false, false, false, pos)?);
        return Ok(Finished::Str(NixString::with_context(out, ctx)));
    }
    if let Finished::Path(p) = l {
        let mut ctx = StringContext::new();
        let tail = coerce_to_string(state, r, &mut ctx, false, false, true, pos)?;
        if !ctx.is_empty() {
            return Err(ErrorValue::eval_error(pos, "a string with context cannot be appended to a path"));
        }
        return Ok(Finished::Path(NixPath { accessor: p.accessor, path: Rc::from(format!("{}{}", p.path, tail)) }));
    }
    match (as_number(l, pos)?, as_number(r, pos)?) {
        (Num::Int(a), Num::Int(b)) => {
            a.checked_add(b).map(Finished::Int).ok_or_else(|| ErrorValue::eval_error(pos, "integer overflow in addition"))
        }
        (a, b) => Ok(Finished::Float(num_as_f64(a) + num_as_f64(b))),
    }
}

pub(crate) fn num_as_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn eval_arith(state: &mut EvalState, env: &Rc<Env>, op: BinOp, lhs: &ExprRef, rhs: &ExprRef, pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = eval_expr(state, env, lhs)?;
    let r = eval_expr(state, env, rhs)?;
    arith_finished(op, as_number(&l, lhs.pos)?, as_number(&r, rhs.pos)?, pos)
}

/// `-`/`*`/`/` (spec §4.2): checked integer arithmetic promoting to float
/// on overflow-free mixed operands, division by zero always an error.
/// Shared with `builtins.sub`/`mul`/`div`.
pub(crate) fn arith_finished(op: BinOp, l: Num, r: Num, pos: PosIdx) -> Result<Finished, ErrorValue> {
    match (l, r) {
        (Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        return Err(ErrorValue::eval_error(pos, "division by zero"));
                    }
                    a.checked_div(b)
                }
                _ => unreachable!(),
            };
            result.map(Finished::Int).ok_or_else(|| ErrorValue::eval_error(pos, "integer overflow"))
        }
        (a, b) => {
            let (a, b) = (num_as_f64(a), num_as_f64(b));
            let result = match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(ErrorValue::eval_error(pos, "division by zero"));
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(Finished::Float(result))
        }
    }
}

fn eval_compare(state: &mut EvalState, env: &Rc<Env>, op: BinOp, lhs: &ExprRef, rhs: &ExprRef, pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = eval_expr(state, env, lhs)?;
    let r = eval_expr(state, env, rhs)?;
    let ord = compare_values(state, &l, &r, pos)?;
    Ok(Finished::Bool(match op {
        BinOp::Lt => ord == std::cmp::Ordering::Less,
        BinOp::Le => ord != std::cmp::Ordering::Greater,
        BinOp::Gt => ord == std::cmp::Ordering::Greater,
        BinOp::Ge => ord != std::cmp::Ordering::Less,
        _ => unreachable!(),
    }))
}

pub(crate) fn compare_values(state: &mut EvalState, l: &Finished, r: &Finished, pos: PosIdx) -> Result<std::cmp::Ordering, ErrorValue> {
    match (l, r) {
        (Finished::Str(a), Finished::Str(b)) => Ok(a.bytes.cmp(&b.bytes)),
        (Finished::List(a), Finished::List(b)) => {
            for i in 0..a.len().min(b.len()) {
                let av = a.get(i).unwrap();
                let bv = b.get(i).unwrap();
                av.force(state, pos)?;
                bv.force(state, pos)?;
                let av = av.finished_ref().clone_finished();
                let bv = bv.finished_ref().clone_finished();
                let ord = compare_values(state, &av, &bv, pos)?;
                if ord != std::cmp::Ordering::Equal {
                    return Ok(ord);
                }
            }
            Ok(a.len().cmp(&b.len()))
        }
        _ => {
            let (a, b) = (as_number(l, pos)?, as_number(r, pos)?);
            match (a, b) {
                (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
                (x, y) => num_as_f64(x).partial_cmp(&num_as_f64(y)).ok_or_else(|| ErrorValue::eval_error(pos, "NaN is not ordered")),
            }
        }
    }
}

fn eval_concat_strings(state: &mut EvalState, env: &Rc<Env>, parts: &[ExprRef], pos: PosIdx) -> Result<Finished, ErrorValue> {
    debug_assert!(!parts.is_empty(), "ConcatStrings must have at least one part");
    let first = eval_expr(state, env, &parts[0])?;
    match first {
        Finished::Int(_) | Finished::Float(_) => {
            let mut acc = as_number(&first, pos)?;
            for p in &parts[1..] {
                let v = eval_expr(state, env, p)?;
                let n = as_number(&v, p.pos)?;
                acc = match (acc, n) {
                    (Num::Int(a), Num::Int(b)) => {
                        Num::Int(a.checked_add(b).ok_or_else(|| ErrorValue::eval_error(pos, "integer overflow"))?)
                    }
                    (a, b) => Num::Float(num_as_f64(a) + num_as_f64(b)),
                };
            }
            Ok(match acc {
                Num::Int(i) => Finished::Int(i),
                Num::Float(f) => Finished::Float(f),
            })
        }
        Finished::Path(p) => {
            let mut out = p.path.to_string();
            for part in &parts[1..] {
                let v = eval_expr(state, env, part)?;
                let mut ctx = StringContext::new();
                out.push_str(&coerce_to_string(state, &v, &mut ctx, false, false, true, part.pos)?);
                if !ctx.is_empty() {
                    return Err(ErrorValue::eval_error(part.pos, "a string with context cannot be appended to a path"));
                }
            }
            Ok(Finished::Path(NixPath { accessor: p.accessor, path: Rc::from(out) }))
        }
        _ => {
            let mut ctx = StringContext::new();
            let mut out = coerce_to_string(state, &first, &mut ctx, false, false, false, pos)?;
            for part in &parts[1..] {
                let v = eval_expr(state, env, part)?;
                out.push_str(&coerce_to_string(state, &v, &mut ctx, false, false, false, part.pos)?);
            }
            Ok(Finished::Str(NixString::with_context(out, ctx)))
        }
    }
}

// ---------------------------------------------------------------------
// Coercion.
// ---------------------------------------------------------------------

/// `coerceToString` (spec §4.2). `context` accumulates entries from
/// paths copied to the store and derivation outputs touched along the
/// way; the caller decides whether a non-empty result is acceptable.
pub fn coerce_to_string(
    state: &mut EvalState,
    v: &Finished,
    context: &mut StringContext,
    coerce_more: bool,
    copy_to_store: bool,
    canonicalize_path: bool,
    pos: PosIdx,
) -> Result<String, ErrorValue> {
    let _ = canonicalize_path; // path canonicalisation is the Store's responsibility (spec §6); the core passes the flag through
    match v {
        Finished::Str(s) => {
            context.union(&s.context);
            Ok(s.bytes.to_string())
        }
        Finished::Path(p) => {
            if copy_to_store {
                let store_path = state
                    .store
                    .add_to_store_from_dump(p.accessor, &p.path, "source", crate::store::HashAlgorithm::Sha256, &[])
                    .map_err(|e| ErrorValue::eval_error(pos, e.to_string()))?;
                let printed = state.store.print_store_path(&store_path);
                context.insert(crate::context::ContextEntry::Opaque(store_path));
                Ok(printed)
            } else {
                Ok(p.path.to_string())
            }
        }
        Finished::Attrs(attrs) => {
            if let Some(out_path) = attrs.get(state.common.out_path) {
                out_path.value.force(state, pos)?;
                let inner = out_path.value.finished_ref().clone_finished();
                return coerce_to_string(state, &inner, context, coerce_more, copy_to_store, canonicalize_path, pos);
            }
            if let Some(to_string) = attrs.get(state.common.to_string) {
                let mut args = [Value::attrs(attrs.clone())];
                let result = call_function_value(state, &to_string.value, &mut args, pos)?;
                return coerce_to_string(state, &result, context, coerce_more, copy_to_store, canonicalize_path, pos);
            }
            Err(ErrorValue::type_error(pos, "cannot coerce a set to a string (missing outPath or __toString)"))
        }
        Finished::Bool(b) if coerce_more => Ok(if *b { "1".to_string() } else { String::new() }),
        Finished::Null if coerce_more => Ok(String::new()),
        Finished::Int(i) if coerce_more => Ok(i.to_string()),
        Finished::Float(f) if coerce_more => Ok(f.to_string()),
        Finished::List(list) if coerce_more => {
            let mut parts = Vec::with_capacity(list.len());
            for item in list.iter() {
                item.force(state, pos)?;
                let inner = item.finished_ref().clone_finished();
                parts.push(coerce_to_string(state, &inner, context, coerce_more, copy_to_store, canonicalize_path, pos)?);
            }
            Ok(parts.join(" "))
        }
        other => Err(ErrorValue::type_error(pos, format!("cannot coerce a {} to a string", other.type_name()))),
    }
}

/// `isDerivation` (spec §6): `true` iff the value is an attrset whose
/// `type` attribute forces to the string `"derivation"`.
pub fn is_derivation(state: &mut EvalState, v: &Finished, pos: PosIdx) -> Result<bool, ErrorValue> {
    let Finished::Attrs(attrs) = v else { return Ok(false) };
    let Some(type_attr) = attrs.get(state.common.type_) else { return Ok(false) };
    type_attr.value.force(state, pos)?;
    Ok(matches!(&*type_attr.value.finished_ref(), Finished::Str(s) if &*s.bytes == state.symbols.get(state.common.derivation)))
}

// ---------------------------------------------------------------------
// Equality.
// ---------------------------------------------------------------------

/// `eqValues` (spec §4.4). Forces both sides to WHNF (and transitively,
/// whatever each rule needs) but never beyond that.
pub fn eq_values(state: &mut EvalState, a: &Value, b: &Value, pos: PosIdx) -> Result<bool, ErrorValue> {
    a.force(state, pos)?;
    b.force(state, pos)?;
    let (fa, fb) = (a.finished_ref().clone_finished(), b.finished_ref().clone_finished());
    // Rule 8 overrides rule 1: functions are never equal, even to themselves.
    if fa.is_callable() || fb.is_callable() {
        return Ok(false);
    }
    if a.ptr_eq(b) {
        return Ok(true);
    }
    eq_finished(state, &fa, &fb, pos)
}

fn eq_finished(state: &mut EvalState, a: &Finished, b: &Finished, pos: PosIdx) -> Result<bool, ErrorValue> {
    match (a, b) {
        (Finished::Int(x), Finished::Int(y)) => Ok(x == y),
        (Finished::Float(x), Finished::Float(y)) => Ok(x == y),
        (Finished::Int(x), Finished::Float(y)) | (Finished::Float(y), Finished::Int(x)) => Ok(*x as f64 == *y),
        (Finished::Bool(x), Finished::Bool(y)) => Ok(x == y),
        (Finished::Null, Finished::Null) => Ok(true),
        (Finished::Str(x), Finished::Str(y)) => Ok(x.bytes == y.bytes),
        (Finished::Path(x), Finished::Path(y)) => Ok(x.accessor == y.accessor && x.path == y.path),
        (Finished::List(x), Finished::List(y)) => {
            if x.len() != y.len() {
                return Ok(false);
            }
            for i in 0..x.len() {
                if !eq_values(state, x.get(i).unwrap(), y.get(i).unwrap(), pos)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Finished::Attrs(x), Finished::Attrs(y)) => {
            let both_derivations = is_derivation(state, a, pos)? && is_derivation(state, b, pos)?;
            if both_derivations {
                let ox = x.get(state.common.out_path);
                let oy = y.get(state.common.out_path);
                return match (ox, oy) {
                    (Some(ox), Some(oy)) => eq_values(state, &ox.value.clone(), &oy.value.clone(), pos),
                    _ => Ok(false),
                };
            }
            if x.len() != y.len() {
                return Ok(false);
            }
            for xa in x.iter() {
                let Some(ya) = y.get(xa.name) else { return Ok(false) };
                if xa.name != ya.name {
                    return Ok(false);
                }
                if !eq_values(state, &xa.value.clone(), &ya.value.clone(), pos)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Finished::External(x), Finished::External(y)) => Ok(x.values_equal(y.as_ref())),
        _ => Ok(false),
    }
}

/// `assertEqValues` (spec §4.4): same equal/unequal answer as
/// [`eq_values`], but on inequality returns `Err` holding a structured
/// diff of the first difference found rather than just `false`.
pub fn assert_eq_values(state: &mut EvalState, a: &Value, b: &Value, pos: PosIdx) -> Result<Result<(), crate::error::EqDiff>, ErrorValue> {
    a.force(state, pos)?;
    b.force(state, pos)?;
    let (fa, fb) = (a.finished_ref().clone_finished(), b.finished_ref().clone_finished());
    if fa.is_callable() || fb.is_callable() {
        return Ok(Err(crate::error::EqDiff::TypeMismatch { lhs_type: "lambda", rhs_type: "lambda" }));
    }
    if a.ptr_eq(b) {
        return Ok(Ok(()));
    }
    diff_finished(state, &fa, &fb, pos)
}

fn diff_finished(state: &mut EvalState, a: &Finished, b: &Finished, pos: PosIdx) -> Result<Result<(), crate::error::EqDiff>, ErrorValue> {
    use crate::error::EqDiff;
    if a.type_name() != b.type_name() && !matches!((a, b), (Finished::Int(_), Finished::Float(_)) | (Finished::Float(_), Finished::Int(_))) {
        return Ok(Err(EqDiff::TypeMismatch { lhs_type: a.type_name(), rhs_type: b.type_name() }));
    }
    match (a, b) {
        (Finished::List(x), Finished::List(y)) => {
            if x.len() != y.len() {
                return Ok(Err(EqDiff::ListLengthMismatch { lhs_len: x.len(), rhs_len: y.len() }));
            }
            for i in 0..x.len() {
                if let Err(inner) = assert_eq_values(state, x.get(i).unwrap(), y.get(i).unwrap(), pos)? {
                    return Ok(Err(EqDiff::ListElement { index: i, inner: Box::new(inner) }));
                }
            }
            Ok(Ok(()))
        }
        (Finished::Attrs(x), Finished::Attrs(y)) => {
            let only_lhs: Vec<Symbol> = x.iter().filter(|xa| y.get(xa.name).is_none()).map(|a| a.name).collect();
            let only_rhs: Vec<Symbol> = y.iter().filter(|ya| x.get(ya.name).is_none()).map(|a| a.name).collect();
            if !only_lhs.is_empty() || !only_rhs.is_empty() {
                return Ok(Err(EqDiff::AttrsKeysDiffer { only_in_lhs: only_lhs, only_in_rhs: only_rhs }));
            }
            for xa in x.iter() {
                let ya = y.get(xa.name).expect("key-set already shown equal above");
                if let Err(inner) = assert_eq_values(state, &xa.value.clone(), &ya.value.clone(), pos)? {
                    return Ok(Err(EqDiff::AttrValue { name: xa.name, inner: Box::new(inner) }));
                }
            }
            Ok(Ok(()))
        }
        _ => {
            if eq_finished(state, a, b, pos)? {
                Ok(Ok(()))
            } else {
                Ok(Err(EqDiff::Scalar { lhs: debug_show(a), rhs: debug_show(b) }))
            }
        }
    }
}

fn debug_show(f: &Finished) -> String {
    match f {
        Finished::Int(i) => i.to_string(),
        Finished::Float(x) => x.to_string(),
        Finished::Bool(b) => b.to_string(),
        Finished::Null => "null".to_string(),
        Finished::Str(s) => format!("{:?}", s.bytes),
        Finished::Path(p) => p.path.to_string(),
        other => format!("<{}>", other.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, ExprKind, Formal, StaticAttr, VarRef};
    use crate::env::{bind_vars, StaticEnv};

    fn mk_let(state: &mut EvalState, body_expr: fn(Symbol) -> ExprRef) -> Result<Finished, ErrorValue> {
        let x = state.symbols.create("x");
        let value = Expr::new(PosIdx::NONE, ExprKind::Int(1));
        let one_plus = Expr::new(
            PosIdx::NONE,
            ExprKind::BinOp { op: BinOp::Add, lhs: body_expr(x), rhs: Expr::new(PosIdx::NONE, ExprKind::Int(1)) },
        );
        let let_expr = Expr::new(
            PosIdx::NONE,
            ExprKind::Let {
                statics: vec![StaticAttr { name: x, pos: PosIdx::NONE, value, is_overrides: false }],
                dynamics: Vec::new(),
                body: one_plus,
            },
        );
        bind_vars(&let_expr, &StaticEnv::root()).unwrap();
        eval_expr(state, &Env::root(), &let_expr)
    }

    fn var_ref(name: Symbol) -> ExprRef {
        Expr::new(PosIdx::NONE, ExprKind::Var(VarRef::new(name)))
    }

    #[test]
    fn let_binding_evaluates_to_two() {
        let mut state = EvalState::for_tests();
        let result = mk_let(&mut state, var_ref).unwrap();
        assert!(matches!(result, Finished::Int(2)));
    }

    #[test]
    fn destructured_lambda_with_default_applies() {
        let mut state = EvalState::for_tests();
        let x = state.symbols.create("x");
        let y = state.symbols.create("y");
        let default = Expr::new(
            PosIdx::NONE,
            ExprKind::BinOp { op: BinOp::Add, lhs: var_ref(x), rhs: Expr::new(PosIdx::NONE, ExprKind::Int(1)) },
        );
        let formals =
            Formals { formals: vec![Formal { name: x, pos: PosIdx::NONE, default: None }, Formal { name: y, pos: PosIdx::NONE, default: Some(default) }], ellipsis: false, alias: None };
        let lambda = Expr::new(PosIdx::NONE, ExprKind::Lambda { param: Param::Destructured(formals), body: var_ref(y), name: None });
        bind_vars(&lambda, &StaticEnv::root()).unwrap();

        let mut builder = BindingsBuilder::with_capacity(1);
        builder.insert(x, PosIdx::NONE, Value::int(10)).unwrap();
        let args_attrs = builder.finish(PosIdx::NONE);
        let fun = Value::finished(eval_expr(&mut state, &Env::root(), &lambda).unwrap());
        let mut args = [Value::attrs(args_attrs)];
        let result = call_function_value(&mut state, &fun, &mut args, PosIdx::NONE).unwrap();
        assert!(matches!(result, Finished::Int(11)));
    }

    #[test]
    fn rec_attrs_overrides_rewrites_env_slot() {
        let mut state = EvalState::for_tests();
        let a = state.symbols.create("a");
        let b = state.symbols.create("b");
        let overrides_sym = state.common.overrides;

        let b_value = Expr::new(PosIdx::NONE, ExprKind::BinOp { op: BinOp::Add, lhs: var_ref(a), rhs: Expr::new(PosIdx::NONE, ExprKind::Int(1)) });
        let overrides_value = Expr::new(
            PosIdx::NONE,
            ExprKind::Attrs {
                rec: false,
                statics: vec![StaticAttr { name: a, pos: PosIdx::NONE, value: Expr::new(PosIdx::NONE, ExprKind::Int(10)), is_overrides: false }],
                dynamics: Vec::new(),
            },
        );
        let rec_attrs = Expr::new(
            PosIdx::NONE,
            ExprKind::Attrs {
                rec: true,
                statics: vec![
                    StaticAttr { name: a, pos: PosIdx::NONE, value: Expr::new(PosIdx::NONE, ExprKind::Int(1)), is_overrides: false },
                    StaticAttr { name: b, pos: PosIdx::NONE, value: b_value, is_overrides: false },
                    StaticAttr { name: overrides_sym, pos: PosIdx::NONE, value: overrides_value, is_overrides: true },
                ],
                dynamics: Vec::new(),
            },
        );
        bind_vars(&rec_attrs, &StaticEnv::root()).unwrap();
        let result = eval_expr(&mut state, &Env::root(), &rec_attrs).unwrap();
        let Finished::Attrs(attrs) = result else { panic!("expected attrs") };
        let b_attr = attrs.get(b).unwrap();
        b_attr.value.force(&mut state, PosIdx::NONE).unwrap();
        assert_eq!(b_attr.value.debug_as_int(), Some(11));
    }

    #[test]
    fn self_referential_thunk_is_infinite_recursion_on_equality() {
        let mut state = EvalState::for_tests();
        let x = state.symbols.create("x");
        let self_ref = Expr::new(
            PosIdx::NONE,
            ExprKind::Let {
                statics: vec![StaticAttr { name: x, pos: PosIdx::NONE, value: var_ref(x), is_overrides: false }],
                dynamics: Vec::new(),
                body: Expr::new(
                    PosIdx::NONE,
                    ExprKind::BinOp { op: BinOp::Eq, lhs: var_ref(x), rhs: var_ref(x) },
                ),
            },
        );
        bind_vars(&self_ref, &StaticEnv::root()).unwrap();
        let err = eval_expr(&mut state, &Env::root(), &self_ref).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InfiniteRecursion);
    }

    #[test]
    fn with_shadowing_uses_innermost_scope() {
        let mut state = EvalState::for_tests();
        let a = state.symbols.create("a");
        let make_with = |value: i64, body: ExprRef| {
            let env_expr = Expr::new(
                PosIdx::NONE,
                ExprKind::Attrs {
                    rec: false,
                    statics: vec![StaticAttr { name: a, pos: PosIdx::NONE, value: Expr::new(PosIdx::NONE, ExprKind::Int(value)), is_overrides: false }],
                    dynamics: Vec::new(),
                },
            );
            Expr::new(PosIdx::NONE, ExprKind::With { env_expr, body })
        };
        let inner = make_with(2, var_ref(a));
        let outer = make_with(1, inner);
        bind_vars(&outer, &StaticEnv::root()).unwrap();
        let result = eval_expr(&mut state, &Env::root(), &outer).unwrap();
        assert!(matches!(result, Finished::Int(2)));
    }
}
