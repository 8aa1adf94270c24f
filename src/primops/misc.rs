//! Control-flow, introspection, and versioning primops (spec §4.8, and
//! the `tryEval`/`seq`/`deepSeq`/`genericClosure`/`functionArgs`/
//! `splitVersion`/`compareVersions` supplement drawn from
//! `original_source/` — see SPEC_FULL.md §3).

use std::cmp::Ordering;

use crate::bindings::BindingsBuilder;
use crate::error::{ErrorKind, ErrorValue};
use crate::eval::{coerce_to_string, eq_values, EvalState};
use crate::list::NixList;
use crate::pos::PosIdx;
use crate::tracer::TraceEvent;
use crate::value::{Finished, NixString, Value};

pub fn abort(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let v = args[0].finished_ref().clone_finished();
    let mut ctx = crate::context::StringContext::new();
    let msg = coerce_to_string(state, &v, &mut ctx, true, false, false, pos)?;
    Err(ErrorValue::new(ErrorKind::Abort, pos, format!("evaluation aborted with the following error message: '{msg}'")))
}

pub fn throw(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let v = args[0].finished_ref().clone_finished();
    let mut ctx = crate::context::StringContext::new();
    let msg = coerce_to_string(state, &v, &mut ctx, true, false, false, pos)?;
    Err(ErrorValue::new(ErrorKind::ThrownError, pos, msg))
}

/// `tryEval e` (spec §3 supplement): catches any error raised while
/// forcing `e` (except `Abort`, which a host is expected to treat as
/// fatal regardless of `tryEval`) and reports it as
/// `{ success = false; value = false; }` instead of propagating.
pub fn try_eval(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let success_sym = state.symbols.create("success");
    let value_sym = state.symbols.create("value");
    let mut builder = BindingsBuilder::with_capacity(2);
    let was_ignore_try = state.config.ignore_try;
    state.config.ignore_try = true;
    let result = args[0].force(state, pos);
    state.config.ignore_try = was_ignore_try;
    match result {
        Ok(()) => {
            let _ = builder.insert(success_sym, pos, Value::bool(true));
            let _ = builder.insert(value_sym, pos, args[0].clone());
        }
        Err(e) if e.kind == ErrorKind::Abort => return Err(e),
        Err(_) => {
            let _ = builder.insert(success_sym, pos, Value::bool(false));
            let _ = builder.insert(value_sym, pos, Value::bool(false));
        }
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}

pub fn seq(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    args[1].force(state, pos)?;
    Ok(args[1].finished_ref().clone_finished())
}

pub fn deep_seq(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force_deep(state, pos)?;
    args[1].force(state, pos)?;
    Ok(args[1].finished_ref().clone_finished())
}

pub fn trace(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let v = args[0].finished_ref().clone_finished();
    let mut ctx = crate::context::StringContext::new();
    let msg = coerce_to_string(state, &v, &mut ctx, true, false, false, pos)?;
    state.tracer.on_event(&TraceEvent::UserTrace { message: msg });
    args[1].force(state, pos)?;
    Ok(args[1].finished_ref().clone_finished())
}

/// `addErrorContext msg e` (SPEC_FULL.md §3): forces `e`, and if that
/// fails, attaches `msg` as a lazily-formatted trace frame on the error
/// rather than swallowing or replacing it — `eval-error.hh`'s
/// `AddTrace`/`HintFmt` pattern. On success just returns `e`'s value.
pub fn add_error_context(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    match args[1].force(state, pos) {
        Ok(()) => Ok(args[1].finished_ref().clone_finished()),
        Err(e) => {
            args[0].force(state, pos)?;
            let v = args[0].finished_ref().clone_finished();
            let mut ctx = crate::context::StringContext::new();
            let msg = coerce_to_string(state, &v, &mut ctx, true, false, false, pos)?;
            Err(e.with_frame(pos, msg))
        }
    }
}

pub fn type_of(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    Ok(Finished::Str(NixString::plain(args[0].finished_ref().type_name())))
}

macro_rules! type_predicate {
    ($fn_name:ident, $pat:pat) => {
        pub fn $fn_name(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
            args[0].force(state, pos)?;
            Ok(Finished::Bool(matches!(&*args[0].finished_ref(), $pat)))
        }
    };
}

type_predicate!(is_null, Finished::Null);
type_predicate!(is_bool, Finished::Bool(_));
type_predicate!(is_int, Finished::Int(_));
type_predicate!(is_float, Finished::Float(_));
type_predicate!(is_string, Finished::Str(_));
type_predicate!(is_path, Finished::Path(_));
type_predicate!(is_list, Finished::List(_));
type_predicate!(is_attrs, Finished::Attrs(_));

pub fn is_function(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    Ok(Finished::Bool(args[0].finished_ref().is_callable()))
}

/// `functionArgs` (spec §3 supplement): for a destructuring lambda,
/// `{ name = hasDefault; ... }`; for any other callable, `{}` (real Nix
/// raises for a non-lambda primop too, but treating it as "no formals
/// known" is simpler and just as usable for the common `genAttrs`-style
/// caller).
pub fn function_args(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let formals = match &*args[0].finished_ref() {
        Finished::Lambda(ldata) => match &ldata.node.kind {
            crate::ast::ExprKind::Lambda { param: crate::ast::Param::Destructured(formals), .. } => {
                Some(formals.formals.iter().map(|f| (f.name, f.default.is_some())).collect::<Vec<_>>())
            }
            _ => None,
        },
        _ => None,
    };
    let mut builder = BindingsBuilder::with_capacity(formals.as_ref().map_or(0, Vec::len));
    if let Some(formals) = formals {
        for (name, has_default) in formals {
            let _ = builder.insert(name, pos, Value::bool(has_default));
        }
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}

/// `splitVersion` (spec §3 supplement): splits on `.`/`-` boundaries and
/// digit/non-digit transitions, mirroring the component rule
/// `compareVersions` itself relies on.
pub fn split_version(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let Finished::Str(s) = &*args[0].finished_ref() else {
        return Err(ErrorValue::type_error(pos, "value is not a string while a version was expected"));
    };
    let parts: Vec<Value> = version_components(&s.bytes).into_iter().map(Value::string_plain).collect();
    Ok(Finished::List(NixList::from_vec(parts)))
}

fn version_components(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut cur_is_digit: Option<bool> = None;
    for c in s.chars() {
        if c == '.' || c == '-' {
            if !cur.is_empty() {
                parts.push(std::mem::take(&mut cur));
            }
            cur_is_digit = None;
            continue;
        }
        let is_digit = c.is_ascii_digit();
        if cur_is_digit.is_some() && cur_is_digit != Some(is_digit) {
            parts.push(std::mem::take(&mut cur));
        }
        cur.push(c);
        cur_is_digit = Some(is_digit);
    }
    if !cur.is_empty() {
        parts.push(cur);
    }
    parts
}

fn compare_component(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub fn compare_versions(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    args[1].force(state, pos)?;
    let (Finished::Str(a), Finished::Str(b)) = (&*args[0].finished_ref(), &*args[1].finished_ref()) else {
        return Err(ErrorValue::type_error(pos, "value is not a string while a version was expected"));
    };
    let (ca, cb) = (version_components(&a.bytes), version_components(&b.bytes));
    let n = ca.len().max(cb.len());
    for i in 0..n {
        let pa = ca.get(i).map(String::as_str).unwrap_or("0");
        let pb = cb.get(i).map(String::as_str).unwrap_or("0");
        match compare_component(pa, pb) {
            Ordering::Equal => continue,
            other => return Ok(Finished::Int(if other == Ordering::Less { -1 } else { 1 })),
        }
    }
    Ok(Finished::Int(0))
}

/// `genericClosure` (spec §3 supplement): breadth-first worklist closure
/// over `{ startSet, operator }`, keyed by each item's `key` attribute,
/// stopping once no unseen key remains.
pub fn generic_closure(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let Finished::Attrs(spec) = &*args[0].finished_ref() else {
        return Err(ErrorValue::type_error(pos, "value is not a set while an attribute set was expected"));
    };
    let spec = spec.clone();
    let start_set_sym = state.symbols.create("startSet");
    let operator_sym = state.symbols.create("operator");
    let key_sym = state.symbols.create("key");
    let start_set = spec
        .get(start_set_sym)
        .ok_or_else(|| ErrorValue::eval_error(pos, "attribute 'startSet' required"))?
        .value
        .clone();
    let operator = spec.get(operator_sym).ok_or_else(|| ErrorValue::eval_error(pos, "attribute 'operator' required"))?.value.clone();

    start_set.force(state, pos)?;
    let Finished::List(initial) = &*start_set.finished_ref() else {
        return Err(ErrorValue::type_error(pos, "'startSet' must be a list"));
    };
    let mut worklist: Vec<Value> = initial.iter().cloned().collect();
    let mut seen_keys: Vec<NixString> = Vec::new();
    let mut result: Vec<Value> = Vec::new();

    while let Some(item) = worklist.pop() {
        item.force(state, pos)?;
        let Finished::Attrs(item_attrs) = &*item.finished_ref() else {
            return Err(ErrorValue::type_error(pos, "genericClosure: item is not a set"));
        };
        let key_attr = item_attrs.get(key_sym).ok_or_else(|| ErrorValue::eval_error(pos, "attribute 'key' required"))?;
        key_attr.value.force(state, pos)?;
        let Finished::Str(key) = &*key_attr.value.finished_ref() else {
            return Err(ErrorValue::type_error(pos, "'key' attribute must be a string"));
        };
        let key = key.clone();
        if seen_keys.iter().any(|k| k.bytes == key.bytes) {
            continue;
        }
        seen_keys.push(key);
        result.push(item.clone());
        let mut call_args = [item.clone()];
        let next = crate::eval::call_function_value(state, &operator, &mut call_args, pos)?;
        let Finished::List(next) = next else {
            return Err(ErrorValue::type_error(pos, "'operator' must return a list"));
        };
        worklist.extend(next.iter().cloned());
    }
    Ok(Finished::List(NixList::from_vec(result)))
}

pub fn base_name_of(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let v = args[0].finished_ref().clone_finished();
    let mut ctx = crate::context::StringContext::new();
    let s = coerce_to_string(state, &v, &mut ctx, false, false, false, pos)?;
    let base = s.rsplit('/').next().unwrap_or(&s);
    Ok(Finished::Str(NixString::with_context(base, ctx)))
}

pub fn dir_of(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let is_path = matches!(&*args[0].finished_ref(), Finished::Path(_));
    let v = args[0].finished_ref().clone_finished();
    let mut ctx = crate::context::StringContext::new();
    let s = coerce_to_string(state, &v, &mut ctx, false, false, false, pos)?;
    let dir = match s.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => s[..i].to_string(),
        None => ".".to_string(),
    };
    if is_path {
        let Finished::Path(p) = &*args[0].finished_ref() else { unreachable!() };
        Ok(Finished::Path(crate::value::NixPath { accessor: p.accessor, path: dir.into() }))
    } else {
        Ok(Finished::Str(NixString::with_context(dir, ctx)))
    }
}

pub fn eq_builtin(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    Ok(Finished::Bool(eq_values(state, &args[0], &args[1], pos)?))
}

/// `import` (spec §4.6's `evalFile`, exposed as a primop): only reachable
/// once the host has populated `state.parser`/`state.globals_env` — a
/// session that only evaluates in-memory expressions raises instead of
/// silently doing nothing.
pub fn import(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    args[0].force(state, pos)?;
    let path_str = match &*args[0].finished_ref() {
        Finished::Path(p) => p.path.to_string(),
        Finished::Str(s) => s.bytes.to_string(),
        other => return Err(ErrorValue::type_error(pos, format!("value is {} while a path was expected", other.type_name()))),
    };
    let parser = state.parser.clone().ok_or_else(|| ErrorValue::eval_error(pos, "import: no parser configured for this session"))?;
    let env = state.globals_env.clone().ok_or_else(|| ErrorValue::eval_error(pos, "import: no global environment configured for this session"))?;
    let value = state.file_evaluator.eval_file(parser.as_ref(), &env, std::path::Path::new(&path_str), pos)?;
    value.force(state, pos)?;
    Ok(value.finished_ref().clone_finished())
}
