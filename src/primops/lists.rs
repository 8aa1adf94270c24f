//! List primops (spec §4.8).

use crate::bindings::BindingsBuilder;
use crate::error::ErrorValue;
use crate::eval::{call_function_value, compare_values, eq_values, EvalState};
use crate::list::NixList;
use crate::pos::PosIdx;
use crate::value::{Finished, Value};

fn force_list(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<NixList, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::List(l) => Ok(l.clone()),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a list was expected", other.type_name()))),
    }
}

fn force_bool(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<bool, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::Bool(b) => Ok(*b),
        other => {
            Err(ErrorValue::type_error(pos, format!("value is {} while a Boolean was expected", other.type_name())))
        }
    }
}

fn call1(state: &mut EvalState, f: &Value, arg: Value, pos: PosIdx) -> Result<Value, ErrorValue> {
    let mut args = [arg];
    let result = call_function_value(state, f, &mut args, pos)?;
    Ok(Value::finished(result))
}

pub fn head(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_list(state, &args[0], pos)?;
    let first = l.get(0).ok_or_else(|| ErrorValue::eval_error(pos, "'head' called on an empty list"))?.clone();
    first.force(state, pos)?;
    Ok(first.finished_ref().clone_finished())
}

pub fn tail(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_list(state, &args[0], pos)?;
    if l.is_empty() {
        return Err(ErrorValue::eval_error(pos, "'tail' called on an empty list"));
    }
    Ok(Finished::List(NixList::from_vec(l.iter().skip(1).cloned().collect())))
}

pub fn elem_at(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_list(state, &args[0], pos)?;
    args[1].force(state, pos)?;
    let Finished::Int(i) = &*args[1].finished_ref() else {
        return Err(ErrorValue::type_error(pos, "value is not an integer while an index was expected"));
    };
    let i = *i;
    if i < 0 || i as usize >= l.len() {
        return Err(ErrorValue::eval_error(pos, format!("list index {i} out of bounds")));
    }
    let v = l.get(i as usize).unwrap().clone();
    v.force(state, pos)?;
    Ok(v.finished_ref().clone_finished())
}

pub fn length(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let l = force_list(state, &args[0], pos)?;
    Ok(Finished::Int(l.len() as i64))
}

pub fn map(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    let mapped: Vec<Value> = l
        .iter()
        .map(|item| Value::app(f.clone(), item.clone()))
        .collect();
    Ok(Finished::List(NixList::from_vec(mapped)))
}

pub fn filter(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    let mut kept = Vec::new();
    for item in l.iter() {
        let result = call1(state, &f, item.clone(), pos)?;
        if force_bool(state, &result, pos)? {
            kept.push(item.clone());
        }
    }
    Ok(Finished::List(NixList::from_vec(kept)))
}

pub fn elem(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let needle = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    for item in l.iter() {
        if eq_values(state, &needle, item, pos)? {
            return Ok(Finished::Bool(true));
        }
    }
    Ok(Finished::Bool(false))
}

pub fn concat_lists(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let outer = force_list(state, &args[0], pos)?;
    let mut acc = NixList::empty();
    for inner in outer.iter() {
        inner.force(state, pos)?;
        let Finished::List(l) = &*inner.finished_ref() else {
            return Err(ErrorValue::type_error(pos, "concatLists: element is not a list"));
        };
        acc = acc.concat(l);
    }
    Ok(Finished::List(acc))
}

pub fn foldl_strict(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let mut acc = args[1].clone();
    let l = force_list(state, &args[2], pos)?;
    for item in l.iter() {
        let mut call_args = [acc.clone(), item.clone()];
        let result = call_function_value(state, &f, &mut call_args, pos)?;
        acc = Value::finished(result);
        acc.force(state, pos)?;
    }
    Ok(acc.finished_ref().clone_finished())
}

pub fn sort(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let less = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    let mut items: Vec<Value> = l.iter().cloned().collect();
    // A plain comparison-sort driven by the user predicate; ties broken by
    // leaving relative order untouched, matching a stable sort.
    let mut err = None;
    items.sort_by(|a, b| {
        if err.is_some() {
            return std::cmp::Ordering::Equal;
        }
        match call1(state, &less, a.clone(), pos).and_then(|r| force_bool(state, &r, pos)) {
            Ok(true) => std::cmp::Ordering::Less,
            Ok(false) => match call1(state, &less, b.clone(), pos).and_then(|r| force_bool(state, &r, pos)) {
                Ok(true) => std::cmp::Ordering::Greater,
                Ok(false) => std::cmp::Ordering::Equal,
                Err(e) => {
                    err = Some(e);
                    std::cmp::Ordering::Equal
                }
            },
            Err(e) => {
                err = Some(e);
                std::cmp::Ordering::Equal
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(Finished::List(NixList::from_vec(items)))
}

pub fn gen_list(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    args[1].force(state, pos)?;
    let Finished::Int(n) = &*args[1].finished_ref() else {
        return Err(ErrorValue::type_error(pos, "value is not an integer while a length was expected"));
    };
    let n = *n;
    if n < 0 {
        return Err(ErrorValue::eval_error(pos, "'genList' called with a negative length"));
    }
    let items: Vec<Value> = (0..n).map(|i| Value::app(f.clone(), Value::int(i))).collect();
    Ok(Finished::List(NixList::from_vec(items)))
}

pub fn all(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    for item in l.iter() {
        let result = call1(state, &f, item.clone(), pos)?;
        if !force_bool(state, &result, pos)? {
            return Ok(Finished::Bool(false));
        }
    }
    Ok(Finished::Bool(true))
}

pub fn any(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    for item in l.iter() {
        let result = call1(state, &f, item.clone(), pos)?;
        if force_bool(state, &result, pos)? {
            return Ok(Finished::Bool(true));
        }
    }
    Ok(Finished::Bool(false))
}

pub fn partition(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let l = force_list(state, &args[1], pos)?;
    let (mut right, mut wrong) = (Vec::new(), Vec::new());
    for item in l.iter() {
        let result = call1(state, &f, item.clone(), pos)?;
        if force_bool(state, &result, pos)? {
            right.push(item.clone());
        } else {
            wrong.push(item.clone());
        }
    }
    let mut builder = BindingsBuilder::with_capacity(2);
    let right_sym = state.symbols.create("right");
    let wrong_sym = state.symbols.create("wrong");
    let _ = builder.insert(right_sym, pos, Value::list(NixList::from_vec(right)));
    let _ = builder.insert(wrong_sym, pos, Value::list(NixList::from_vec(wrong)));
    Ok(Finished::Attrs(builder.finish(pos)))
}
