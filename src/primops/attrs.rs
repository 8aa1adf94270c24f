//! Attribute-set primops (spec §4.8).

use crate::bindings::{Bindings, BindingsBuilder};
use crate::error::ErrorValue;
use crate::eval::{call_function_value, EvalState};
use crate::list::NixList;
use crate::pos::PosIdx;
use crate::value::{Finished, Value};

fn force_attrs(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<Bindings, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::Attrs(a) => Ok(a.clone()),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a set was expected", other.type_name()))),
    }
}

fn force_str_symbol(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<crate::symbol::Symbol, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::Str(s) => Ok(state.symbols.create(&s.bytes)),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a string was expected", other.type_name()))),
    }
}

fn force_list(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<NixList, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::List(l) => Ok(l.clone()),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a list was expected", other.type_name()))),
    }
}

pub fn attr_names(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let attrs = force_attrs(state, &args[0], pos)?;
    let names: Vec<Value> = attrs.iter().map(|a| Value::string_plain(state.symbols.get(a.name).to_string())).collect();
    Ok(Finished::List(NixList::from_vec(names)))
}

pub fn attr_values(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let attrs = force_attrs(state, &args[0], pos)?;
    let values: Vec<Value> = attrs.iter().map(|a| a.value.clone()).collect();
    Ok(Finished::List(NixList::from_vec(values)))
}

pub fn get_attr(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let name = force_str_symbol(state, &args[0], pos)?;
    let attrs = force_attrs(state, &args[1], pos)?;
    let attr = attrs
        .get(name)
        .ok_or_else(|| ErrorValue::eval_error(pos, format!("attribute '{}' missing", state.symbols.get(name))))?;
    let v = attr.value.clone();
    v.force(state, pos)?;
    Ok(v.finished_ref().clone_finished())
}

pub fn has_attr(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let name = force_str_symbol(state, &args[0], pos)?;
    let attrs = force_attrs(state, &args[1], pos)?;
    Ok(Finished::Bool(attrs.get(name).is_some()))
}

pub fn remove_attrs(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let attrs = force_attrs(state, &args[0], pos)?;
    let to_remove = force_list(state, &args[1], pos)?;
    let mut remove_names = Vec::with_capacity(to_remove.len());
    for item in to_remove.iter() {
        remove_names.push(force_str_symbol(state, item, pos)?);
    }
    let mut builder = BindingsBuilder::with_capacity(attrs.len());
    for a in attrs.iter() {
        if !remove_names.contains(&a.name) {
            let _ = builder.insert(a.name, a.pos, a.value.clone());
        }
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}

pub fn list_to_attrs(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let list = force_list(state, &args[0], pos)?;
    let name_sym = state.symbols.create("name");
    let value_sym = state.symbols.create("value");
    let mut builder = BindingsBuilder::with_capacity(list.len());
    for item in list.iter() {
        let entry = force_attrs(state, item, pos)?;
        let name_attr = entry.get(name_sym).ok_or_else(|| ErrorValue::eval_error(pos, "'name' attribute missing in a call to listToAttrs"))?;
        let name = force_str_symbol(state, &name_attr.value.clone(), pos)?;
        let value_attr = entry
            .get(value_sym)
            .ok_or_else(|| ErrorValue::eval_error(pos, "'value' attribute missing in a call to listToAttrs"))?;
        builder.insert_or_replace(name, pos, value_attr.value.clone());
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}

pub fn intersect_attrs(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let e1 = force_attrs(state, &args[0], pos)?;
    let e2 = force_attrs(state, &args[1], pos)?;
    let mut builder = BindingsBuilder::with_capacity(e1.len().min(e2.len()));
    for a in e2.iter() {
        if e1.get(a.name).is_some() {
            let _ = builder.insert(a.name, a.pos, a.value.clone());
        }
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}

pub fn map_attrs(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let f = args[0].clone();
    let attrs = force_attrs(state, &args[1], pos)?;
    let mut builder = BindingsBuilder::with_capacity(attrs.len());
    for a in attrs.iter() {
        let name_val = Value::string_plain(state.symbols.get(a.name).to_string());
        let mut call_args = [name_val, a.value.clone()];
        let applied = call_function_value(state, &f, &mut call_args, pos)?;
        let _ = builder.insert(a.name, a.pos, Value::finished(applied));
    }
    Ok(Finished::Attrs(builder.finish(pos)))
}
