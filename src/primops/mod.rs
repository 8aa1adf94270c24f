//! Builtin primops and the global scope they populate (spec §4.8).
//!
//! Each submodule groups primops by the kind of value they operate on,
//! mirroring `libexpr/primops.cc`'s section layout; `table()` is this
//! crate's analogue of that file's `RegisterPrimOp` registrations,
//! assembled once into a `Def` list rather than scattered
//! static-initializer side effects.

mod arithmetic;
mod attrs;
mod lists;
mod misc;
mod strings;

use std::rc::Rc;

use crate::bindings::{Bindings, BindingsBuilder};
use crate::env::{Env, StaticEnv};
use crate::eval::EvalState;
use crate::value::{PrimOpDescriptor, PrimOpFn, Value};

/// One entry of the primop table: enough to build both a
/// [`PrimOpDescriptor`] and the `builtins.<name>` attrset slot (and, for
/// non-internal entries, the bare-global slot too).
pub struct Def {
    pub name: &'static str,
    pub arity: u8,
    pub func: PrimOpFn,
    pub arg_names: Option<&'static [&'static str]>,
    pub doc: Option<&'static str>,
    /// Reachable only via `builtins.<name>`, never as a bare global.
    pub internal: bool,
}

macro_rules! def {
    ($name:literal, $arity:literal, $func:expr) => {
        Def { name: $name, arity: $arity, func: $func, arg_names: None, doc: None, internal: false }
    };
    ($name:literal, $arity:literal, $func:expr, internal) => {
        Def { name: $name, arity: $arity, func: $func, arg_names: None, doc: None, internal: true }
    };
}

/// The full primop table (spec §4.8's builtin catalogue plus the
/// `tryEval`/`genericClosure`/`splitVersion`/... supplement named in
/// SPEC_FULL.md §3).
#[must_use]
pub fn table() -> Vec<Def> {
    vec![
        // Arithmetic / comparison.
        def!("add", 2, arithmetic::add, internal),
        def!("sub", 2, arithmetic::sub, internal),
        def!("mul", 2, arithmetic::mul, internal),
        def!("div", 2, arithmetic::div, internal),
        def!("lessThan", 2, arithmetic::less_than, internal),
        // Strings.
        def!("toString", 1, strings::to_string_builtin),
        def!("stringLength", 1, strings::string_length, internal),
        def!("substring", 3, strings::substring, internal),
        def!("concatStringsSep", 2, strings::concat_strings_sep, internal),
        def!("split", 2, strings::split, internal),
        def!("replaceStrings", 3, strings::replace_strings, internal),
        // Lists.
        def!("head", 1, lists::head, internal),
        def!("tail", 1, lists::tail, internal),
        def!("elemAt", 2, lists::elem_at, internal),
        def!("length", 1, lists::length, internal),
        def!("map", 2, lists::map),
        def!("filter", 2, lists::filter, internal),
        def!("elem", 2, lists::elem, internal),
        def!("concatLists", 1, lists::concat_lists, internal),
        def!("foldl'", 3, lists::foldl_strict, internal),
        def!("sort", 2, lists::sort, internal),
        def!("genList", 2, lists::gen_list, internal),
        def!("all", 2, lists::all, internal),
        def!("any", 2, lists::any, internal),
        def!("partition", 2, lists::partition, internal),
        // Attribute sets.
        def!("attrNames", 1, attrs::attr_names, internal),
        def!("attrValues", 1, attrs::attr_values, internal),
        def!("getAttr", 2, attrs::get_attr, internal),
        def!("hasAttr", 2, attrs::has_attr, internal),
        def!("removeAttrs", 2, attrs::remove_attrs),
        def!("listToAttrs", 1, attrs::list_to_attrs, internal),
        def!("intersectAttrs", 2, attrs::intersect_attrs, internal),
        def!("mapAttrs", 2, attrs::map_attrs, internal),
        // Control flow / introspection.
        def!("abort", 1, misc::abort),
        def!("throw", 1, misc::throw),
        def!("tryEval", 1, misc::try_eval, internal),
        def!("addErrorContext", 2, misc::add_error_context, internal),
        def!("seq", 2, misc::seq, internal),
        def!("deepSeq", 2, misc::deep_seq, internal),
        def!("trace", 2, misc::trace, internal),
        def!("typeOf", 1, misc::type_of, internal),
        def!("isNull", 1, misc::is_null),
        def!("isBool", 1, misc::is_bool, internal),
        def!("isInt", 1, misc::is_int, internal),
        def!("isFloat", 1, misc::is_float, internal),
        def!("isString", 1, misc::is_string, internal),
        def!("isPath", 1, misc::is_path, internal),
        def!("isList", 1, misc::is_list, internal),
        def!("isAttrs", 1, misc::is_attrs, internal),
        def!("isFunction", 1, misc::is_function, internal),
        def!("functionArgs", 1, misc::function_args, internal),
        def!("splitVersion", 1, misc::split_version, internal),
        def!("compareVersions", 2, misc::compare_versions, internal),
        def!("genericClosure", 1, misc::generic_closure, internal),
        def!("baseNameOf", 1, misc::base_name_of),
        def!("dirOf", 1, misc::dir_of),
        def!("eq", 2, misc::eq_builtin, internal),
        def!("import", 1, misc::import),
        // Derivations.
        def!("derivationStrict", 1, crate::derivation::derivation_strict, internal),
    ]
}

fn descriptor(def: &Def) -> Rc<PrimOpDescriptor> {
    Rc::new(PrimOpDescriptor { name: def.name, arity: def.arity, func: def.func, arg_names: def.arg_names, doc: def.doc, internal: def.internal })
}

/// Builds the `builtins` attrset: every entry of [`table`], plus the
/// handful of constant attributes spec §4.8 groups under the same name.
#[must_use]
pub fn builtins_attrset(state: &mut EvalState) -> Bindings {
    let table = table();
    let mut builder = BindingsBuilder::with_capacity(table.len() + 3);
    for def in &table {
        let sym = state.symbols.create(def.name);
        let _ = builder.insert(sym, crate::pos::PosIdx::NONE, Value::primop(descriptor(def)));
    }
    let true_sym = state.symbols.create("true");
    let false_sym = state.symbols.create("false");
    let null_sym = state.symbols.create("null");
    let _ = builder.insert(true_sym, crate::pos::PosIdx::NONE, Value::bool(true));
    let _ = builder.insert(false_sym, crate::pos::PosIdx::NONE, Value::bool(false));
    let _ = builder.insert(null_sym, crate::pos::PosIdx::NONE, Value::null());

    let current_system_sym = state.symbols.create("currentSystem");
    let _ = builder.insert(current_system_sym, crate::pos::PosIdx::NONE, Value::string_plain(state.config.eval_system.clone()));
    let nix_version_sym = state.symbols.create("nixVersion");
    let _ = builder.insert(nix_version_sym, crate::pos::PosIdx::NONE, Value::string_plain("2.18.0"));
    let lang_version_sym = state.symbols.create("langVersion");
    let _ = builder.insert(lang_version_sym, crate::pos::PosIdx::NONE, Value::int(6));

    builder.finish(crate::pos::PosIdx::NONE)
}

/// The curated set of names exposed bare at global scope, in addition to
/// `builtins` itself (spec §4.8: only a handful of primops double as
/// globals, the rest are `builtins.foo`-only).
const GLOBAL_NAMES: &[&str] = &["map", "removeAttrs", "throw", "abort", "toString", "baseNameOf", "dirOf", "isNull", "import"];

/// Builds the root lexical scope: a `builtins` attrset plus the curated
/// bare-global names, exposed through a `with`-frame so ordinary lexical
/// lookup falls through to it exactly like a user-written `with`
/// (spec §3 "Env", §4.2 `lookupVar`'s `FromWith` case).
///
/// Also stashes the resulting frame into `state.globals_env` so
/// `builtins.import` can re-use it as the environment every imported
/// file evaluates in (spec §4.6).
#[must_use]
pub fn base_env(state: &mut EvalState) -> (Rc<StaticEnv>, Rc<Env>) {
    let builtins_bindings = builtins_attrset(state);
    let mut globals = BindingsBuilder::with_capacity(GLOBAL_NAMES.len() + 1);
    let builtins_sym = state.symbols.create("builtins");
    let _ = globals.insert(builtins_sym, crate::pos::PosIdx::NONE, Value::attrs(builtins_bindings.clone()));
    for name in GLOBAL_NAMES {
        let sym = state.symbols.create(name);
        if let Some(attr) = builtins_bindings.get(sym) {
            globals.insert_or_replace(sym, crate::pos::PosIdx::NONE, attr.value.clone());
        }
    }
    let globals_value = Value::attrs(globals.finish(crate::pos::PosIdx::NONE));
    let env = Env::with_frame(&Env::root(), globals_value);
    state.globals_env = Some(env.clone());
    (StaticEnv::root_global(), env)
}
