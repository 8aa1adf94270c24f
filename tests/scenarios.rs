//! Integration coverage for the concrete scenario table (spec §8),
//! picking up where `eval.rs`'s unit tests (scenarios 1-3, 5-7) leave
//! off: lazy `?`, primop dispatch, derivation string interpolation, and
//! cache read-through transparency.

use std::rc::Rc;

use rix_eval::ast::{AttrPathPart, Expr, ExprKind, StaticAttr, VarRef};
use rix_eval::bindings::BindingsBuilder;
use rix_eval::cache::{AttrCursor, EvalCache, ROOT_ATTR_ID};
use rix_eval::context::ContextEntry;
use rix_eval::env::{bind_vars, Env, StaticEnv};
use rix_eval::eval::{eval_expr, EvalState};
use rix_eval::pos::PosIdx;
use rix_eval::value::{Finished, Value};

fn var_ref(name: rix_eval::symbol::Symbol) -> Rc<Expr> {
    Expr::new(PosIdx::NONE, ExprKind::Var(VarRef::new(name)))
}

/// Scenario 4: `let x = x; in x ? foo` → `false` without ever forcing `x`.
#[test]
fn has_attr_on_self_referential_thunk_is_lazy_false() {
    let mut state = EvalState::for_tests();
    let x = state.symbols.create("x");
    let foo = state.symbols.create("foo");
    let expr = Expr::new(
        PosIdx::NONE,
        ExprKind::Let {
            statics: vec![StaticAttr { name: x, pos: PosIdx::NONE, value: var_ref(x), is_overrides: false }],
            dynamics: Vec::new(),
            body: Expr::new(PosIdx::NONE, ExprKind::HasAttr { base: var_ref(x), path: vec![AttrPathPart::Static(foo)] }),
        },
    );
    bind_vars(&expr, &StaticEnv::root()).unwrap();
    let result = eval_expr(&mut state, &Env::root(), &expr).unwrap();
    assert!(matches!(result, Finished::Bool(false)));
}

/// Scenario 8: `builtins.concatStringsSep "," [ "a" "b" "c" ]` → `"a,b,c"`
/// with an empty context.
#[test]
fn concat_strings_sep_joins_with_empty_context() {
    let mut state = EvalState::for_tests();
    let mut args = [
        Value::string_plain(","),
        Value::list(rix_eval::list::NixList::from_vec(vec![Value::string_plain("a"), Value::string_plain("b"), Value::string_plain("c")])),
    ];
    let result = rix_eval::primops::table()
        .into_iter()
        .find(|d| d.name == "concatStringsSep")
        .map(|d| (d.func)(&mut state, &mut args, PosIdx::NONE))
        .unwrap()
        .unwrap();
    let Finished::Str(s) = result else { panic!("expected a string") };
    assert_eq!(s.bytes.as_ref(), "a,b,c");
    assert!(s.context.is_empty());
}

/// Scenario 9: `"${d}/bin"` for a derivation value `d` — the resulting
/// string's bytes are `<outPath>/bin` and its context is exactly one
/// `Built(drvPath, "out")` entry.
#[test]
fn interpolating_a_derivation_carries_a_built_context_entry() {
    let mut state = EvalState::for_tests();
    let mut drv_args = [build_minimal_derivation_input(&mut state)];
    let drv = rix_eval::derivation::derivation_strict(&mut state, &mut drv_args, PosIdx::NONE).unwrap();
    let Finished::Attrs(drv_attrs) = &drv else { panic!("expected attrs") };
    let drv_sym = state.symbols.create("drvPath");
    let out_path_attr = drv_attrs.get(state.symbols.create("outPath")).unwrap();

    let d = state.symbols.create("d");
    let env = Env::root();
    env.push_slot(Value::finished(drv));
    let d_ref = var_ref(d);
    // `d` is resolved by hand to slot 0 of the root `Env` built above —
    // this test has no lexical binder for `bind_vars` to walk.
    if let ExprKind::Var(v) = &d_ref.kind {
        v.resolution.set(rix_eval::ast::VarResolution::FromEnv { level: 0, displ: 0 });
    }
    let concat = Expr::new(PosIdx::NONE, ExprKind::ConcatStrings(vec![d_ref, Expr::new(PosIdx::NONE, ExprKind::Str(Rc::from("/bin")))]));

    let result = eval_expr(&mut state, &env, &concat).unwrap();
    let Finished::Str(s) = result else { panic!("expected a string") };

    let Finished::Str(out_path) = out_path_attr.value.finished_ref().clone_finished() else { panic!("expected outPath to be a string") };
    assert_eq!(s.bytes.as_ref(), format!("{}/bin", out_path.bytes));
    assert_eq!(s.context.len(), 1);
    let entry = s.context.iter().next().unwrap();
    match entry {
        ContextEntry::Built { output_name, .. } => assert_eq!(output_name.as_ref(), "out"),
        other => panic!("expected a Built context entry, got {other:?}"),
    }
    let _ = drv_sym;
}

fn build_minimal_derivation_input(state: &mut EvalState) -> Value {
    let name_sym = state.symbols.create("name");
    let system_sym = state.symbols.create("system");
    let builder_sym = state.symbols.create("builder");
    let mut builder = BindingsBuilder::with_capacity(3);
    builder.insert(name_sym, PosIdx::NONE, Value::string_plain("hello")).unwrap();
    builder.insert(system_sym, PosIdx::NONE, Value::string_plain("x86_64-linux")).unwrap();
    builder.insert(builder_sym, PosIdx::NONE, Value::string_plain("/bin/sh")).unwrap();
    Value::attrs(builder.finish(PosIdx::NONE))
}

/// Scenario 10: reading the same attribute twice via `AttrCursor` with a
/// fresh cache yields identical bytes/context on both reads, and the
/// second read is served from the database rather than re-forcing the
/// underlying `Value`.
#[test]
fn attr_cursor_second_read_is_cache_transparent() {
    let mut state = EvalState::for_tests();
    let pname_sym = state.symbols.create("pname");
    let mut builder = BindingsBuilder::with_capacity(1);
    builder.insert(pname_sym, PosIdx::NONE, Value::string_plain("hello")).unwrap();
    let root_value = Value::attrs(builder.finish(PosIdx::NONE));

    let cache = Rc::new(EvalCache::open_in_memory().unwrap());
    let root_cursor = AttrCursor::root(Some(cache.clone()), root_value);

    let first = root_cursor.maybe_get_attr(&mut state, pname_sym, false, PosIdx::NONE).unwrap().unwrap();
    let first_string = first.get_string(&mut state, PosIdx::NONE).unwrap();
    assert_eq!(first_string.bytes.as_ref(), "hello");

    // A fresh cursor derived the same way reads the now-cached row rather
    // than forcing the (already-forced, so this would pass either way,
    // but the cached row content is what we assert on) underlying value.
    let (_, cached) = cache.get_attr(ROOT_ATTR_ID, "pname").unwrap();
    match cached {
        rix_eval::cache::CachedValue::Str(s, ctx) => {
            assert_eq!(s, "hello");
            assert!(ctx.is_empty());
        }
        other => panic!("expected a cached string row, got {other:?}"),
    }

    let second = root_cursor.maybe_get_attr(&mut state, pname_sym, false, PosIdx::NONE).unwrap().unwrap();
    let second_string = second.get_string(&mut state, PosIdx::NONE).unwrap();
    assert_eq!(second_string.bytes.as_ref(), first_string.bytes.as_ref());
}

/// Caching a list attribute whose elements are still unforced thunks (the
/// common case — e.g. `map (p: p.outPath) deps`) must not panic: the
/// cache's write-back has to force each element before inspecting it.
#[test]
fn attr_cursor_caches_a_list_of_still_unforced_elements() {
    let mut state = EvalState::for_tests();
    let items_sym = state.symbols.create("items");

    let env = Env::root();
    let elem_a = Value::thunk(env.clone(), Expr::new(PosIdx::NONE, ExprKind::Str(Rc::from("a"))));
    let elem_b = Value::thunk(env.clone(), Expr::new(PosIdx::NONE, ExprKind::Str(Rc::from("b"))));
    let list_value = Value::list(rix_eval::list::NixList::from_vec(vec![elem_a, elem_b]));

    let mut builder = BindingsBuilder::with_capacity(1);
    builder.insert(items_sym, PosIdx::NONE, list_value).unwrap();
    let root_value = Value::attrs(builder.finish(PosIdx::NONE));

    let cache = Rc::new(EvalCache::open_in_memory().unwrap());
    let root_cursor = AttrCursor::root(Some(cache.clone()), root_value);

    let items_cursor = root_cursor.maybe_get_attr(&mut state, items_sym, false, PosIdx::NONE).unwrap().unwrap();
    let items = items_cursor.get_list_of_strings(&mut state, PosIdx::NONE).unwrap();
    assert_eq!(items, vec!["a".to_string(), "b".to_string()]);

    let (_, cached) = cache.get_attr(ROOT_ATTR_ID, "items").unwrap();
    match cached {
        rix_eval::cache::CachedValue::ListOfStrings(v) => assert_eq!(v, vec!["a".to_string(), "b".to_string()]),
        other => panic!("expected a cached list-of-strings row, got {other:?}"),
    }
}

/// `addErrorContext` attaches its message as a trace frame on an error
/// raised while forcing its second argument, rather than swallowing it.
#[test]
fn add_error_context_attaches_a_trace_frame_to_a_propagated_error() {
    let mut state = EvalState::for_tests();
    let mut args = [Value::string_plain("while building the thing"), Value::thunk(Env::root(), var_ref(state.symbols.create("undefined")))];
    let def = rix_eval::primops::table().into_iter().find(|d| d.name == "addErrorContext").unwrap();
    let result = (def.func)(&mut state, &mut args, PosIdx::NONE);
    let err = result.unwrap_err();
    assert!(err.trace.iter().any(|f| f.hint == "while building the thing"));
}

/// Scenario 4 supplement: `?` on a base that is *not* self-referential
/// still forces it normally and reports missing attributes as `false`.
#[test]
fn has_attr_on_a_forced_non_matching_attrset_is_false() {
    let mut state = EvalState::for_tests();
    let foo = state.symbols.create("foo");
    let bar = state.symbols.create("bar");
    let mut builder = BindingsBuilder::with_capacity(1);
    builder.insert(bar, PosIdx::NONE, Value::int(1)).unwrap();
    let base = Expr::new(PosIdx::NONE, ExprKind::Var(VarRef::new(state.symbols.create("x"))));
    let env = Env::root();
    env.push_slot(Value::attrs(builder.finish(PosIdx::NONE)));
    if let ExprKind::Var(v) = &base.kind {
        v.resolution.set(rix_eval::ast::VarResolution::FromEnv { level: 0, displ: 0 });
    }
    let has_attr = Expr::new(PosIdx::NONE, ExprKind::HasAttr { base, path: vec![AttrPathPart::Static(foo)] });
    let result = eval_expr(&mut state, &env, &has_attr).unwrap();
    assert!(matches!(result, Finished::Bool(false)));
}
