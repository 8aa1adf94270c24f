//! Derivation formation (spec §4.8): the `derivationStrict`-like primop
//! that reifies an attrset of build inputs into a `{ type =
//! "derivation"; ... }` value, grounded on `eval.cc`'s `derivationStrict`
//! and `get-drvs.hh`'s output-attribute shape.
//!
//! The real `.drv` file format and store realisation are the host's job
//! (spec §6); this crate only needs to produce a deterministic
//! content-derived path string and the context entries that make the
//! result usable as a build input elsewhere, so the hash here is a
//! plain `Sha256` over the canonicalised inputs rather than Nix's ATerm
//! serialisation.

use sha2::{Digest, Sha256};

use crate::bindings::{Bindings, BindingsBuilder};
use crate::context::{ContextEntry, StorePath, StringContext};
use crate::error::ErrorValue;
use crate::eval::{coerce_to_string, EvalState};
use crate::pos::PosIdx;
use crate::value::{Finished, NixString, Value};

fn force_attrs(state: &mut EvalState, v: &Value, pos: PosIdx) -> Result<Bindings, ErrorValue> {
    v.force(state, pos)?;
    match &*v.finished_ref() {
        Finished::Attrs(a) => Ok(a.clone()),
        other => Err(ErrorValue::type_error(pos, format!("value is {} while a set was expected", other.type_name()))),
    }
}

/// Fields consumed by name rather than folded into the environment.
const RESERVED_FIELDS: &[&str] = &["name", "system", "builder", "args", "outputs"];

fn digest_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    let out = hasher.finalize();
    out.iter().take(20).map(|b| format!("{b:02x}")).collect()
}

pub fn derivation_strict(state: &mut EvalState, args: &mut [Value], pos: PosIdx) -> Result<Finished, ErrorValue> {
    let input = force_attrs(state, &args[0], pos)?;

    let name_sym = state.symbols.create("name");
    let system_sym = state.symbols.create("system");
    let builder_sym = state.symbols.create("builder");
    let outputs_sym = state.symbols.create("outputs");

    let mut ctx = StringContext::new();
    let name = input
        .get(name_sym)
        .ok_or_else(|| ErrorValue::eval_error(pos, "required attribute 'name' missing"))
        .and_then(|a| {
            a.value.force(state, pos)?;
            coerce_to_string(state, &a.value.finished_ref().clone_finished(), &mut ctx, false, false, false, pos)
        })?;
    let system = match input.get(system_sym) {
        Some(a) => {
            a.value.force(state, pos)?;
            coerce_to_string(state, &a.value.finished_ref().clone_finished(), &mut ctx, false, false, false, pos)?
        }
        None => state.config.eval_system.clone(),
    };
    let builder = match input.get(builder_sym) {
        Some(a) => {
            a.value.force(state, pos)?;
            coerce_to_string(state, &a.value.finished_ref().clone_finished(), &mut ctx, false, false, true, pos)?
        }
        None => String::new(),
    };

    let output_names: Vec<String> = match input.get(outputs_sym) {
        Some(a) => {
            a.value.force(state, pos)?;
            let Finished::List(l) = &*a.value.finished_ref() else {
                return Err(ErrorValue::type_error(pos, "'outputs' must be a list of strings"));
            };
            let mut names = Vec::with_capacity(l.len());
            for item in l.iter() {
                item.force(state, pos)?;
                match &*item.finished_ref() {
                    Finished::Str(s) => names.push(s.bytes.to_string()),
                    other => return Err(ErrorValue::type_error(pos, format!("value is {} while a string was expected", other.type_name()))),
                }
            }
            if names.is_empty() {
                return Err(ErrorValue::eval_error(pos, "derivation must produce at least one output"));
            }
            names
        }
        None => vec!["out".to_string()],
    };

    // Environment: every non-reserved attribute, coerced to a string, in
    // sorted (already-Symbol-ordered) attribute order for determinism.
    let mut env_parts = Vec::new();
    for attr in input.iter() {
        let attr_name = state.symbols.get(attr.name).to_string();
        if RESERVED_FIELDS.contains(&attr_name.as_str()) {
            continue;
        }
        attr.value.force(state, pos)?;
        let v = attr.value.finished_ref().clone_finished();
        let s = coerce_to_string(state, &v, &mut ctx, false, true, true, pos)?;
        env_parts.push(format!("{attr_name}={s}"));
    }

    let hash_input: Vec<&str> = std::iter::once(name.as_str())
        .chain(std::iter::once(system.as_str()))
        .chain(std::iter::once(builder.as_str()))
        .chain(env_parts.iter().map(String::as_str))
        .chain(output_names.iter().map(String::as_str))
        .collect();
    let hash = digest_hex(&hash_input);

    let drv_path = format!("/nix/store/{hash}-{name}.drv");
    let drv_store_path = StorePath(drv_path.clone().into());

    let mut builder_out = BindingsBuilder::with_capacity(output_names.len() + 4);
    let type_sym = state.symbols.create("type");
    let name_sym2 = state.symbols.create("name");
    let drv_path_sym = state.symbols.create("drvPath");
    let out_path_sym = state.symbols.create("outPath");
    let outputs_sym2 = state.symbols.create("outputs");

    let _ = builder_out.insert(type_sym, pos, Value::string_plain("derivation"));
    let _ = builder_out.insert(name_sym2, pos, Value::string_plain(name.clone()));
    let _ = builder_out.insert(
        drv_path_sym,
        pos,
        Value::string(NixString::with_context(drv_path, StringContext::single(ContextEntry::DrvDeep(drv_store_path.clone())))),
    );
    let _ = builder_out.insert(
        outputs_sym2,
        pos,
        Value::list(crate::list::NixList::from_vec(output_names.iter().map(|n| Value::string_plain(n.clone())).collect())),
    );

    let mut primary_out_path = None;
    for output in &output_names {
        let suffix = if output == "out" { String::new() } else { format!("-{output}") };
        let out_path = format!("/nix/store/{hash}-{name}{suffix}");
        if output == "out" {
            primary_out_path = Some(out_path.clone());
        }
        let entry = StringContext::single(ContextEntry::Built { drv_path: drv_store_path.clone(), output_name: output.as_str().into() });
        let out_sym = state.symbols.create(output);
        let _ = builder_out.insert(out_sym, pos, Value::string(NixString::with_context(out_path, entry)));
    }
    let primary = primary_out_path.unwrap_or_else(|| format!("/nix/store/{hash}-{name}"));
    let primary_ctx = StringContext::single(ContextEntry::Built { drv_path: drv_store_path, output_name: output_names[0].as_str().into() });
    builder_out.insert_or_replace(out_path_sym, pos, Value::string(NixString::with_context(primary, primary_ctx)));

    Ok(Finished::Attrs(builder_out.finish(pos)))
}
