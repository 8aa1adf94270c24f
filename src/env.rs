//! Lexical scope chains, both the compile-time analogue used to resolve
//! variable references ([`StaticEnv`], spec §3 "StaticEnv", driven by
//! [`bind_vars`]) and the runtime frames which actually hold values
//! ([`Env`], spec §3 "Env").

use std::rc::Rc;

use crate::ast::{AttrPathPart, Expr, ExprKind, ExprRef, Param, VarResolution};
use crate::pos::PosIdx;
use crate::symbol::Symbol;
use crate::value::Value;

/// A runtime lexical frame. Parented chain mirrors `StaticEnv`'s shape
/// one-to-one once `bind_vars` has run, so a `(level, displ)` pair
/// resolved at bind time stays valid at eval time.
#[derive(Debug)]
pub struct Env {
    pub parent: Option<Rc<Env>>,
    /// Set only for frames introduced by `with e; body` — the (lazily
    /// forced) value of `e`. Absent ("Plain" in spec terms) otherwise.
    pub with_value: Option<Value>,
    /// One slot per binder introduced at this level. Filled either all at
    /// once (attrsets, `let`) or incrementally left-to-right (lambda
    /// formals, so that later defaults can see earlier-bound values) —
    /// hence the `RefCell`, since the `Rc<Env>` may already be captured by
    /// sibling thunks before every slot is filled.
    slots: std::cell::RefCell<Vec<Value>>,
}

impl Env {
    #[must_use]
    pub fn root() -> Rc<Self> {
        Rc::new(Self { parent: None, with_value: None, slots: std::cell::RefCell::new(Vec::new()) })
    }

    #[must_use]
    pub fn child_with_capacity(parent: &Rc<Self>, capacity: usize) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(parent.clone()),
            with_value: None,
            slots: std::cell::RefCell::new(Vec::with_capacity(capacity)),
        })
    }

    #[must_use]
    pub fn with_frame(parent: &Rc<Self>, value: Value) -> Rc<Self> {
        Rc::new(Self { parent: Some(parent.clone()), with_value: Some(value), slots: std::cell::RefCell::new(Vec::new()) })
    }

    pub fn push_slot(&self, v: Value) {
        self.slots.borrow_mut().push(v);
    }

    #[must_use]
    pub fn get_slot(&self, i: u32) -> Value {
        self.slots.borrow()[i as usize].clone()
    }

    pub fn set_slot(&self, i: u32, v: Value) {
        self.slots.borrow_mut()[i as usize] = v;
    }

    /// Walks `level` frames up the chain from `self`.
    #[must_use]
    pub fn ancestor(self: &Rc<Self>, level: u32) -> Rc<Self> {
        let mut env = self.clone();
        for _ in 0..level {
            env = env.parent.clone().expect("bind_vars produced an out-of-range level");
        }
        env
    }
}

// ---------------------------------------------------------------------
// Compile-time static environment and the bind_vars pass.
// ---------------------------------------------------------------------

/// Compile-time analogue of [`Env`]: maps each symbol introduced by a
/// binder to its displacement, so that `bind_vars` can resolve a variable
/// reference to `(level, displ)` exactly once per AST node (spec §3).
pub struct StaticEnv {
    parent: Option<Rc<StaticEnv>>,
    vars: Vec<(Symbol, u32)>,
    /// Whether this level is a `with`-scope: an unresolved name search
    /// must not stop here, but also can't be proven absent.
    with: bool,
}

impl StaticEnv {
    #[must_use]
    pub fn root() -> Rc<Self> {
        Rc::new(Self { parent: None, vars: Vec::new(), with: false })
    }

    /// Root for the global scope: a bare lexical level with no binders of
    /// its own, marked as a `with`-scope so that any name not otherwise
    /// resolved falls through to the runtime globals frame built by
    /// [`crate::primops::base_env`] instead of being flagged `Unresolved`
    /// at bind time.
    #[must_use]
    pub fn root_global() -> Rc<Self> {
        Rc::new(Self { parent: None, vars: Vec::new(), with: true })
    }

    #[must_use]
    fn child(parent: &Rc<Self>, vars: Vec<(Symbol, u32)>, with: bool) -> Rc<Self> {
        Rc::new(Self { parent: Some(parent.clone()), vars, with })
    }

    fn lookup(self: &Rc<Self>, name: Symbol) -> VarResolution {
        let mut level = 0u32;
        let mut env = self.clone();
        let mut saw_with = false;
        loop {
            if let Some(&(_, displ)) = env.vars.iter().find(|(n, _)| *n == name) {
                return VarResolution::FromEnv { level, displ };
            }
            saw_with |= env.with;
            match &env.parent {
                Some(p) => {
                    env = p.clone();
                    level += 1;
                }
                None => {
                    return if saw_with { VarResolution::FromWith } else { VarResolution::Unresolved };
                }
            }
        }
    }
}

/// Error raised when `bind_vars` finds a reference to a name that no
/// enclosing binder or `with` could possibly supply. Real implementations
/// catch this at parse/bind time rather than at evaluation time (spec
/// §4.2's `UndefinedVariable` is the runtime twin of this, raised only
/// when a `with` search actually fails at runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndefinedVariable {
    pub name: Symbol,
    pub pos: PosIdx,
}

/// Resolves every [`crate::ast::VarRef`] in `expr` to a `(level, displ)`
/// pair or to `FromWith`, recording the result in the node's `Cell`
/// (spec §3 "StaticEnv", §4.2 "lookupVar"). Must run exactly once per AST,
/// before any evaluation.
pub fn bind_vars(expr: &ExprRef, senv: &Rc<StaticEnv>) -> Result<(), UndefinedVariable> {
    match &expr.kind {
        ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) | ExprKind::Path(_) | ExprKind::Pos | ExprKind::BlackHole => {
            Ok(())
        }
        ExprKind::Var(v) => {
            let res = senv.lookup(v.name);
            if res == VarResolution::Unresolved {
                return Err(UndefinedVariable { name: v.name, pos: expr.pos });
            }
            v.resolution.set(res);
            Ok(())
        }
        ExprKind::Select { base, path, default } => {
            bind_vars(base, senv)?;
            bind_attr_path(path, senv)?;
            if let Some(d) = default {
                bind_vars(d, senv)?;
            }
            Ok(())
        }
        ExprKind::HasAttr { base, path } => {
            bind_vars(base, senv)?;
            bind_attr_path(path, senv)
        }
        ExprKind::Attrs { rec, statics, dynamics } => {
            let body_senv = if *rec {
                let vars = statics.iter().enumerate().map(|(i, a)| (a.name, i as u32)).collect();
                StaticEnv::child(senv, vars, false)
            } else {
                senv.clone()
            };
            for a in statics {
                bind_vars(&a.value, if *rec { &body_senv } else { senv })?;
            }
            for d in dynamics {
                bind_vars(&d.name, senv)?;
                bind_vars(&d.value, if *rec { &body_senv } else { senv })?;
            }
            Ok(())
        }
        ExprKind::List(items) => items.iter().try_for_each(|i| bind_vars(i, senv)),
        ExprKind::Lambda { param, body, .. } => {
            let body_senv = match param {
                Param::Simple(name) => StaticEnv::child(senv, vec![(*name, 0)], false),
                Param::Destructured(formals) => {
                    let mut vars: Vec<(Symbol, u32)> =
                        formals.formals.iter().enumerate().map(|(i, f)| (f.name, i as u32)).collect();
                    if let Some(alias) = formals.alias {
                        vars.push((alias, vars.len() as u32));
                    }
                    StaticEnv::child(senv, vars, false)
                }
            };
            if let Param::Destructured(formals) = param {
                for f in &formals.formals {
                    if let Some(d) = &f.default {
                        bind_vars(d, &body_senv)?;
                    }
                }
            }
            bind_vars(body, &body_senv)
        }
        ExprKind::Call { fun, args } => {
            bind_vars(fun, senv)?;
            args.iter().try_for_each(|a| bind_vars(a, senv))
        }
        ExprKind::Let { statics, dynamics, body } => {
            let vars = statics.iter().enumerate().map(|(i, a)| (a.name, i as u32)).collect();
            let body_senv = StaticEnv::child(senv, vars, false);
            for a in statics {
                bind_vars(&a.value, &body_senv)?;
            }
            for d in dynamics {
                bind_vars(&d.name, &body_senv)?;
                bind_vars(&d.value, &body_senv)?;
            }
            bind_vars(body, &body_senv)
        }
        ExprKind::With { env_expr, body } => {
            bind_vars(env_expr, senv)?;
            let body_senv = StaticEnv::child(senv, Vec::new(), true);
            bind_vars(body, &body_senv)
        }
        ExprKind::If { cond, then_branch, else_branch } => {
            bind_vars(cond, senv)?;
            bind_vars(then_branch, senv)?;
            bind_vars(else_branch, senv)
        }
        ExprKind::Assert { cond, body } => {
            bind_vars(cond, senv)?;
            bind_vars(body, senv)
        }
        ExprKind::Not(e) => bind_vars(e, senv),
        ExprKind::And(a, b) | ExprKind::Or(a, b) | ExprKind::Impl(a, b) => {
            bind_vars(a, senv)?;
            bind_vars(b, senv)
        }
        ExprKind::BinOp { lhs, rhs, op: _ } => {
            bind_vars(lhs, senv)?;
            bind_vars(rhs, senv)
        }
        ExprKind::ConcatStrings(parts) => parts.iter().try_for_each(|p| bind_vars(p, senv)),
    }
}

fn bind_attr_path(path: &[AttrPathPart], senv: &Rc<StaticEnv>) -> Result<(), UndefinedVariable> {
    for part in path {
        if let AttrPathPart::Dynamic(e) = part {
            bind_vars(e, senv)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;

    fn var(name: Symbol) -> ExprRef {
        Expr::new(PosIdx::NONE, ExprKind::Var(crate::ast::VarRef::new(name)))
    }

    #[test]
    fn resolves_lambda_param() {
        let mut t = SymbolTable::new();
        let x = t.create("x");
        let body = var(x);
        let lambda = Expr::new(PosIdx::NONE, ExprKind::Lambda { param: Param::Simple(x), body: body.clone(), name: None });
        bind_vars(&lambda, &StaticEnv::root()).unwrap();
        if let ExprKind::Var(v) = &body.kind {
            assert_eq!(v.resolution.get(), VarResolution::FromEnv { level: 0, displ: 0 });
        } else {
            unreachable!()
        }
    }

    #[test]
    fn free_variable_without_with_is_error() {
        let mut t = SymbolTable::new();
        let x = t.create("x");
        let e = var(x);
        assert!(bind_vars(&e, &StaticEnv::root()).is_err());
    }

    #[test]
    fn with_scoped_variable_resolves_to_from_with() {
        let mut t = SymbolTable::new();
        let a = t.create("a");
        let body = var(a);
        let with_expr = var(a); // placeholder; not evaluated in this test
        let _ = &with_expr;
        let env_lit = Expr::new(
            PosIdx::NONE,
            ExprKind::Attrs { rec: false, statics: Vec::new(), dynamics: Vec::new() },
        );
        let with_node = Expr::new(PosIdx::NONE, ExprKind::With { env_expr: env_lit, body: body.clone() });
        bind_vars(&with_node, &StaticEnv::root()).unwrap();
        if let ExprKind::Var(v) = &body.kind {
            assert_eq!(v.resolution.get(), VarResolution::FromWith);
        } else {
            unreachable!()
        }
    }
}
