//! The abstract syntax tree consumed by the evaluator.
//!
//! This is the fixed interface to the external Parser (spec §6): the parser
//! builds this tree and runs the `bind_vars` pass (see [`crate::env`]) over
//! it before handing it to [`crate::eval`]. The tree is immutable and
//! reference-counted; it outlives every value derived from it (spec §3
//! "Ownership"). Nodes are a single tagged `enum` rather than a class
//! hierarchy with virtual dispatch, per spec §9's re-architecture note.

use std::cell::Cell;
use std::rc::Rc;

use crate::pos::PosIdx;
use crate::symbol::Symbol;

/// One node of the AST. Cheaply cloned (an `Rc` bump) since closures and
/// thunks hold pointers into this tree rather than owning copies of it.
pub type ExprRef = Rc<Expr>;

#[derive(Debug)]
pub struct Expr {
    pub pos: PosIdx,
    pub kind: ExprKind,
}

impl Expr {
    #[must_use]
    pub fn new(pos: PosIdx, kind: ExprKind) -> ExprRef {
        Rc::new(Self { pos, kind })
    }
}

/// A part of an attribute path `a.b.${c}`: either a name known at parse
/// time, or an expression to be forced to a string/symbol at eval time.
#[derive(Debug)]
pub enum AttrPathPart {
    Static(Symbol),
    Dynamic(ExprRef),
}

/// Binary operators with eager (non-short-circuiting) semantics. The lazy
/// boolean operators (`&&`, `||`, `->`) and `//` get their own `ExprKind`
/// variants because they need special evaluation order (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NEq,
    Lt,
    Le,
    Gt,
    Ge,
    ConcatLists,
    Update,
}

/// One static attribute in an attrset or `let`/`rec` binding group.
#[derive(Debug)]
pub struct StaticAttr {
    pub name: Symbol,
    pub pos: PosIdx,
    pub value: ExprRef,
    /// Set by the parser when `name` is literally `__overrides` inside a
    /// `rec { ... }` — a hint the evaluator doesn't strictly need (it also
    /// recognises the attribute by symbol) but that lets tooling (e.g. a
    /// formatter) spot the construct without a `SymbolTable` in hand.
    ///
    /// `inherit x;` / `inherit (e) x;` bindings resolve to a plain
    /// `StaticAttr` whose value is a synthetic `Select`/`Var` node by the
    /// time `bind_vars` runs — there's no separate AST representation for
    /// `inherit`, matching how `nixexpr.hh` desugars it before evaluation.
    pub is_overrides: bool,
}

/// A dynamic attribute: `${name_expr} = value;`.
#[derive(Debug)]
pub struct DynamicAttr {
    pub name_pos: PosIdx,
    pub name: ExprRef,
    pub value: ExprRef,
}

/// One formal parameter of a destructuring lambda: `{ a, b ? default }`.
#[derive(Debug)]
pub struct Formal {
    pub name: Symbol,
    pub pos: PosIdx,
    pub default: Option<ExprRef>,
}

/// The formal-argument list of a destructuring lambda.
#[derive(Debug)]
pub struct Formals {
    pub formals: Vec<Formal>,
    /// Whether `...` is present, permitting unlisted attributes.
    pub ellipsis: bool,
    /// `args @ { ... }` — binds the whole argument attrset to this name too.
    pub alias: Option<Symbol>,
}

/// The parameter list of a lambda: either a single bound name, or a
/// destructuring pattern.
#[derive(Debug)]
pub enum Param {
    Simple(Symbol),
    Destructured(Formals),
}

/// Resolution of a variable reference, computed once by the `bind_vars`
/// pass (spec §3 "StaticEnv", §4.2 "lookupVar").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarResolution {
    Unresolved,
    /// Ordinary lexical binding: walk `level` frames up, read slot `displ`.
    FromEnv { level: u32, displ: u32 },
    /// No enclosing lexical binding could be proven statically; must be
    /// searched for through the chain of enclosing `with` scopes at
    /// runtime, and failing that raises `UndefinedVariable`.
    FromWith,
}

#[derive(Debug)]
pub struct VarRef {
    pub name: Symbol,
    pub resolution: Cell<VarResolution>,
}

impl VarRef {
    #[must_use]
    pub fn new(name: Symbol) -> Self {
        Self { name, resolution: Cell::new(VarResolution::Unresolved) }
    }
}

#[derive(Debug)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    /// A string literal. Always has an empty context — contexts only arise
    /// from interpolating derivation outputs or copying paths to the store.
    Str(Rc<str>),
    /// A path literal, already resolved to an absolute path by the parser.
    Path(Rc<str>),
    Var(VarRef),
    Select { base: ExprRef, path: Vec<AttrPathPart>, default: Option<ExprRef> },
    HasAttr { base: ExprRef, path: Vec<AttrPathPart> },
    Attrs { rec: bool, statics: Vec<StaticAttr>, dynamics: Vec<DynamicAttr> },
    List(Vec<ExprRef>),
    Lambda { param: Param, body: ExprRef, name: Option<Symbol> },
    Call { fun: ExprRef, args: Vec<ExprRef> },
    /// `let a = ea; ... in body` — desugars to an implicit `rec`-like
    /// binding group scoping only `body`, distinct from a `rec` attrset
    /// literal (which also produces an attrset value).
    Let { statics: Vec<StaticAttr>, dynamics: Vec<DynamicAttr>, body: ExprRef },
    With { env_expr: ExprRef, body: ExprRef },
    If { cond: ExprRef, then_branch: ExprRef, else_branch: ExprRef },
    Assert { cond: ExprRef, body: ExprRef },
    Not(ExprRef),
    And(ExprRef, ExprRef),
    Or(ExprRef, ExprRef),
    Impl(ExprRef, ExprRef),
    BinOp { op: BinOp, lhs: ExprRef, rhs: ExprRef },
    /// `a + b + c` where at least one operand is a string/path/number —
    /// distinct from list `++` (`ConcatLists`, a `BinOp`), per spec §4.2.
    ConcatStrings(Vec<ExprRef>),
    /// The position of the enclosing expression as a first-class value
    /// (used to implement `builtins.__curPos`-style debugging primops).
    Pos,
    /// Sentinel node that raises `InfiniteRecursion` unconditionally if
    /// ever evaluated. Parsers never produce this; it exists so the
    /// blackhole-detection machinery (spec §4.2) has a concrete AST shape
    /// to install when synthesising a self-referential binding in tests.
    BlackHole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_starts_unresolved() {
        let v = VarRef::new(Symbol::default_for_test());
        assert_eq!(v.resolution.get(), VarResolution::Unresolved);
    }
}

#[cfg(test)]
impl Symbol {
    fn default_for_test() -> Self {
        let mut t = crate::symbol::SymbolTable::new();
        t.create("x")
    }
}
