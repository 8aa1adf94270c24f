//! Attribute sets: a flat, sorted `Symbol -> Value` map (spec §3, §4.3).
//!
//! Sorted by `Symbol` handle — not by name — so lookup is a binary search
//! and construction only needs one sort at the end, mirroring
//! `attr-set.hh`'s `Bindings` (a flat vector kept sorted, built through a
//! separate unsorted-insert builder).

use std::rc::Rc;

use crate::pos::PosIdx;
use crate::symbol::Symbol;
use crate::value::Value;

/// One `name = value` entry. `pos` is the position of the attribute's own
/// definition (used in trace frames and `AttrCursor`-style introspection),
/// distinct from the attrset literal's overall position.
#[derive(Clone)]
pub struct Attr {
    pub name: Symbol,
    pub pos: PosIdx,
    pub value: Value,
}

/// A finished, sorted attribute set. Cheap to clone (an `Rc` bump);
/// immutable once built (spec §3 invariant 5).
#[derive(Clone)]
pub struct Bindings {
    attrs: Rc<[Attr]>,
    pos: PosIdx,
}

impl Bindings {
    #[must_use]
    pub fn empty() -> Self {
        Self { attrs: Rc::from(Vec::new()), pos: PosIdx::NONE }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    #[must_use]
    pub fn pos(&self) -> PosIdx {
        self.pos
    }

    /// O(log n) lookup by symbol handle.
    #[must_use]
    pub fn get(&self, name: Symbol) -> Option<&Attr> {
        self.attrs.binary_search_by_key(&name, |a| a.name).ok().map(|i| &self.attrs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    /// `l // r`: RHS wins on collision. Reuses either operand verbatim when
    /// the other is empty (spec §4.3, §8 "Update identity").
    #[must_use]
    pub fn update(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut merged = Vec::with_capacity(self.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.attrs.len() && j < other.attrs.len() {
            let (a, b) = (&self.attrs[i], &other.attrs[j]);
            match a.name.cmp(&b.name) {
                std::cmp::Ordering::Less => {
                    merged.push(a.clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(b.clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(b.clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&self.attrs[i..]);
        merged.extend_from_slice(&other.attrs[j..]);
        Self { attrs: Rc::from(merged), pos: self.pos }
    }
}

/// Error raised when a builder sees the same symbol inserted twice; carries
/// both positions so the evaluator can point at the original and the
/// conflicting definition (spec §4.3).
#[derive(Debug, Clone)]
pub struct DuplicateAttr {
    pub name: Symbol,
    pub first_pos: PosIdx,
    pub second_pos: PosIdx,
}

/// Unsorted-insert builder; `finish` sorts once and rejects duplicate keys.
#[derive(Default)]
pub struct BindingsBuilder {
    attrs: Vec<Attr>,
}

impl BindingsBuilder {
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self { attrs: Vec::with_capacity(cap) }
    }

    /// Inserts an attribute, or replaces an existing one with the same name
    /// (used by `rec { ... __overrides = ...; }`, spec §4.3).
    pub fn insert_or_replace(&mut self, name: Symbol, pos: PosIdx, value: Value) {
        if let Some(existing) = self.attrs.iter_mut().find(|a| a.name == name) {
            existing.pos = pos;
            existing.value = value;
        } else {
            self.attrs.push(Attr { name, pos, value });
        }
    }

    /// Inserts a fresh attribute, returning an error if `name` was already
    /// present (ordinary `{ a = ...; a = ...; }` duplicate detection).
    pub fn insert(&mut self, name: Symbol, pos: PosIdx, value: Value) -> Result<(), DuplicateAttr> {
        if let Some(existing) = self.attrs.iter().find(|a| a.name == name) {
            return Err(DuplicateAttr { name, first_pos: existing.pos, second_pos: pos });
        }
        self.attrs.push(Attr { name, pos, value });
        Ok(())
    }

    #[must_use]
    pub fn finish(mut self, pos: PosIdx) -> Bindings {
        self.attrs.sort_by_key(|a| a.name);
        Bindings { attrs: Rc::from(self.attrs), pos }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;
    use crate::value::Value;

    #[test]
    fn update_empty_identity() {
        let mut t = SymbolTable::new();
        let a = t.create("a");
        let mut b = BindingsBuilder::default();
        b.insert(a, PosIdx::NONE, Value::int(1)).unwrap();
        let x = b.finish(PosIdx::NONE);
        let empty = Bindings::empty();
        assert_eq!(x.update(&empty).len(), 1);
        assert_eq!(empty.update(&x).len(), 1);
    }

    #[test]
    fn update_rhs_wins() {
        let mut t = SymbolTable::new();
        let a = t.create("a");
        let mut b1 = BindingsBuilder::default();
        b1.insert(a, PosIdx::NONE, Value::int(1)).unwrap();
        let mut b2 = BindingsBuilder::default();
        b2.insert(a, PosIdx::NONE, Value::int(2)).unwrap();
        let merged = b1.finish(PosIdx::NONE).update(&b2.finish(PosIdx::NONE));
        assert_eq!(merged.get(a).unwrap().value.debug_as_int(), Some(2));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut t = SymbolTable::new();
        let a = t.create("a");
        let mut b = BindingsBuilder::default();
        b.insert(a, PosIdx::NONE, Value::int(1)).unwrap();
        assert!(b.insert(a, PosIdx::NONE, Value::int(2)).is_err());
    }
}
