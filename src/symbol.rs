//! String interning for identifiers.
//!
//! Mirrors the layout idea of a single growable arena plus a lookup map: a
//! second insertion of an equal string returns the handle of the first. The
//! table is effectively append-only for the life of an evaluation session;
//! symbols are immortal once created (spec §3, §4.1).

use std::fmt;

use ahash::AHashMap;

/// Opaque handle for an interned identifier.
///
/// Equality and ordering are O(1) on the handle; the backing bytes are only
/// needed for display and are looked up through the owning [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Symbol(u32);

impl Symbol {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Append-only interner mapping identifier strings to [`Symbol`] handles.
///
/// Reads (by handle, to recover the string) are lock-free in the sense that
/// they never touch the hash map; only `create` consults it. A host that
/// shares one evaluation session across threads should serialise calls to
/// `create` (spec §5) — this type itself does no locking, leaving that to
/// the caller, matching the "writes are serialised" contract in spec §4.1.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct SymbolTable {
    strings: Vec<Box<str>>,
    #[serde(skip)]
    lookup: AHashMap<Box<str>, Symbol>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the existing handle if it was seen before.
    pub fn create(&mut self, s: &str) -> Symbol {
        if let Some(&sym) = self.lookup.get(s) {
            return sym;
        }
        let sym = Symbol(u32::try_from(self.strings.len()).expect("symbol table overflow"));
        self.strings.push(s.into());
        self.lookup.insert(s.into(), sym);
        sym
    }

    /// Recovers the backing string for a symbol. Panics on a foreign handle;
    /// symbols never outlive the table that minted them.
    #[must_use]
    pub fn get(&self, sym: Symbol) -> &str {
        &self.strings[sym.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Rebuilds the lookup map after deserialising a table whose `lookup`
    /// field was skipped (postcard has no way to serialise a `Box<str>`
    /// keyed hash map without doubling storage, so we reconstruct it).
    pub fn rebuild_lookup(&mut self) {
        self.lookup.clear();
        for (i, s) in self.strings.iter().enumerate() {
            self.lookup.insert(s.clone(), Symbol(u32::try_from(i).expect("symbol table overflow")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes() {
        let mut t = SymbolTable::new();
        let a = t.create("foo");
        let b = t.create("bar");
        let c = t.create("foo");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(t.get(a), "foo");
        assert_eq!(t.get(b), "bar");
    }

    #[test]
    fn ordering_is_creation_order() {
        let mut t = SymbolTable::new();
        let a = t.create("a");
        let b = t.create("b");
        assert!(a < b);
    }
}
