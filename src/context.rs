//! String contexts: the build-time dependency annotations carried alongside
//! string values (spec §3 "String Context Entry").

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// A store path: an opaque content-addressed location. The core never
/// inspects the bytes beyond comparing and ordering them; validation and
/// realisation belong to the external Store (spec §6).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct StorePath(pub Rc<str>);

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recursive "single derived path": either an already-realised artifact,
/// or a specific output of a (possibly not-yet-built) derivation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SingleDerivedPath {
    Opaque(StorePath),
    Built { drv: Rc<SingleDerivedPath>, output: Rc<str> },
}

impl fmt::Display for SingleDerivedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opaque(p) => write!(f, "{p}"),
            Self::Built { drv, output } => write!(f, "{drv}!{output}"),
        }
    }
}

/// One dependency tracked by a string's context (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContextEntry {
    /// Dependency on an already-realised artifact.
    Opaque(StorePath),
    /// Dependency on a derivation and its full build closure.
    DrvDeep(StorePath),
    /// Dependency on a specific output of a derivation.
    Built { drv_path: StorePath, output_name: Rc<str> },
}

impl ContextEntry {
    fn sort_key(&self) -> (u8, &str, &str) {
        match self {
            Self::Opaque(p) => (0, &p.0, ""),
            Self::DrvDeep(p) => (1, &p.0, ""),
            Self::Built { drv_path, output_name } => (2, &drv_path.0, output_name),
        }
    }
}

impl PartialOrd for ContextEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContextEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A string's context: a sorted, de-duplicated set of [`ContextEntry`]
/// values (spec §3 invariant 3). Empty contexts are represented as `None`
/// at the call site rather than `Some(vec![])` to avoid an allocation for
/// the overwhelmingly common context-free string.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StringContext(Vec<ContextEntry>);

impl StringContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(entry: ContextEntry) -> Self {
        Self(vec![entry])
    }

    pub fn insert(&mut self, entry: ContextEntry) {
        match self.0.binary_search(&entry) {
            Ok(_) => {}
            Err(i) => self.0.insert(i, entry),
        }
    }

    /// Unions `other` into `self`, keeping the sorted/de-duplicated
    /// invariant (used when concatenating strings).
    pub fn union(&mut self, other: &Self) {
        for e in &other.0 {
            self.insert(e.clone());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContextEntry> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<ContextEntry> for StringContext {
    fn from_iter<T: IntoIterator<Item = ContextEntry>>(iter: T) -> Self {
        let mut ctx = Self::new();
        for e in iter {
            ctx.insert(e);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(s: &str) -> StorePath {
        StorePath(s.into())
    }

    #[test]
    fn insert_dedupes_and_sorts() {
        let mut ctx = StringContext::new();
        ctx.insert(ContextEntry::Opaque(sp("/nix/store/b")));
        ctx.insert(ContextEntry::Opaque(sp("/nix/store/a")));
        ctx.insert(ContextEntry::Opaque(sp("/nix/store/a")));
        assert_eq!(ctx.len(), 2);
        let paths: Vec<_> = ctx.iter().collect();
        assert!(matches!(paths[0], ContextEntry::Opaque(p) if p.0.as_ref() == "/nix/store/a"));
    }

    #[test]
    fn union_merges_sorted() {
        let mut a = StringContext::single(ContextEntry::Opaque(sp("/nix/store/a")));
        let b = StringContext::single(ContextEntry::Opaque(sp("/nix/store/b")));
        a.union(&b);
        assert_eq!(a.len(), 2);
    }
}
