//! List representation (spec §3, §4.5).
//!
//! Short lists (at most two elements) avoid a separate heap slice by living
//! inline inside the `SmallVec` buffer; longer lists spill to the heap.
//! Either way the list is immutable and reference-counted so that cloning a
//! `NixList` handle (e.g. copying it out of an `Env` slot) is O(1).

use std::rc::Rc;

use smallvec::SmallVec;

use crate::value::Value;

#[derive(Debug, Clone)]
pub struct NixList(Rc<SmallVec<[Value; 2]>>);

impl NixList {
    #[must_use]
    pub fn empty() -> Self {
        Self(Rc::new(SmallVec::new()))
    }

    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Rc::new(SmallVec::from_vec(items)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, i: usize) -> Option<&Value> {
        self.0.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    /// `xs ++ ys`. Reuses the non-empty operand verbatim when the other is
    /// empty (spec §4.2, §8 "Concat identity").
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut v = Vec::with_capacity(self.len() + other.len());
        v.extend(self.iter().cloned());
        v.extend(other.iter().cloned());
        Self::from_vec(v)
    }
}

impl FromIterator<Value> for NixList {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn concat_identity() {
        let xs = NixList::from_vec(vec![Value::int(1), Value::int(2)]);
        let empty = NixList::empty();
        assert_eq!(xs.concat(&empty).len(), xs.len());
        assert_eq!(empty.concat(&xs).len(), xs.len());
    }
}
