//! Source position tracking.
//!
//! Positions are created during parsing and are read-only afterwards. The
//! table stores origins (one per parsed file or string) as opaque ranges and
//! resolves `(origin, line, column)` lazily, since most positions are never
//! rendered to a user (spec §4.1).

use std::fmt;
use std::rc::Rc;

/// Identifies one parsed source document within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Origin(u32);

/// Opaque handle into the [`PositionTable`]. The zero value, [`PosIdx::NONE`],
/// is the distinguished "no position" sentinel used by synthetic AST nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct PosIdx(u32);

impl PosIdx {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PosIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pos {}>", self.0)
    }
}

/// Resolved, human-readable position: `(origin name, line, column)`, both
/// 1-based. Computing one scans the origin's source text to count newlines,
/// which is why this is only ever done for error rendering (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

struct OriginRecord {
    name: Rc<str>,
    text: Rc<str>,
    /// Byte-offset within `entries` at which this origin's positions start.
    base: u32,
    /// Lazily computed offsets (byte index) of the start of each line, used
    /// to turn a raw byte offset into `(line, column)` without rescanning on
    /// every lookup within the same origin.
    line_starts: Vec<u32>,
}

/// Append-only table of `(origin, line, column)` positions, referenced from
/// the AST by opaque [`PosIdx`] handles.
#[derive(Default)]
pub struct PositionTable {
    origins: Vec<OriginRecord>,
    /// One entry per minted `PosIdx` (index 0 is the `NONE` sentinel and has
    /// no corresponding origin/offset).
    entries: Vec<(u32, u32)>,
}

impl PositionTable {
    #[must_use]
    pub fn new() -> Self {
        Self { origins: Vec::new(), entries: vec![(0, 0)] }
    }

    /// Reserves a numeric range for a freshly parsed origin (file or string).
    pub fn add_origin(&mut self, name: impl Into<Rc<str>>, text: impl Into<Rc<str>>) -> Origin {
        let idx = u32::try_from(self.origins.len()).expect("too many origins");
        let text = text.into();
        let line_starts = compute_line_starts(&text);
        self.origins.push(OriginRecord { name: name.into(), text, base: 0, line_starts });
        Origin(idx)
    }

    /// Records a position `offset` bytes into `origin`'s source text,
    /// returning a handle that can be embedded in AST nodes.
    pub fn add(&mut self, origin: Origin, offset: u32) -> PosIdx {
        let idx = u32::try_from(self.entries.len()).expect("position table overflow");
        self.entries.push((origin.0, offset));
        PosIdx(idx)
    }

    /// Resolves a handle to a renderable `(file, line, column)` triple.
    /// Returns `None` for [`PosIdx::NONE`].
    #[must_use]
    pub fn resolve(&self, pos: PosIdx) -> Option<Pos> {
        if pos.is_none() {
            return None;
        }
        let (origin_idx, offset) = self.entries[pos.index()];
        let origin = &self.origins[origin_idx as usize];
        let (line, column) = resolve_line_col(&origin.line_starts, offset);
        Some(Pos { file: origin.name.clone(), line, column })
    }

    #[must_use]
    pub fn origin_text(&self, origin: Origin) -> &str {
        &self.origins[origin.0 as usize].text
    }
}

impl PosIdx {
    fn index(self) -> usize {
        self.0 as usize
    }
}

fn compute_line_starts(text: &str) -> Vec<u32> {
    let mut starts = vec![0u32];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            starts.push(u32::try_from(i + 1).unwrap_or(u32::MAX));
        }
    }
    starts
}

fn resolve_line_col(line_starts: &[u32], offset: u32) -> (u32, u32) {
    // binary search for the last line start <= offset
    let line_idx = match line_starts.binary_search(&offset) {
        Ok(i) => i,
        Err(i) => i.saturating_sub(1),
    };
    let line = u32::try_from(line_idx + 1).unwrap_or(u32::MAX);
    let column = offset - line_starts[line_idx] + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_position_resolves_to_none() {
        let table = PositionTable::new();
        assert_eq!(table.resolve(PosIdx::NONE), None);
    }

    #[test]
    fn resolves_line_and_column() {
        let mut table = PositionTable::new();
        let origin = table.add_origin("test.nix", "let\n  x = 1;\nin x");
        let p0 = table.add(origin, 0);
        let p_x = table.add(origin, 6); // 'x' on line 2
        assert_eq!(table.resolve(p0).unwrap().line, 1);
        let pos = table.resolve(p_x).unwrap();
        assert_eq!(pos.line, 2);
        assert_eq!(pos.column, 3);
    }
}
