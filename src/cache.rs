//! Persistent, on-disk evaluation cache (spec §4.7).
//!
//! `EvalCache` is the raw SQL layer: one `Attributes` row per cached
//! attribute path, keyed by `(parent, name)` exactly as spec §4.7 pins
//! it, with SQLite's implicit `rowid` standing in for the spec's
//! `AttrId`. No other crate in the example pack reaches for `rusqlite`
//! — it's added net-new here because the spec's literal relational
//! schema leaves no idiomatic in-memory alternative (see DESIGN.md).
//!
//! `AttrCursor` is the evaluator-facing handle built on top: it ties a
//! cache row to the live [`Value`] it was (or will be) read from, so a
//! caller never has to choose between the two by hand.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use rusqlite::{params, Connection, OptionalExtension};

use crate::context::{ContextEntry, StorePath, StringContext};
use crate::error::ErrorValue;
use crate::eval::EvalState;
use crate::pos::PosIdx;
use crate::symbol::Symbol;
use crate::value::{Finished, NixString, Value};

pub type AttrId = i64;

/// The row id standing for "no parent" — spec §4.7's `parent_id = 0`.
pub const ROOT_ATTR_ID: AttrId = 0;

#[derive(Debug)]
pub struct CacheError(String);

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation cache error: {}", self.0)
    }
}

impl std::error::Error for CacheError {}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        Self(e.to_string())
    }
}

/// The decoded contents of one `Attributes` row (spec §4.7's `CachedValue`
/// union).
#[derive(Debug, Clone)]
pub enum CachedValue {
    Placeholder,
    FullAttrs(Vec<String>),
    Str(String, StringContext),
    Bool(bool),
    Int(i64),
    ListOfStrings(Vec<String>),
    Missing,
    Misc,
    Failed,
}

fn encode_context(ctx: &StringContext) -> String {
    ctx.iter()
        .map(|e| match e {
            ContextEntry::Opaque(p) => p.0.to_string(),
            ContextEntry::DrvDeep(p) => format!("={}", p.0),
            ContextEntry::Built { drv_path, output_name } => format!("{}!{}", drv_path.0, output_name),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_context(s: &str) -> StringContext {
    s.split(' ')
        .filter(|t| !t.is_empty())
        .map(|tok| {
            if let Some(rest) = tok.strip_prefix('=') {
                ContextEntry::DrvDeep(StorePath(rest.into()))
            } else if let Some((drv, output)) = tok.split_once('!') {
                ContextEntry::Built { drv_path: StorePath(drv.into()), output_name: output.into() }
            } else {
                ContextEntry::Opaque(StorePath(tok.into()))
            }
        })
        .collect()
}

/// The raw SQL layer (spec §4.7 "Storage"/"Operations"). Every write goes
/// through [`Self::mutate`], which enforces the "on any SQL error the
/// `failed` flag is set and subsequent writes become no-ops" discipline —
/// the cache is advisory, never a correctness dependency.
pub struct EvalCache {
    conn: Connection,
    failed: std::cell::Cell<bool>,
}

impl EvalCache {
    const SCHEMA: &'static str = "CREATE TABLE IF NOT EXISTS Attributes (
        parent  INTEGER NOT NULL,
        name    TEXT NOT NULL,
        type    TEXT NOT NULL,
        value   TEXT,
        context TEXT,
        PRIMARY KEY (parent, name)
    )";

    /// Opens (creating if absent) the cache file at `path`. The caller
    /// picks `path` so that it already encodes the session fingerprint
    /// (spec §4.7: "keyed by a session fingerprint ... derived from the
    /// root source's identity") — this type just owns the connection.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        conn.execute(Self::SCHEMA, [])?;
        Ok(Self { conn, failed: std::cell::Cell::new(false) })
    }

    /// An unbacked, transient cache for tests and for `eval-cache = false`
    /// sessions that still want the `AttrCursor` plumbing exercised.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute(Self::SCHEMA, [])?;
        Ok(Self { conn, failed: std::cell::Cell::new(false) })
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.get()
    }

    /// Runs `f`, swallowing any SQL error into the sticky `failed` flag
    /// instead of propagating it to the evaluator.
    fn mutate(&self, f: impl FnOnce(&Connection) -> Result<AttrId, rusqlite::Error>) -> Option<AttrId> {
        if self.failed.get() {
            return None;
        }
        match f(&self.conn) {
            Ok(id) => Some(id),
            Err(_) => {
                self.failed.set(true);
                None
            }
        }
    }

    fn insert_row(conn: &Connection, parent: AttrId, name: &str, ty: &str, value: Option<&str>, context: Option<&str>) -> Result<AttrId, rusqlite::Error> {
        conn.execute(
            "INSERT OR REPLACE INTO Attributes (parent, name, type, value, context) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![parent, name, ty, value, context],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_placeholder(&self, parent: AttrId, name: &str) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "placeholder", None, None))
    }

    pub fn set_attrs(&self, parent: AttrId, name: &str, children: &[String]) -> Option<AttrId> {
        let id = self.mutate(|c| Self::insert_row(c, parent, name, "full_attrs", Some(&children.join("\t")), None))?;
        for child in children {
            self.set_placeholder(id, child);
        }
        Some(id)
    }

    pub fn set_string(&self, parent: AttrId, name: &str, s: &str, ctx: Option<&StringContext>) -> Option<AttrId> {
        let context = ctx.filter(|c| !c.is_empty()).map(encode_context);
        self.mutate(|c| Self::insert_row(c, parent, name, "string", Some(s), context.as_deref()))
    }

    pub fn set_bool(&self, parent: AttrId, name: &str, b: bool) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "bool", Some(if b { "1" } else { "0" }), None))
    }

    pub fn set_int(&self, parent: AttrId, name: &str, i: i64) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "int", Some(&i.to_string()), None))
    }

    pub fn set_list_of_strings(&self, parent: AttrId, name: &str, items: &[String]) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "list_of_strings", Some(&items.join("\t")), None))
    }

    pub fn set_missing(&self, parent: AttrId, name: &str) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "missing", None, None))
    }

    pub fn set_misc(&self, parent: AttrId, name: &str) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "misc", None, None))
    }

    pub fn set_failed(&self, parent: AttrId, name: &str) -> Option<AttrId> {
        self.mutate(|c| Self::insert_row(c, parent, name, "failed", None, None))
    }

    pub fn get_attr(&self, parent: AttrId, name: &str) -> Option<(AttrId, CachedValue)> {
        if self.failed.get() {
            return None;
        }
        let row: Option<(AttrId, String, Option<String>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT rowid, type, value, context FROM Attributes WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .ok()?;
        let (id, ty, value, context) = row?;
        let decoded = match ty.as_str() {
            "placeholder" => CachedValue::Placeholder,
            "full_attrs" => CachedValue::FullAttrs(value.unwrap_or_default().split('\t').filter(|s| !s.is_empty()).map(String::from).collect()),
            "string" => CachedValue::Str(value.unwrap_or_default(), context.as_deref().map(decode_context).unwrap_or_default()),
            "bool" => CachedValue::Bool(value.as_deref() == Some("1")),
            "int" => CachedValue::Int(value.unwrap_or_default().parse().unwrap_or(0)),
            "list_of_strings" => CachedValue::ListOfStrings(value.unwrap_or_default().split('\t').filter(|s| !s.is_empty()).map(String::from).collect()),
            "missing" => CachedValue::Missing,
            "misc" => CachedValue::Misc,
            "failed" => CachedValue::Failed,
            _ => CachedValue::Misc,
        };
        Some((id, decoded))
    }
}

/// A lightweight handle pairing a cache row with the live `Value` it
/// corresponds to (spec §4.7 "AttrCursor"). Root cursors have no `name`;
/// the `attr_id` of the root is [`ROOT_ATTR_ID`].
pub struct AttrCursor {
    cache: Option<Rc<EvalCache>>,
    name: Option<Symbol>,
    attr_id: AttrId,
    value: Value,
    cached: RefCell<Option<CachedValue>>,
}

impl AttrCursor {
    #[must_use]
    pub fn root(cache: Option<Rc<EvalCache>>, value: Value) -> Rc<Self> {
        Rc::new(Self { cache, name: None, attr_id: ROOT_ATTR_ID, value, cached: RefCell::new(None) })
    }

    fn name_str(state: &EvalState, name: Symbol) -> &str {
        state.symbols.get(name)
    }

    /// Step 1-5 of spec §4.7's `maybeGetAttr`.
    pub fn maybe_get_attr(self: &Rc<Self>, state: &mut EvalState, name: Symbol, force_errors: bool, pos: PosIdx) -> Result<Option<Rc<Self>>, ErrorValue> {
        let name_s = Self::name_str(state, name).to_string();
        if let Some(cache) = &self.cache {
            if let Some(cached) = self.cached_value(cache) {
                if let CachedValue::FullAttrs(children) = &cached {
                    if !children.iter().any(|c| c == &name_s) {
                        return Ok(None);
                    }
                }
            }
            if let Some((id, child)) = cache.get_attr(self.attr_id, &name_s) {
                match child {
                    CachedValue::Missing => return Ok(None),
                    CachedValue::Failed => {
                        if force_errors {
                            // fall through to re-evaluate below
                        } else {
                            return Err(ErrorValue::new(crate::error::ErrorKind::CachedEvalError, pos, format!("cached failure for attribute '{name_s}'")));
                        }
                    }
                    CachedValue::Placeholder => {}
                    other => {
                        let value = Self::value_from_cached(&other);
                        return Ok(Some(Rc::new(Self {
                            cache: Some(cache.clone()),
                            name: Some(name),
                            attr_id: id,
                            value,
                            cached: RefCell::new(Some(other)),
                        })));
                    }
                }
            }
        }
        self.value.force(state, pos)?;
        let attrs = match &*self.value.finished_ref() {
            Finished::Attrs(a) => a.clone(),
            _ => return Ok(None),
        };
        match attrs.get(name) {
            None => {
                if let Some(cache) = &self.cache {
                    cache.set_missing(self.attr_id, &name_s);
                }
                Ok(None)
            }
            Some(attr) => {
                let child_value = attr.value.clone();
                let attr_id = if let Some(cache) = &self.cache { cache.set_placeholder(self.attr_id, &name_s).unwrap_or(ROOT_ATTR_ID) } else { ROOT_ATTR_ID };
                Ok(Some(Rc::new(Self { cache: self.cache.clone(), name: Some(name), attr_id, value: child_value, cached: RefCell::new(None) })))
            }
        }
    }

    fn cached_value(&self, _cache: &Rc<EvalCache>) -> Option<CachedValue> {
        self.cached.borrow().clone()
    }

    fn value_from_cached(cv: &CachedValue) -> Value {
        match cv {
            CachedValue::Str(s, ctx) => Value::string(NixString::with_context(s.clone(), ctx.clone())),
            CachedValue::Bool(b) => Value::bool(*b),
            CachedValue::Int(i) => Value::int(*i),
            CachedValue::ListOfStrings(items) => {
                Value::list(crate::list::NixList::from_vec(items.iter().map(|s| Value::string_plain(s.clone())).collect()))
            }
            // Placeholder/FullAttrs/Missing/Misc/Failed carry no standalone
            // Value payload at this point; the caller re-forces instead.
            _ => Value::bool(false),
        }
    }

    /// Forces the underlying value, writing back a typed cache entry if
    /// the row is still absent or a placeholder (spec §4.7 `forceValue`).
    pub fn force_value(&self, state: &mut EvalState, pos: PosIdx) -> Result<Finished, ErrorValue> {
        match self.value.force(state, pos) {
            Ok(()) => {
                let finished = self.value.finished_ref().clone_finished();
                if let Some(cache) = self.cache.clone() {
                    if matches!(self.cached_value(&cache), None | Some(CachedValue::Placeholder)) {
                        let name = self.name.map(|n| Self::name_str(state, n).to_string()).unwrap_or_default();
                        self.write_back(state, &cache, &name, &finished, pos);
                    }
                }
                Ok(finished)
            }
            Err(e) => {
                if let Some(cache) = &self.cache {
                    let name = self.name.map(|n| Self::name_str(state, n).to_string()).unwrap_or_default();
                    cache.set_failed(self.attr_id, &name);
                }
                Err(e)
            }
        }
    }

    fn write_back(&self, state: &mut EvalState, cache: &Rc<EvalCache>, name: &str, finished: &Finished, pos: PosIdx) {
        match finished {
            Finished::Str(s) => {
                cache.set_string(self.attr_id, name, &s.bytes, Some(&s.context));
            }
            Finished::Bool(b) => {
                cache.set_bool(self.attr_id, name, *b);
            }
            Finished::Int(i) => {
                cache.set_int(self.attr_id, name, *i);
            }
            Finished::List(l) => {
                // Elements of a list aren't necessarily WHNF just because
                // the list itself is (e.g. `map (p: p.outPath) deps`) —
                // force each one, same as `get_list_of_strings`, rather
                // than reading `finished_ref()` on a still-unforced cell.
                // A failure here is advisory-only: the cache simply skips
                // caching this list rather than propagating the error.
                let mut items = Vec::with_capacity(l.len());
                let mut all_strings = true;
                for item in l.iter() {
                    if item.force(state, pos).is_err() {
                        all_strings = false;
                        break;
                    }
                    match &*item.finished_ref() {
                        Finished::Str(s) => items.push(s.bytes.to_string()),
                        _ => {
                            all_strings = false;
                            break;
                        }
                    }
                }
                if all_strings {
                    cache.set_list_of_strings(self.attr_id, name, &items);
                } else {
                    cache.set_misc(self.attr_id, name);
                }
            }
            Finished::Attrs(a) => {
                let children: Vec<String> = a.iter().map(|attr| state.symbols.get(attr.name).to_string()).collect();
                cache.set_attrs(self.attr_id, name, &children);
            }
            _ => {
                cache.set_misc(self.attr_id, name);
            }
        }
    }

    pub fn get_string(&self, state: &mut EvalState, pos: PosIdx) -> Result<NixString, ErrorValue> {
        if let Some(cache) = &self.cache {
            if let Some(CachedValue::Str(s, ctx)) = self.cached_value(cache) {
                return Ok(NixString::with_context(s, ctx));
            }
        }
        match self.force_value(state, pos)? {
            Finished::Str(s) => Ok(s),
            other => Err(ErrorValue::type_error(pos, format!("value is {} while a string was expected", other.type_name()))),
        }
    }

    pub fn get_bool(&self, state: &mut EvalState, pos: PosIdx) -> Result<bool, ErrorValue> {
        if let Some(cache) = &self.cache {
            if let Some(CachedValue::Bool(b)) = self.cached_value(cache) {
                return Ok(b);
            }
        }
        match self.force_value(state, pos)? {
            Finished::Bool(b) => Ok(b),
            other => Err(ErrorValue::type_error(pos, format!("value is {} while a Boolean was expected", other.type_name()))),
        }
    }

    pub fn get_int(&self, state: &mut EvalState, pos: PosIdx) -> Result<i64, ErrorValue> {
        if let Some(cache) = &self.cache {
            if let Some(CachedValue::Int(i)) = self.cached_value(cache) {
                return Ok(i);
            }
        }
        match self.force_value(state, pos)? {
            Finished::Int(i) => Ok(i),
            other => Err(ErrorValue::type_error(pos, format!("value is {} while an integer was expected", other.type_name()))),
        }
    }

    pub fn get_list_of_strings(&self, state: &mut EvalState, pos: PosIdx) -> Result<Vec<String>, ErrorValue> {
        if let Some(cache) = &self.cache {
            if let Some(CachedValue::ListOfStrings(items)) = self.cached_value(cache) {
                return Ok(items);
            }
        }
        match self.force_value(state, pos)? {
            Finished::List(l) => {
                let mut out = Vec::with_capacity(l.len());
                for item in l.iter() {
                    item.force(state, pos)?;
                    match &*item.finished_ref() {
                        Finished::Str(s) => out.push(s.bytes.to_string()),
                        other => return Err(ErrorValue::type_error(pos, format!("value is {} while a string was expected", other.type_name()))),
                    }
                }
                Ok(out)
            }
            other => Err(ErrorValue::type_error(pos, format!("value is {} while a list was expected", other.type_name()))),
        }
    }

    pub fn get_attrs(self: &Rc<Self>, state: &mut EvalState, pos: PosIdx) -> Result<crate::bindings::Bindings, ErrorValue> {
        self.value.force(state, pos)?;
        match &*self.value.finished_ref() {
            Finished::Attrs(a) => Ok(a.clone()),
            other => Err(ErrorValue::type_error(pos, format!("value is {} while a set was expected", other.type_name()))),
        }
    }

    /// `maybeGetAttr("type") && getString() == "derivation"` (spec §4.7).
    pub fn is_derivation(self: &Rc<Self>, state: &mut EvalState, pos: PosIdx) -> Result<bool, ErrorValue> {
        let type_sym = state.symbols.create("type");
        match self.maybe_get_attr(state, type_sym, false, pos)? {
            Some(cursor) => Ok(cursor.get_string(state, pos)?.bytes.as_ref() == "derivation"),
            None => Ok(false),
        }
    }

    /// Reads `drvPath`; a real implementation would additionally consult
    /// the `Store` to detect a garbage-collected `.drv` and force a
    /// rebuild, which this evaluator-only crate leaves to the host
    /// (spec §6's store boundary).
    pub fn force_derivation(self: &Rc<Self>, state: &mut EvalState, pos: PosIdx) -> Result<NixString, ErrorValue> {
        let drv_path_sym = state.symbols.create("drvPath");
        let cursor = self
            .maybe_get_attr(state, drv_path_sym, false, pos)?
            .ok_or_else(|| ErrorValue::eval_error(pos, "derivation has no 'drvPath' attribute"))?;
        cursor.get_string(state, pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_read_round_trips() {
        let cache = EvalCache::open_in_memory().unwrap();
        let id = cache.set_string(ROOT_ATTR_ID, "pname", "hello", None).unwrap();
        let (got_id, value) = cache.get_attr(ROOT_ATTR_ID, "pname").unwrap();
        assert_eq!(id, got_id);
        assert!(matches!(value, CachedValue::Str(s, _) if s == "hello"));
    }

    #[test]
    fn replace_overwrites_prior_row() {
        let cache = EvalCache::open_in_memory().unwrap();
        cache.set_placeholder(ROOT_ATTR_ID, "x");
        cache.set_int(ROOT_ATTR_ID, "x", 42);
        let (_, value) = cache.get_attr(ROOT_ATTR_ID, "x").unwrap();
        assert!(matches!(value, CachedValue::Int(42)));
    }

    #[test]
    fn missing_attr_is_none() {
        let cache = EvalCache::open_in_memory().unwrap();
        assert!(cache.get_attr(ROOT_ATTR_ID, "nope").is_none());
    }

    #[test]
    fn set_attrs_populates_placeholder_children() {
        let cache = EvalCache::open_in_memory().unwrap();
        let id = cache.set_attrs(ROOT_ATTR_ID, "pkgs", &["a".to_string(), "b".to_string()]).unwrap();
        let (_, a) = cache.get_attr(id, "a").unwrap();
        assert!(matches!(a, CachedValue::Placeholder));
    }
}
