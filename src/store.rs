//! External collaborator interfaces (spec §6): the Store and the
//! source-accessor abstraction a `Path` value is relative to. Both are
//! out of scope for the core (spec §1); this module only fixes the trait
//! boundary the evaluator calls through, grounded on `capability.rs`'s
//! host-capability trait pattern (a narrow trait object the embedder
//! supplies, rather than a concrete filesystem/network implementation
//! baked into the evaluator).

use std::fmt;
use std::rc::Rc;

use crate::context::StorePath;

/// Identifies which filesystem/tree a `Path` value is rooted in — the
/// local filesystem, a fetched tarball, a flake input, etc. The core never
/// interprets the id itself; it threads it through to the `Store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SourceAccessorId(pub u32);

/// The hash algorithm used to content-address a store path (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Sha1,
    Md5,
}

/// Error surfaced by the external Store (spec §6). Kept separate from
/// [`crate::error::ErrorValue`] since the evaluator wraps these with an
/// evaluation position before they reach a caller.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// The fixed interface to the content-addressed artifact store (spec §6).
/// An embedder supplies a concrete implementation; the core only ever
/// calls through this trait.
pub trait Store {
    fn print_store_path(&self, path: &StorePath) -> String;
    fn parse_store_path(&self, s: &str) -> Result<StorePath, StoreError>;
    fn is_valid_path(&self, path: &StorePath) -> bool;

    /// Copies `accessor`'s tree at `path_within` into the store,
    /// content-addressing it with `algo`, returning the resulting path.
    fn add_to_store_from_dump(
        &self,
        accessor: SourceAccessorId,
        path_within: &str,
        name: &str,
        algo: HashAlgorithm,
        references: &[StorePath],
    ) -> Result<StorePath, StoreError>;

    /// Resolves a specific output of a derivation to its store path,
    /// reading the `.drv` file if necessary.
    fn read_derivation_output(&self, drv_path: &StorePath, output: &str) -> Result<StorePath, StoreError>;

    /// The reachability closure of `path` (spec §6 `computeFSClosure`).
    fn compute_fs_closure(&self, path: &StorePath) -> Result<Vec<StorePath>, StoreError>;
}

/// A `Store` that knows nothing and fails every operation. Used as the
/// default when an embedder runs the core purely for in-memory expression
/// evaluation with no derivations or path coercion in play (e.g. unit
/// tests for §8's scenario table).
pub struct NullStore;

impl Store for NullStore {
    fn print_store_path(&self, path: &StorePath) -> String {
        path.0.to_string()
    }

    fn parse_store_path(&self, s: &str) -> Result<StorePath, StoreError> {
        Ok(StorePath(Rc::from(s)))
    }

    fn is_valid_path(&self, _path: &StorePath) -> bool {
        false
    }

    fn add_to_store_from_dump(
        &self,
        _accessor: SourceAccessorId,
        _path_within: &str,
        _name: &str,
        _algo: HashAlgorithm,
        _references: &[StorePath],
    ) -> Result<StorePath, StoreError> {
        Err(StoreError("NullStore cannot add paths".into()))
    }

    fn read_derivation_output(&self, _drv_path: &StorePath, _output: &str) -> Result<StorePath, StoreError> {
        Err(StoreError("NullStore has no derivations".into()))
    }

    fn compute_fs_closure(&self, _path: &StorePath) -> Result<Vec<StorePath>, StoreError> {
        Ok(Vec::new())
    }
}
