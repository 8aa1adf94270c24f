//! Evaluator-level configuration surface (spec §4.9).
//!
//! A plain options struct the host populates before creating an
//! [`crate::eval::EvalState`], grounded on `resource.rs`'s
//! `ResourceLimits`/`ResourceTracker` split: the core defines the shape,
//! the embedder decides the values (and, for config-file parsing, owns
//! that I/O entirely — the core never reads a config file itself).

/// Default `max-call-depth` (spec §4.9).
pub const DEFAULT_MAX_CALL_DEPTH: usize = 10_000;

#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// Disables impure constants; restricts filesystem/network access to
    /// hash-addressed content.
    pub pure_eval: bool,
    /// Denies filesystem access outside `nix_path` and URI access outside
    /// `allowed_uris`.
    pub restrict_eval: bool,
    /// Permits `import`-ing a path that requires building a derivation.
    pub allow_import_from_derivation: bool,
    /// Allowed URI prefixes when `restrict_eval` is set.
    pub allowed_uris: Vec<String>,
    /// Enables the persistent evaluation cache (spec §4.7).
    pub eval_cache: bool,
    /// Emits a trace event through the `EvalTracer` on every call.
    pub trace_function_calls: bool,
    pub max_call_depth: usize,
    /// Skips the debugger hook while inside `builtins.tryEval`.
    pub ignore_try: bool,
    pub nix_path: Vec<(String, String)>,
    pub eval_system: String,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            pure_eval: false,
            restrict_eval: false,
            allow_import_from_derivation: true,
            allowed_uris: Vec::new(),
            eval_cache: false,
            trace_function_calls: false,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            ignore_try: false,
            nix_path: Vec::new(),
            eval_system: "x86_64-linux".to_string(),
        }
    }
}

impl EvalConfig {
    /// Reads the subset of the environment-variable interface named in
    /// spec §6 that affects this struct (`NIX_PATH`). The remaining
    /// variables (`NIX_COUNT_CALLS`, `NIX_SHOW_STATS*`, `NIX_SHOW_SYMBOLS`,
    /// `NIX_ABORT_ON_WARN`) drive the tracer/stats surface instead (see
    /// [`crate::tracer`]) and are read by the host when it builds one.
    #[must_use]
    pub fn with_nix_path_env(mut self) -> Self {
        if let Ok(raw) = std::env::var("NIX_PATH") {
            self.nix_path = raw
                .split(':')
                .filter_map(|entry| entry.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
        self
    }
}
