//! Evaluator tracing / debugger hook (spec §4.2 debugger hook, §4.9
//! `trace-function-calls`, §6 `NIX_COUNT_CALLS`/`NIX_SHOW_STATS`).
//!
//! A trait-based hook rather than a `log`/`tracing` crate dependency,
//! grounded on `tracer.rs`'s `VmTracer` trait: zero-cost with
//! [`NoopTracer`], swappable for a recording or stderr-printing
//! implementation without touching the evaluator's call sites.

use crate::pos::PosIdx;

/// One observable evaluator event, passed to [`EvalTracer::on_event`].
#[derive(Debug, Clone)]
pub enum TraceEvent {
    FunctionCall { pos: PosIdx },
    FunctionReturn { pos: PosIdx },
    ThunkForced { pos: PosIdx },
    PrimOpCall { name: &'static str, pos: PosIdx },
    /// A `builtins.trace` call or similar user-visible diagnostic message.
    UserTrace { message: String },
}

pub trait EvalTracer {
    fn on_event(&mut self, event: &TraceEvent);

    /// Called before forcing an expression, when a debugger is attached
    /// (spec §4.2's "debugger hook interface"). The default implementation
    /// never pauses.
    fn debugger_hook(&mut self, _pos: PosIdx, _error: Option<&crate::error::ErrorValue>) {}
}

/// Does nothing; the default tracer for production evaluation.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl EvalTracer for NoopTracer {
    fn on_event(&mut self, _event: &TraceEvent) {}
}

/// Counts events by kind, backing `NIX_COUNT_CALLS`/`NIX_SHOW_STATS`
/// (spec §6).
#[derive(Debug, Default, Clone)]
pub struct EvalStats {
    pub function_calls: u64,
    pub thunks_forced: u64,
    pub primop_calls: u64,
}

#[derive(Debug, Default)]
pub struct StatsTracer {
    pub stats: EvalStats,
}

impl EvalTracer for StatsTracer {
    fn on_event(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::FunctionCall { .. } => self.stats.function_calls += 1,
            TraceEvent::ThunkForced { .. } => self.stats.thunks_forced += 1,
            TraceEvent::PrimOpCall { .. } => self.stats.primop_calls += 1,
            TraceEvent::FunctionReturn { .. } | TraceEvent::UserTrace { .. } => {}
        }
    }
}

/// Records every event in order; useful for tests asserting on call
/// shape, and for `builtins.trace` message capture (spec §4.8 category).
#[derive(Debug, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl EvalTracer for RecordingTracer {
    fn on_event(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}
