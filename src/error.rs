//! Error taxonomy and trace-frame machinery (spec §7).
//!
//! Every failure carries a primary position plus a stack of trace frames
//! added at natural boundaries (call site, attribute selection, `with`
//! body, ...). Modelled as a hand-written enum with manual `Display`
//! rather than `thiserror`, matching `exception_private.rs`'s `ExcType` /
//! `RunError` shape: a closed, `strum`-driven kind plus a free-form
//! message and position.

use std::fmt;

use strum::{Display as StrumDisplay, EnumString, IntoStaticStr};

use crate::pos::PosIdx;
use crate::symbol::Symbol;

/// The closed set of error kinds the evaluator can raise (spec §7). Named
/// by effect, not by the Rust type that carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString, IntoStaticStr)]
pub enum ErrorKind {
    ParseError,
    EvalError,
    TypeError,
    AssertionError,
    ThrownError,
    Abort,
    UndefinedVariable,
    MissingArgument,
    InfiniteRecursion,
    CachedEvalError,
    RestrictedPath,
}

/// One frame of the trace stack: a position plus a lazily-formatted hint
/// (e.g. "while evaluating the attribute 'foo'"), mirroring `eval-error.hh`'s
/// `AddTrace`/`HintFmt` pattern — a frame is cheap to push even when the
/// error is never shown to a user.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub pos: PosIdx,
    pub hint: String,
}

/// A structured, element-wise or attribute-wise diff produced by
/// `assertEqValues` when an `assert a == b;` fails (spec §4.2).
#[derive(Debug, Clone)]
pub enum EqDiff {
    /// The two values have different runtime types.
    TypeMismatch { lhs_type: &'static str, rhs_type: &'static str },
    Scalar { lhs: String, rhs: String },
    ListLengthMismatch { lhs_len: usize, rhs_len: usize },
    ListElement { index: usize, inner: Box<EqDiff> },
    AttrsKeysDiffer { only_in_lhs: Vec<Symbol>, only_in_rhs: Vec<Symbol> },
    AttrValue { name: Symbol, inner: Box<EqDiff> },
}

/// A raised evaluator error: kind, primary position, message, and the
/// trace-frame stack accumulated as the error propagated outward.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub pos: PosIdx,
    pub message: String,
    pub trace: Vec<TraceFrame>,
    /// Present only for `AssertionError` raised by an equality assertion.
    pub eq_diff: Option<EqDiff>,
}

impl ErrorValue {
    #[must_use]
    pub fn new(kind: ErrorKind, pos: PosIdx, message: impl Into<String>) -> Self {
        Self { kind, pos, message: message.into(), trace: Vec::new(), eq_diff: None }
    }

    #[must_use]
    pub fn type_error(pos: PosIdx, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, pos, message)
    }

    #[must_use]
    pub fn eval_error(pos: PosIdx, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EvalError, pos, message)
    }

    #[must_use]
    pub fn undefined_variable(pos: PosIdx, name: &str) -> Self {
        Self::new(ErrorKind::UndefinedVariable, pos, format!("undefined variable '{name}'"))
    }

    #[must_use]
    pub fn infinite_recursion(pos: PosIdx) -> Self {
        Self::new(ErrorKind::InfiniteRecursion, pos, "infinite recursion encountered")
    }

    #[must_use]
    pub fn missing_argument(pos: PosIdx, name: &str) -> Self {
        Self::new(ErrorKind::MissingArgument, pos, format!("function called without required argument '{name}'"))
    }

    /// Adds a trace frame describing the evaluation context this error
    /// propagated through; called at each natural boundary (spec §7).
    #[must_use]
    pub fn with_frame(mut self, pos: PosIdx, hint: impl Into<String>) -> Self {
        self.trace.push(TraceFrame { pos, hint: hint.into() });
        self
    }

    /// Attaches the structured diff produced by `assertEqValues` for an
    /// `assert a == b;` failure (spec §4.2, §4.4).
    #[must_use]
    pub fn with_eq_diff(mut self, diff: EqDiff) -> Self {
        self.eq_diff = Some(diff);
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorValue {}

pub type EvalResult<T> = Result<T, ErrorValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_frames_accumulate_outward() {
        let e = ErrorValue::eval_error(PosIdx::NONE, "boom").with_frame(PosIdx::NONE, "while evaluating X").with_frame(
            PosIdx::NONE,
            "while calling Y",
        );
        assert_eq!(e.trace.len(), 2);
        assert_eq!(e.trace[0].hint, "while evaluating X");
    }
}
