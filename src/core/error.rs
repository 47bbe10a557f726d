//! Error taxonomy for the three run phases.
//!
//! Each phase owns exactly one error kind: interpretation failures are
//! singular and terminal, validation failures accumulate into a batch, and
//! execution failures carry the position of the one instruction that failed.
//! Backend errors never escape raw; the phase that observes them wraps them.

use std::fmt;
use thiserror::Error;

/// Position of an invocation within its source flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourcePosition {
    /// Zero-based index in the flow.
    pub index: usize,
    /// Script line, when the front-end can attribute one.
    pub line: Option<usize>,
}

impl SourcePosition {
    pub fn at(index: usize) -> Self {
        Self { index, line: None }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "instruction {} (line {})", self.index + 1, line),
            None => write!(f, "instruction {}", self.index + 1),
        }
    }
}

/// Terminal failure while turning a script into a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretationError {
    pub position: Option<SourcePosition>,
    pub message: String,
}

impl InterpretationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            position: None,
            message: message.into(),
        }
    }

    pub fn at(position: SourcePosition, message: impl Into<String>) -> Self {
        Self {
            position: Some(position),
            message: message.into(),
        }
    }
}

impl fmt::Display for InterpretationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{}: {}", pos, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for InterpretationError {}

/// One precondition violation found by the validator. Never surfaced alone;
/// the validator collects every violation in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub position: Option<SourcePosition>,
    pub message: String,
}

impl ValidationError {
    pub fn at(position: SourcePosition, message: impl Into<String>) -> Self {
        Self {
            position: Some(position),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(pos) => write!(f, "{}: {}", pos, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Flavor of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// The instruction's effect failed.
    Failed,
    /// A wait budget elapsed before the effect completed.
    Timeout,
    /// The run's cancellation signal fired while the instruction was in flight.
    Cancelled,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure raised by exactly the instruction that broke the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub position: SourcePosition,
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.position, self.kind, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Position-free failure as produced inside an instruction; the executor
/// attaches the plan position before surfacing it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Failed,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ExecutionErrorKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn into_execution_error(self, position: SourcePosition) -> ExecutionError {
        ExecutionError {
            position,
            kind: self.kind,
            message: self.message,
        }
    }
}
