//! Error types for the frontend and the analysis.
//!
//! Analysis errors are fatal by design: they indicate either a malformed SSA
//! program or a value the symbolic store lost track of, and in both cases the
//! extracted MiGo would be meaningless.  Non-fatal conditions (unsupported
//! builtins, missing interface methods) are logged and never reach this type.

use std::fmt;
use std::io;

/// Fatal conditions aborting the analysis.
#[derive(Debug)]
pub enum AnalysisError {
    /// Read of an SSA value with no binding in the frame, the globals, or the
    /// phi candidates.
    UnknownValue { instr: String, value: String },
    /// `Extract` on a tuple-producing instance whose tuple was never sized.
    UninitializedTuple { instr: String, value: String },
    /// An `If` whose block does not have exactly two successors.
    InvalidIfSucc { func: String, block: usize },
    /// A `Jump` whose block does not have exactly one successor.
    InvalidJumpSucc { func: String, block: usize },
    /// Reading through a value that is not an aggregate of the expected shape.
    InvalidVarRead { instr: String, value: String },
    /// Dynamic dispatch found the interface satisfied but no concrete method
    /// body; the program is not well-formed.
    AbstractMethod { method: String },
    /// Type assertion against an interface the value does not implement.
    MethodNotFound { method: String, value: String },
    /// `MakeChan` whose result is not channel-typed.
    MakeChanNonChan { value: String },
    /// `MakeChan` whose buffer size operand is not a constant.
    NonConstChanBuf { value: String },
    /// Unbalanced pop of the if/select statement stack.
    StackMismatch { context: &'static str },
    /// No `main` function in the main package.
    NoMainFunction,
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnalysisError::UnknownValue { instr, value } => {
                write!(f, "{}: unknown value: {}", instr, value)
            }
            AnalysisError::UninitializedTuple { instr, value } => {
                write!(f, "{}: unexpected tuple: {}", instr, value)
            }
            AnalysisError::InvalidIfSucc { func, block } => {
                write!(f, "{}: block {}: if does not have 2 successors", func, block)
            }
            AnalysisError::InvalidJumpSucc { func, block } => {
                write!(f, "{}: block {}: jump does not have 1 successor", func, block)
            }
            AnalysisError::InvalidVarRead { instr, value } => {
                write!(f, "{}: invalid variable read: {}", instr, value)
            }
            AnalysisError::AbstractMethod { method } => {
                write!(f, "cannot call {}: method is abstract (program not well-formed)", method)
            }
            AnalysisError::MethodNotFound { method, value } => {
                write!(f, "typeassert: method {} not found on {}", method, value)
            }
            AnalysisError::MakeChanNonChan { value } => {
                write!(f, "makechan: {} is not a channel", value)
            }
            AnalysisError::NonConstChanBuf { value } => {
                write!(f, "makechan: buffer size {} is not a constant", value)
            }
            AnalysisError::StackMismatch { context } => {
                write!(f, "{}: statement stack mismatch", context)
            }
            AnalysisError::NoMainFunction => {
                write!(f, "'main()' function not found in 'main' package")
            }
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Errors surfaced while reading and parsing the SSA source files.
#[derive(Debug)]
pub enum BuildError {
    Io { path: String, err: io::Error },
    Parse { file: String, line: u32, msg: String },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::Io { path, err } => write!(f, "{}: {}", path, err),
            BuildError::Parse { file, line, msg } => write!(f, "{}:{}: {}", file, line, msg),
        }
    }
}

impl std::error::Error for BuildError {}
