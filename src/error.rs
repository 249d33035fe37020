use std::fmt;

/// How a run of a source string went wrong. Diagnostics have already been
/// written to stderr by the time one of these surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for InterpretError {}
