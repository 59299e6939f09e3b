// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Error types for the compiler backend

use std::fmt;

use thiserror::Error;

use crate::ast::Location;

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors that abort a compilation.
///
/// No partially built code object is ever returned alongside one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A problem in the program being compiled
    #[error("SyntaxError: {message} ({})", SourceSpan(.filename, .location))]
    Syntax {
        /// What went wrong
        message: String,
        /// File being compiled
        filename: String,
        /// Offending source range
        location: Location,
    },

    /// A warning escalated by `warnings_as_errors`
    #[error("SyntaxWarning: {message} ({})", SourceSpan(.filename, .location))]
    Warning {
        /// The warning text
        message: String,
        /// File being compiled
        filename: String,
        /// Offending source range
        location: Location,
    },

    /// An invariant of the compiler itself was violated
    #[error("internal compiler error: {0}")]
    Internal(String),

    /// A hard resource limit was exceeded
    #[error("OverflowError: {0}")]
    Overflow(String),
}

impl CompileError {
    /// Creates an internal-invariant error.
    pub fn internal(message: impl Into<String>) -> Self {
        CompileError::Internal(message.into())
    }

    /// Creates a resource-limit error.
    pub fn overflow(message: impl Into<String>) -> Self {
        CompileError::Overflow(message.into())
    }

    /// Creates a source error.
    pub fn syntax(
        message: impl Into<String>,
        filename: impl Into<String>,
        location: Location,
    ) -> Self {
        CompileError::Syntax {
            message: message.into(),
            filename: filename.into(),
            location,
        }
    }

    /// The source location, for source errors and escalated warnings.
    pub fn location(&self) -> Option<Location> {
        match self {
            CompileError::Syntax { location, .. } | CompileError::Warning { location, .. } => {
                Some(*location)
            }
            _ => None,
        }
    }

    /// Whether this error points at the compiled program rather than the compiler.
    pub fn is_source_error(&self) -> bool {
        matches!(self, CompileError::Syntax { .. } | CompileError::Warning { .. })
    }
}

struct SourceSpan<'a>(&'a String, &'a Location);

impl fmt::Display for SourceSpan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let SourceSpan(filename, loc) = self;
        write!(f, "{}, line {}", filename, loc.line)?;
        if loc.col >= 0 {
            write!(f, ", column {}", loc.col + 1)?;
        }
        Ok(())
    }
}

/// A non-fatal diagnostic collected during compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileWarning {
    /// The warning text
    pub message: String,
    /// File being compiled
    pub filename: String,
    /// Offending source range
    pub location: Location,
}

impl CompileWarning {
    /// Converts the warning into the error raised under `warnings_as_errors`.
    pub fn into_error(self) -> CompileError {
        CompileError::Warning {
            message: self.message,
            filename: self.filename,
            location: self.location,
        }
    }
}

impl fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: SyntaxWarning: {}",
            self.filename, self.location.line, self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_display() {
        let err = CompileError::syntax("'break' outside loop", "demo.py", Location::new(3, 4, 3, 9));
        assert_eq!(
            err.to_string(),
            "SyntaxError: 'break' outside loop (demo.py, line 3, column 5)"
        );
        assert!(err.is_source_error());
        assert_eq!(err.location().map(|l| l.line), Some(3));
    }

    #[test]
    fn test_internal_and_overflow() {
        assert_eq!(
            CompileError::internal("bad graph").to_string(),
            "internal compiler error: bad graph"
        );
        assert!(!CompileError::overflow("too many constants").is_source_error());
    }

    #[test]
    fn test_warning_escalation() {
        let warning = CompileWarning {
            message: "\"is\" with a literal. Did you mean \"==\"?".into(),
            filename: "m.py".into(),
            location: Location::new(1, 0, 1, 6),
        };
        assert_eq!(warning.to_string(), "m.py:1: SyntaxWarning: \"is\" with a literal. Did you mean \"==\"?");
        assert!(matches!(warning.into_error(), CompileError::Warning { .. }));
    }
}
