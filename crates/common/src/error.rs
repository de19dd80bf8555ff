use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical Quiver error taxonomy used across crates.
///
/// Classification guidance:
/// - [`QvError::Compile`]: query shape/name/type issues reachable from user input
/// - [`QvError::InvalidConfig`]: catalog/config contract violations
/// - [`QvError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
///
/// Internal invariant violations (duplicate DAG node ids, edges between
/// missing nodes, cycles where acyclicity is required) are programming errors
/// in the rule library itself and abort via `panic!` rather than surfacing
/// here.
#[derive(Debug, Error)]
pub enum QvError {
    /// User-visible compilation failures, carrying every accumulated
    /// position-annotated message.
    ///
    /// Examples:
    /// - unknown table/column/function signature
    /// - mismatched relations across a union
    /// - a groupby not followed by an aggregate
    #[error("compile error: {0}")]
    Compile(ErrorGroup),

    /// Invalid or inconsistent configuration/catalog state.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a feature/shape not implemented in current version.
    ///
    /// Also used when a fixed-point rule batch exceeds its iteration budget.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard Quiver result alias.
pub type Result<T> = std::result::Result<T, QvError>;

/// Source position attached to IR nodes and compile errors.
///
/// Line and column are 1-based; `UNKNOWN` is used for nodes synthesized by
/// rewrite rules with no user-facing origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub line: u64,
    pub column: u64,
}

impl SourceSpan {
    pub const UNKNOWN: SourceSpan = SourceSpan { line: 0, column: 0 };

    pub fn new(line: u64, column: u64) -> Self {
        Self { line, column }
    }
}

/// One positioned compile-error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileError {
    pub line: u64,
    pub column: u64,
    pub message: String,
}

impl CompileError {
    pub fn at(span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Ordered group of compile errors.
///
/// Independent sub-compilations each produce their own group; groups merge
/// without losing individual positions, and the merged display is every
/// message newline-joined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub errors: Vec<CompileError>,
}

impl ErrorGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(err: CompileError) -> Self {
        Self { errors: vec![err] }
    }

    pub fn push(&mut self, err: CompileError) {
        self.errors.push(err);
    }

    /// Append every error of `other`, preserving order.
    pub fn merge(&mut self, other: ErrorGroup) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for ErrorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        write!(f, "{joined}")
    }
}

/// Shorthand for the common single-message compile failure.
pub fn compile_err<T>(span: SourceSpan, message: impl Into<String>) -> Result<T> {
    Err(QvError::Compile(ErrorGroup::single(CompileError::at(
        span, message,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_positions_and_order() {
        let mut a = ErrorGroup::single(CompileError::at(SourceSpan::new(1, 2), "first"));
        let b = ErrorGroup::single(CompileError::at(SourceSpan::new(3, 4), "second"));
        a.merge(b);
        assert_eq!(a.errors.len(), 2);
        assert_eq!(a.errors[0].line, 1);
        assert_eq!(a.errors[1].column, 4);
        assert_eq!(a.to_string(), "1:2: first\n3:4: second");
    }

    #[test]
    fn compile_error_display_includes_position() {
        let e = CompileError::at(SourceSpan::new(7, 12), "Table 'cpu' not found.");
        assert_eq!(e.to_string(), "7:12: Table 'cpu' not found.");
    }
}
