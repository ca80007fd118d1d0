// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used by graph validation, library
// operator checks, schedule tree verification and script parsing/resolution.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;
use crate::id::{NodeId, StateId, TreeNodeId};

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`, `W0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable diagnostic codes, grouped by phase.
pub mod codes {
    use super::DiagCode;

    // E00xx: script syntax and resolution
    pub const E0001: DiagCode = DiagCode("E0001"); // syntax error
    pub const E0002: DiagCode = DiagCode("E0002"); // undeclared container
    pub const E0003: DiagCode = DiagCode("E0003"); // undeclared symbol
    pub const E0004: DiagCode = DiagCode("E0004"); // duplicate declaration
    pub const E0005: DiagCode = DiagCode("E0005"); // malformed scope header
    pub const E0006: DiagCode = DiagCode("E0006"); // unknown element type

    // E01xx: graph validation
    pub const E0100: DiagCode = DiagCode("E0100"); // access to undeclared container
    pub const E0101: DiagCode = DiagCode("E0101"); // memlet container undeclared
    pub const E0102: DiagCode = DiagCode("E0102"); // subset rank mismatch
    pub const E0103: DiagCode = DiagCode("E0103"); // subset out of bounds
    pub const E0104: DiagCode = DiagCode("E0104"); // unmatched scope entry/exit
    pub const E0105: DiagCode = DiagCode("E0105"); // edge bypasses scope boundary
    pub const E0106: DiagCode = DiagCode("E0106"); // library connector mismatch
    pub const E0107: DiagCode = DiagCode("E0107"); // cyclic state

    // E02xx: library operators
    pub const E0200: DiagCode = DiagCode("E0200"); // unknown operator
    pub const E0201: DiagCode = DiagCode("E0201"); // operator shape mismatch

    // E06xx: stage certificates
    pub const E0600: DiagCode = DiagCode("E0600"); // graph certificate failed
    pub const E0601: DiagCode = DiagCode("E0601"); // tree certificate failed
    pub const E0602: DiagCode = DiagCode("E0602"); // transformation aborted
    pub const E0603: DiagCode = DiagCode("E0603"); // unknown transformation

    // W0xxx: warnings
    pub const W0001: DiagCode = DiagCode("W0001"); // unused container declaration
    pub const W0002: DiagCode = DiagCode("W0002"); // control flow lowered as general block
    pub const W0003: DiagCode = DiagCode("W0003"); // rewrite bound reached
    pub const W0004: DiagCode = DiagCode("W0004"); // symbol mapping names an unknown symbol
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Location ─────────────────────────────────────────────────────────────

/// Where a diagnostic points: script text, a graph element, or a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Source(Span),
    Graph {
        state: Option<StateId>,
        node: Option<NodeId>,
    },
    Tree(TreeNodeId),
    Program,
}

impl Location {
    pub fn state(state: StateId) -> Self {
        Location::Graph {
            state: Some(state),
            node: None,
        }
    }

    pub fn node(state: StateId, node: NodeId) -> Self {
        Location::Graph {
            state: Some(state),
            node: Some(node),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Source(span) => write!(f, "{}..{}", span.start, span.end),
            Location::Graph {
                state: Some(s),
                node: Some(n),
            } => write!(f, "{s}/{n}"),
            Location::Graph { state: Some(s), .. } => write!(f, "{s}"),
            Location::Graph { .. } | Location::Program => write!(f, "program"),
            Location::Tree(id) => write!(f, "tree#{}", id.0),
        }
    }
}

// ── Related location ─────────────────────────────────────────────────────

/// A secondary location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct Related {
    pub at: Location,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a failed check.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub at: Option<Location>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub at: Location,
    pub message: String,
    pub hint: Option<String>,
    pub related: Vec<Related>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related locations, or causes.
    pub fn new(level: DiagLevel, at: Location, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            at,
            message: message.into(),
            hint: None,
            related: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    pub fn error(at: Location, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, at, message)
    }

    pub fn warning(at: Location, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, at, message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, at: Location, label: impl Into<String>) -> Self {
        self.related.push(Related {
            at,
            label: label.into(),
        });
        self
    }

    pub fn with_cause(mut self, message: impl Into<String>, at: Option<Location>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            at,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::error(Location::Program, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code() {
        let d = Diagnostic::warning(Location::Program, "unused container")
            .with_code(codes::W0001);
        assert_eq!(format!("{d}"), "warning[W0001]: unused container");
    }

    #[test]
    fn builder_chain() {
        let at = Location::node(StateId(0), NodeId(3));
        let d = Diagnostic::error(at, "subset out of bounds")
            .with_code(codes::E0103)
            .with_hint("shrink the subset or grow the container")
            .with_related(Location::state(StateId(0)), "container accessed here")
            .with_cause("dimension 0 ends at 10, shape is 5", None);

        assert_eq!(d.code, Some(codes::E0103));
        assert_eq!(d.hint.as_deref(), Some("shrink the subset or grow the container"));
        assert_eq!(d.related.len(), 1);
        assert_eq!(d.cause_chain.len(), 1);
        assert_eq!(d.at.to_string(), "s0/n3");
    }

    #[test]
    fn has_errors_ignores_warnings() {
        let w = Diagnostic::warning(Location::Program, "w");
        assert!(!has_errors(std::slice::from_ref(&w)));
        let e = Diagnostic::error(Location::Program, "e");
        assert!(has_errors(&[w, e]));
    }
}
