// symbols.rs — Versioned symbol-scope stack
//
// Symbols visible at a point of a program come from nested frames: program
// symbols, the parameters of each enclosing scope, and the symbol mapping
// of every nested program crossed on the way down. Recursive rewrites and
// lowering push a frame when they descend and pop it on the way back, so no
// shared symbol table is ever mutated in place.
//
// Preconditions: frames are popped in reverse push order.
// Postconditions: `lookup` resolves innermost-first.
// Failure modes: popping out of order returns `SymbolError`.
// Side effects: none.

use indexmap::IndexMap;
use thiserror::Error;

use crate::data::DType;
use crate::graph::Program;
use crate::id::{NodeId, StateId, TreeNodeId};
use crate::scope_index::ScopeIndex;
use crate::symbolic::Expr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOrigin {
    Program(String),
    Scope(NodeId),
    /// A scope of a schedule tree being resolved from script text.
    Tree(TreeNodeId),
    Nested(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub dtype: DType,
    /// Value in terms of the enclosing frame, for nested-program mappings.
    pub value: Option<Expr>,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: FrameOrigin,
    pub symbols: IndexMap<String, Binding>,
}

impl Frame {
    pub fn new(origin: FrameOrigin) -> Self {
        Frame {
            origin,
            symbols: IndexMap::new(),
        }
    }

    pub fn bind(mut self, name: &str, dtype: DType, value: Option<Expr>) -> Self {
        self.symbols.insert(name.to_string(), Binding { dtype, value });
        self
    }
}

/// Token returned by `push`, required by the matching `pop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameVersion(u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("symbol frame popped out of order (expected version {expected}, top is {found})")]
    OutOfOrder { expected: u64, found: u64 },
    #[error("symbol frame stack is empty")]
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolScope {
    frames: Vec<(FrameVersion, Frame)>,
    next_version: u64,
}

impl SymbolScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) -> FrameVersion {
        let version = FrameVersion(self.next_version);
        self.next_version += 1;
        self.frames.push((version, frame));
        version
    }

    pub fn pop(&mut self, version: FrameVersion) -> Result<Frame, SymbolError> {
        match self.frames.last() {
            None => Err(SymbolError::Empty),
            Some((top, _)) if *top != version => Err(SymbolError::OutOfOrder {
                expected: version.0,
                found: top.0,
            }),
            Some(_) => self
                .frames
                .pop()
                .map(|(_, frame)| frame)
                .ok_or(SymbolError::Empty),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames
            .iter()
            .rev()
            .find_map(|(_, f)| f.symbols.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Every visible symbol and its type, outermost first, inner frames
    /// shadowing outer ones.
    pub fn visible(&self) -> IndexMap<String, DType> {
        let mut out = IndexMap::new();
        for (_, frame) in &self.frames {
            for (name, b) in &frame.symbols {
                out.insert(name.clone(), b.dtype);
            }
        }
        out
    }

    /// Symbols visible at `node` of `state`: program symbols plus the
    /// parameters of every enclosing scope.
    pub fn defined_at(program: &Program, state: StateId, node: NodeId) -> SymbolScope {
        let mut scope = SymbolScope::new();
        let mut top = Frame::new(FrameOrigin::Program(program.name.clone()));
        for (name, dtype) in &program.symbols {
            top = top.bind(name, *dtype, None);
        }
        scope.push(top);

        let Some(st) = program.state(state) else {
            return scope;
        };
        let index = ScopeIndex::build(st);
        let mut chain = Vec::new();
        let mut cur = index.scope_of(node);
        while let Some(entry) = cur {
            chain.push(entry);
            cur = index.scope_of(entry);
        }
        for entry in chain.into_iter().rev() {
            let Some(info) = st.node(entry).and_then(|n| n.scope_info()) else {
                continue;
            };
            let mut frame = Frame::new(FrameOrigin::Scope(entry));
            for p in info.params() {
                frame = frame.bind(&p, DType::Int64, None);
            }
            scope.push(frame);
        }
        scope
    }
}
