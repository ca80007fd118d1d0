// dfc — Dataflow Compiler
//
// Library root. A program is a graph of states holding parallel dataflow
// multigraphs; transformations rewrite it in place, and lowering turns it
// into a schedule tree that can be re-emitted as a script.

pub mod ast;
pub mod codegen;
pub mod control_flow;
pub mod data;
pub mod diag;
pub mod dot;
pub mod graph;
pub mod id;
pub mod lexer;
pub mod lower;
pub mod map_fission;
pub mod memlet;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod program_query;
pub mod propagate;
pub mod registry;
pub mod resolve;
pub mod schedule;
pub mod scope_index;
pub mod subset;
pub mod symbolic;
pub mod symbols;
pub mod transformation;
pub mod validate;
pub mod visit;
