// control_flow.rs — Structured control flow recovery
//
// Recovers structured regions from the state graph of a program: sequences
// of states, if/elif/else diamonds, guarded `for` and `while` loops, and
// `do-while` loops closed by a conditional latch. Whatever cannot be
// expressed that way makes the whole program `ControlFlow::General`, which
// lowering renders as labels, conditional gotos and assignments.
//
// Preconditions: transition targets name existing states.
// Postconditions: every reachable state appears exactly once in the result.
// Failure modes: none; unrecognised shapes fall back to `General`.
// Side effects: none.

use std::collections::{HashSet, VecDeque};

use indexmap::IndexMap;
use tracing::debug;

use crate::graph::{Program, Transition};
use crate::id::StateId;

// ── Regions ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    /// `None` for the final `else`.
    pub condition: Option<String>,
    pub body: Vec<ControlFlow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlFlow {
    Block(StateId),
    /// Unconditional symbol updates between two states.
    Assign(IndexMap<String, String>),
    Sequence(Vec<ControlFlow>),
    If(Vec<Branch>),
    For {
        var: String,
        init: String,
        condition: String,
        update: String,
        body: Vec<ControlFlow>,
    },
    While {
        condition: String,
        body: Vec<ControlFlow>,
    },
    DoWhile {
        condition: String,
        body: Vec<ControlFlow>,
    },
    /// Unstructured: every state in discovery order.
    General(Vec<StateId>),
}

#[derive(Debug)]
struct Unstructured;

// ── Entry points ────────────────────────────────────────────────────────────

/// Recover the control-flow structure of `program`.
pub fn structure(program: &Program) -> ControlFlow {
    if program.states.is_empty() {
        return ControlFlow::Sequence(Vec::new());
    }
    let mut s = Structurer::new(program);
    match s.seq(Some(program.start), None, None, IndexMap::new()) {
        Ok((mut items, tail)) => {
            if !tail.is_empty() {
                items.push(ControlFlow::Assign(tail));
            }
            if s.seen.len() == reachable(program).len() {
                return ControlFlow::Sequence(items);
            }
            debug!(program = %program.name, "control flow revisits states, lowering as general block");
            ControlFlow::General(discovery_order(program))
        }
        Err(Unstructured) => {
            debug!(program = %program.name, "irreducible control flow, lowering as general block");
            ControlFlow::General(discovery_order(program))
        }
    }
}

/// A chain of states joined by unconditional, assignment-free transitions.
pub fn is_sequential(program: &Program) -> bool {
    if program.states.is_empty() {
        return true;
    }
    let mut seen = HashSet::new();
    let mut cur = Some(program.start);
    while let Some(s) = cur {
        if !seen.insert(s) {
            return false;
        }
        let outs = program.out_transitions(s);
        cur = match outs.as_slice() {
            [] => None,
            [t] if t.is_unconditional() && t.assignments.is_empty() => Some(t.dst),
            _ => return false,
        };
    }
    seen.len() == program.states.len()
}

/// Whether `b` is the textual negation of `a`.
pub fn is_negation(a: &str, b: &str) -> bool {
    let strip = |s: &str| {
        let s = s.trim();
        s.strip_prefix("not ")
            .map(|r| r.trim().trim_start_matches('(').trim_end_matches(')').trim().to_string())
    };
    let bare = |s: &str| s.trim().trim_start_matches('(').trim_end_matches(')').trim().to_string();
    strip(b).is_some_and(|x| x == bare(a)) || strip(a).is_some_and(|x| x == bare(b))
}

fn reachable(program: &Program) -> HashSet<StateId> {
    discovery_order(program).into_iter().collect()
}

/// Breadth-first order from the start state.
fn discovery_order(program: &Program) -> Vec<StateId> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([program.start]);
    while let Some(s) = queue.pop_front() {
        if program.state(s).is_none() || !seen.insert(s) {
            continue;
        }
        order.push(s);
        for t in program.out_transitions(s) {
            queue.push_back(t.dst);
        }
    }
    order
}

// ── Structurer ──────────────────────────────────────────────────────────────

struct Structurer<'a> {
    program: &'a Program,
    back_edges: HashSet<(StateId, StateId)>,
    headers: HashSet<StateId>,
    active: HashSet<StateId>,
    seen: HashSet<StateId>,
    steps: usize,
}

type Assignments = IndexMap<String, String>;
type Parsed = (Vec<ControlFlow>, Assignments);

impl<'a> Structurer<'a> {
    fn new(program: &'a Program) -> Self {
        let back_edges = find_back_edges(program);
        let headers = back_edges.iter().map(|&(_, h)| h).collect();
        Structurer {
            program,
            back_edges,
            headers,
            active: HashSet::new(),
            seen: HashSet::new(),
            steps: 0,
        }
    }

    /// Parse a chain from `start` up to (not including) `stop`, or through
    /// `latch` inclusive. Returns the items and the assignments of the
    /// transition that reached `stop`.
    fn seq(
        &mut self,
        start: Option<StateId>,
        stop: Option<StateId>,
        latch: Option<StateId>,
        mut pending: Assignments,
    ) -> Result<Parsed, Unstructured> {
        let mut items = Vec::new();
        let mut cur = start;
        while let Some(s) = cur {
            if Some(s) == stop {
                return Ok((items, pending));
            }
            self.steps += 1;
            if self.steps > 4 * self.program.states.len() + 16 {
                return Err(Unstructured);
            }
            if self.headers.contains(&s) && !self.active.contains(&s) {
                let (loop_items, next, next_pending) = self.loop_at(s, pending)?;
                items.extend(loop_items);
                pending = next_pending;
                cur = next;
                continue;
            }
            flush(&mut items, &mut pending);
            if !self.seen.insert(s) {
                return Err(Unstructured);
            }
            items.push(ControlFlow::Block(s));
            if Some(s) == latch {
                return Ok((items, Assignments::new()));
            }
            let program = self.program;
            let outs = program.out_transitions(s);
            match outs.as_slice() {
                [] => cur = None,
                [t] if t.is_unconditional() => {
                    pending = t.assignments.clone();
                    cur = Some(t.dst);
                }
                many if many.len() >= 2 && many.iter().all(|t| !t.is_unconditional()) => {
                    let (branch, merge) = self.branch(s, &outs, stop)?;
                    items.push(branch);
                    cur = merge;
                }
                _ => return Err(Unstructured),
            }
        }
        if stop.is_some() || latch.is_some() {
            return Err(Unstructured);
        }
        Ok((items, pending))
    }

    fn branch(
        &mut self,
        from: StateId,
        outs: &[&Transition],
        stop: Option<StateId>,
    ) -> Result<(ControlFlow, Option<StateId>), Unstructured> {
        if outs.iter().any(|t| self.back_edges.contains(&(t.src, t.dst))) {
            return Err(Unstructured);
        }
        let targets: Vec<StateId> = outs.iter().map(|t| t.dst).collect();
        let merge = self.merge_point(from, &targets, stop);

        let mut branches = Vec::new();
        for t in outs {
            let mut body = if Some(t.dst) == merge {
                let mut b = Vec::new();
                let mut a = t.assignments.clone();
                flush(&mut b, &mut a);
                b
            } else {
                let (mut b, tail) = self.seq(Some(t.dst), merge, None, t.assignments.clone())?;
                let mut tail = tail;
                flush(&mut b, &mut tail);
                b
            };
            body.shrink_to_fit();
            branches.push(Branch {
                condition: Some(t.condition.clone()),
                body,
            });
        }
        if branches.len() == 2 {
            let first = branches[0].condition.clone().unwrap_or_default();
            let second = branches[1].condition.clone().unwrap_or_default();
            if is_negation(&first, &second) {
                branches[1].condition = None;
                if branches[1].body.is_empty() {
                    branches.pop();
                }
            }
        }
        Ok((ControlFlow::If(branches), merge))
    }

    /// First state, in breadth-first order from the first target, that is
    /// reachable from every target without passing through `from`.
    fn merge_point(
        &self,
        from: StateId,
        targets: &[StateId],
        stop: Option<StateId>,
    ) -> Option<StateId> {
        let sets: Vec<Vec<StateId>> = targets
            .iter()
            .map(|&t| self.forward(t, from, stop))
            .collect();
        let first = sets.first()?;
        first
            .iter()
            .copied()
            .find(|s| sets[1..].iter().all(|other| other.contains(s)))
    }

    fn forward(&self, start: StateId, avoid: StateId, stop: Option<StateId>) -> Vec<StateId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(s) = queue.pop_front() {
            if s == avoid || !seen.insert(s) {
                continue;
            }
            order.push(s);
            if Some(s) == stop {
                continue;
            }
            for t in self.program.out_transitions(s) {
                queue.push_back(t.dst);
            }
        }
        order
    }

    /// Whether `target` is reachable from `from`.
    fn reaches(&self, from: StateId, target: StateId) -> bool {
        from == target
            || self
                .forward(from, target, None)
                .iter()
                .any(|&s| self.program.out_transitions(s).iter().any(|t| t.dst == target))
    }

    fn loop_at(
        &mut self,
        header: StateId,
        mut pending: Assignments,
    ) -> Result<(Vec<ControlFlow>, Option<StateId>, Assignments), Unstructured> {
        let program = self.program;
        let outs = program.out_transitions(header);
        let back: Vec<&Transition> = program
            .in_transitions(header)
            .into_iter()
            .filter(|t| self.back_edges.contains(&(t.src, t.dst)))
            .collect();
        let empty_guard = program.state(header).is_some_and(|s| s.is_empty());

        // Guarded loop: empty guard, two conditional exits, unconditional back edges.
        if empty_guard
            && outs.len() == 2
            && outs.iter().all(|t| !t.is_unconditional())
            && back.iter().all(|t| t.is_unconditional())
        {
            let (body_edge, exit_edge) = if self.reaches(outs[0].dst, header) {
                (outs[0], outs[1])
            } else {
                (outs[1], outs[0])
            };
            self.seen.insert(header);
            self.active.insert(header);
            let parsed = self.seq(Some(body_edge.dst), Some(header), None, body_edge.assignments.clone());
            self.active.remove(&header);
            let (mut body, update) = parsed?;

            let mut items = Vec::new();
            let loop_var = match update.keys().collect::<Vec<_>>().as_slice() {
                [v] if pending.contains_key(*v) => Some((*v).clone()),
                _ => None,
            };
            match loop_var {
                Some(var) => {
                    let init = pending.shift_remove(&var).unwrap_or_default();
                    flush(&mut items, &mut pending);
                    let step = update.get(&var).cloned().unwrap_or_default();
                    items.push(ControlFlow::For {
                        var,
                        init,
                        condition: body_edge.condition.clone(),
                        update: step,
                        body,
                    });
                }
                None => {
                    flush(&mut items, &mut pending);
                    let mut update = update;
                    flush(&mut body, &mut update);
                    items.push(ControlFlow::While {
                        condition: body_edge.condition.clone(),
                        body,
                    });
                }
            }
            return Ok((items, Some(exit_edge.dst), exit_edge.assignments.clone()));
        }

        // Do-while: a conditional latch closes the loop.
        if let [latch_edge] = back.as_slice() {
            let latch = latch_edge.src;
            let latch_outs = program.out_transitions(latch);
            if !latch_edge.is_unconditional()
                && latch_edge.assignments.is_empty()
                && latch_outs.len() == 2
                && latch_outs.iter().all(|t| !t.is_unconditional())
            {
                let Some(exit) = latch_outs.iter().find(|t| t.dst != header) else {
                    return Err(Unstructured);
                };
                let mut items = Vec::new();
                flush(&mut items, &mut pending);
                self.active.insert(header);
                let parsed = self.seq(Some(header), None, Some(latch), Assignments::new());
                self.active.remove(&header);
                let (body, _) = parsed?;
                items.push(ControlFlow::DoWhile {
                    condition: latch_edge.condition.clone(),
                    body,
                });
                return Ok((items, Some(exit.dst), exit.assignments.clone()));
            }
        }
        Err(Unstructured)
    }
}

fn flush(items: &mut Vec<ControlFlow>, pending: &mut Assignments) {
    if !pending.is_empty() {
        items.push(ControlFlow::Assign(std::mem::take(pending)));
    }
}

/// Transitions closing a cycle in a depth-first walk from the start state.
fn find_back_edges(program: &Program) -> HashSet<(StateId, StateId)> {
    let mut back = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut done = HashSet::new();
    // Iterative DFS: (state, next transition index).
    let mut stack: Vec<(StateId, usize)> = vec![(program.start, 0)];
    on_stack.insert(program.start);
    while let Some((s, i)) = stack.pop() {
        let outs = program.out_transitions(s);
        if i < outs.len() {
            stack.push((s, i + 1));
            let d = outs[i].dst;
            if on_stack.contains(&d) {
                back.insert((s, d));
            } else if !done.contains(&d) && program.state(d).is_some() {
                on_stack.insert(d);
                stack.push((d, 0));
            }
        } else {
            on_stack.remove(&s);
            done.insert(s);
        }
    }
    back
}

// ── Tests ───────────────────────────────────────────────────────────────────
