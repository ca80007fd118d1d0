// pipeline.rs — Compilation state and pass orchestration
//
// Holds the program being rewritten plus every pass artifact, and runs the
// minimal set of passes for a given terminal PassId.
//
// Preconditions: the program has been loaded before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics; a failed certificate.
// Side effects: calls on_pass_complete after each pass for immediate display;
//   rewrites `program` in place during fission and propagation.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::codegen::emit_script;
use crate::diag::{codes, DiagLevel, Diagnostic, Location};
use crate::graph::Program;
use crate::lower::lower_program;
use crate::pass::{descriptor, failed_obligations, required_passes, PassId, StageCert};
use crate::propagate::propagate_program;
use crate::registry::Registry;
use crate::schedule::{verify_tree, ScheduleTree, TreeCert};
use crate::transformation::{apply_repeated, RewriteReport, TransformationRegistry};
use crate::validate::{validate_with, GraphCert};

// ── Options ────────────────────────────────────────────────────────────────

/// Library-side configuration for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Transformations run by the fission pass, in order, each to a fixpoint.
    pub transformations: Vec<String>,
    /// Upper bound on rewrites per transformation.
    pub max_rewrites: usize,
    /// Re-validate the program after propagation.
    pub validate_between: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            transformations: Vec::new(),
            max_rewrites: 64,
            validate_between: true,
        }
    }
}

impl PipelineOptions {
    pub fn with_transformation(mut self, name: &str) -> Self {
        self.transformations.push(name.to_string());
        self
    }
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub program: Program,
    pub libraries: Registry,
    pub transformations: TransformationRegistry,
    /// Fingerprint of the program as loaded, before any rewrite.
    pub input_fingerprint: String,
    pub graph_cert: Option<GraphCert>,
    pub rewrites: Vec<RewriteReport>,
    pub tree: Option<ScheduleTree>,
    pub tree_cert: Option<TreeCert>,
    pub script: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl CompilationState {
    pub fn new(program: Program) -> Self {
        Self::with_registries(program, Registry::builtin(), TransformationRegistry::builtin())
    }

    pub fn with_registries(
        program: Program,
        libraries: Registry,
        transformations: TransformationRegistry,
    ) -> Self {
        let input_fingerprint = program.fingerprint();
        Self {
            program,
            libraries,
            transformations,
            input_fingerprint,
            graph_cert: None,
            rewrites: Vec::new(),
            tree: None,
            tree_cert: None,
            script: None,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("pass {failing_pass:?} failed")]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

fn report_timing(pass_id: PassId, elapsed: Duration, verbose: bool) {
    let name = descriptor(pass_id).name;
    let ms = elapsed.as_secs_f64() * 1000.0;
    if verbose {
        info!(pass = name, elapsed_ms = ms, "pass complete");
    } else {
        debug!(pass = name, elapsed_ms = ms, "pass complete");
    }
}

/// Per-pass post-processing: callback, accumulate, timing, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    report_timing(pass_id, elapsed, verbose);
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Error diagnostic summarising a failed certificate, if it failed.
fn cert_failure(
    cert: &impl StageCert,
    what: &str,
    code: crate::diag::DiagCode,
) -> Option<Diagnostic> {
    if cert.all_pass() {
        return None;
    }
    Some(
        Diagnostic::error(
            Location::Program,
            format!(
                "{} verification failed: {}",
                what,
                failed_obligations(cert).join(", ")
            ),
        )
        .with_code(code),
    )
}

/// An artifact an earlier pass should have produced is missing.
fn missing(pass_id: PassId) -> PipelineError {
    PipelineError {
        failing_pass: pass_id,
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → timing → error check.
///
/// Preconditions: `state.program` is set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are populated,
///   or `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics; a failed certificate;
///   an unknown or aborted transformation.
/// Side effects: calls `on_pass_complete` after each pass for immediate diagnostic display.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &PipelineOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Validate => {
                let (cert, mut diags) = validate_with(&state.program, &state.libraries);
                diags.extend(cert_failure(&cert, "graph", codes::E0600));
                state.graph_cert = Some(cert);
                diags
            }
            PassId::Fission => run_fission(state, options),
            PassId::Propagate => {
                propagate_program(&mut state.program);
                if options.validate_between && !state.rewrites.is_empty() {
                    let (cert, mut diags) = validate_with(&state.program, &state.libraries);
                    diags.extend(cert_failure(&cert, "rewritten graph", codes::E0600));
                    state.graph_cert = Some(cert);
                    diags
                } else {
                    Vec::new()
                }
            }
            PassId::Lower => {
                let result = lower_program(&state.program);
                state.tree = Some(result.tree);
                result.diagnostics
            }
            PassId::VerifyTree => {
                let tree = state.tree.as_ref().ok_or(missing(pass_id))?;
                let cert = verify_tree(tree);
                let diags = cert_failure(&cert, "schedule tree", codes::E0601)
                    .into_iter()
                    .collect();
                state.tree_cert = Some(cert);
                diags
            }
            PassId::Emit => {
                let tree = state.tree.as_ref().ok_or(missing(pass_id))?;
                state.script = Some(emit_script(tree));
                Vec::new()
            }
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

/// Run every requested transformation to a fixpoint, in order.
fn run_fission(state: &mut CompilationState, options: &PipelineOptions) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for name in &options.transformations {
        let Some(t) = state.transformations.get(name) else {
            diags.push(
                Diagnostic::error(
                    Location::Program,
                    format!("unknown transformation `{}`", name),
                )
                .with_code(codes::E0603)
                .with_hint(format!(
                    "available: {}",
                    state.transformations.names().join(", ")
                )),
            );
            continue;
        };
        match apply_repeated(&mut state.program, t, options.max_rewrites) {
            Ok(outcome) => {
                info!(
                    transformation = name.as_str(),
                    applied = outcome.applied(),
                    "transformation reached fixpoint"
                );
                if outcome.bound_reached {
                    diags.push(
                        Diagnostic::warning(
                            Location::Program,
                            format!(
                                "{} stopped after {} rewrites with candidates remaining",
                                name, options.max_rewrites
                            ),
                        )
                        .with_code(codes::W0003)
                        .with_hint("raise --max-rewrites"),
                    );
                }
                state.rewrites.extend(outcome.reports);
            }
            Err(e) => diags.push(
                Diagnostic::error(Location::Program, format!("{} aborted: {}", name, e))
                    .with_code(codes::E0602),
            ),
        }
    }
    diags
}

// ── Tests ──────────────────────────────────────────────────────────────────
