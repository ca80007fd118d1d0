use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::info;
use tracing_subscriber::EnvFilter;

use dfc::diag::Diagnostic;
use dfc::graph::Program;
use dfc::pass::PassId;
use dfc::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use dfc::registry::Registry;
use dfc::transformation::TransformationRegistry;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    /// Canonical schedule tree rendering
    Tree,
    /// Indentation-structured script
    Script,
    /// Rewritten program as JSON
    Json,
    /// Graphviz DOT of the rewritten program
    Dot,
    /// Plain-text listing of the rewritten program
    Graph,
}

impl EmitStage {
    fn terminal(self) -> PassId {
        match self {
            EmitStage::Tree => PassId::VerifyTree,
            EmitStage::Script => PassId::Emit,
            EmitStage::Json | EmitStage::Dot | EmitStage::Graph => PassId::Propagate,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dfc",
    version,
    about = "Dataflow Compiler: rewrites parallel dataflow programs and lowers them to schedule trees"
)]
struct Cli {
    /// Input program (JSON)
    program: PathBuf,

    /// Apply Map Fission to a fixpoint before lowering
    #[arg(long)]
    fission: bool,

    /// Upper bound on rewrites per transformation
    #[arg(long, default_value_t = 64)]
    max_rewrites: usize,

    /// Library operator definitions (JSON, repeatable)
    #[arg(long = "libraries")]
    libraries: Vec<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Script)]
    emit: EmitStage,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print compiler phases, timing and program fingerprints
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "dfc=debug" } else { "dfc=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!(program = %cli.program.display(), emit = ?cli.emit, "dfc starting");

    // ── Load library registry ──
    let mut libraries = Registry::builtin();
    for path in &cli.libraries {
        match libraries.load_json(path) {
            Ok(n) => info!(count = n, path = %path.display(), "loaded library operators"),
            Err(e) => {
                eprintln!("dfc: error: {}", e);
                return ExitCode::from(2);
            }
        }
    }

    // ── Load program ──
    let program = match Program::load(&cli.program) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("dfc: error: {}", e);
            return ExitCode::from(2);
        }
    };

    let mut state =
        CompilationState::with_registries(program, libraries, TransformationRegistry::builtin());
    if cli.verbose {
        eprintln!("dfc: input fingerprint {}", state.input_fingerprint);
    }

    let mut options = PipelineOptions {
        max_rewrites: cli.max_rewrites,
        ..PipelineOptions::default()
    };
    if cli.fission {
        options = options.with_transformation("MapFission");
    }

    let result = run_pipeline(
        &mut state,
        cli.emit.terminal(),
        &options,
        cli.verbose,
        |_, diags: &[Diagnostic]| {
            for d in diags {
                eprintln!("dfc: {}", d);
            }
        },
    );
    if let Err(e) = result {
        eprintln!("dfc: {}", e);
        return ExitCode::from(1);
    }

    if cli.verbose {
        eprintln!(
            "dfc: {} rewrites, output fingerprint {}",
            state.rewrites.len(),
            state.program.fingerprint()
        );
    }

    let text = match cli.emit {
        EmitStage::Tree => state.tree.as_ref().map(|t| t.to_string()),
        EmitStage::Script => state.script.clone(),
        EmitStage::Json => match state.program.to_json() {
            Ok(json) => Some(json),
            Err(e) => {
                eprintln!("dfc: error: {}", e);
                return ExitCode::from(1);
            }
        },
        EmitStage::Dot => Some(dfc::dot::emit_dot(&state.program)),
        EmitStage::Graph => Some(state.program.to_string()),
    };
    let Some(text) = text else {
        eprintln!("dfc: no output produced for --emit {:?}", cli.emit);
        return ExitCode::from(1);
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, &text) {
                eprintln!("dfc: error: {}: {}", path.display(), e);
                return ExitCode::from(2);
            }
        }
        None => print!("{text}"),
    }
    ExitCode::SUCCESS
}
