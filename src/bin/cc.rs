//! The command-line driver: lex, parse, lower, build IR, allocate registers,
//! and emit — either x86-64 assembly text or a WebAssembly binary, chosen by
//! `TARGET`.

use std::path::PathBuf;

use clap::Parser;
use derive_more::Display;

use xcc::back;
use xcc::common::Set;
use xcc::front;
use xcc::middle;

/// A small C compiler: front end, IR builder, linear-scan register
/// allocator, and x86-64/WebAssembly emitters.
#[derive(Parser, Debug)]
#[command(name = "cc")]
struct Args {
    /// The single translation unit to compile. Multi-file compilation would
    /// need a linker to combine the results, which is out of scope here.
    input: PathBuf,

    /// Where to write the emitted output. Defaults to the input path with
    /// its extension replaced (`.s` for the native target, `.wasm` for
    /// `wasm32-*`).
    #[arg(short = 'o')]
    output: Option<PathBuf>,

    /// Stop after emitting assembly text (the default output already is
    /// text, or a wasm binary for a wasm32 target; this flag exists for
    /// surface compatibility with the CLI it's modeled on).
    #[arg(short = 'S')]
    assembly_only: bool,

    /// Also run the bundled assembler over the emitted text and report its
    /// resolved section sizes. No object file is written: producing a real
    /// linkable object is left to an external assembler.
    #[arg(short = 'c')]
    compile_only: bool,

    /// Header search path. Accepted for surface compatibility; there is no
    /// preprocessor to consult it.
    #[arg(short = 'I')]
    include_dirs: Vec<PathBuf>,

    /// Preprocessor define. Accepted for surface compatibility; there is no
    /// preprocessor to apply it.
    #[arg(short = 'D')]
    defines: Vec<String>,

    /// Force these names to be exported even if declared `static`.
    #[arg(short = 'e', value_delimiter = ',')]
    exports: Vec<String>,

    #[arg(long)]
    verbose: bool,
}

#[derive(Display, Debug)]
enum CliError {
    #[display("{}: {}", _0, _1)]
    Io(String, std::io::Error),
    #[display("{_0}")]
    Parse(front::parse::ParseError),
    #[display("{} error(s) found", _0.len())]
    Diagnostics(Vec<xcc::common::Diagnostic>),
    #[display("{_0}")]
    Ir(middle::IrError),
    #[display("{_0}")]
    Wasm(back::wasm::WasmError),
    #[display("{_0}")]
    Assemble(xcc::assembler::AssembleError),
}

impl From<front::parse::ParseError> for CliError {
    fn from(e: front::parse::ParseError) -> CliError {
        CliError::Parse(e)
    }
}
impl From<middle::IrError> for CliError {
    fn from(e: middle::IrError) -> CliError {
        CliError::Ir(e)
    }
}
impl From<back::wasm::WasmError> for CliError {
    fn from(e: back::wasm::WasmError) -> CliError {
        CliError::Wasm(e)
    }
}
impl From<xcc::assembler::AssembleError> for CliError {
    fn from(e: xcc::assembler::AssembleError) -> CliError {
        CliError::Assemble(e)
    }
}

fn main() {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if !args.include_dirs.is_empty() || !args.defines.is_empty() {
        log::debug!("-I/-D accepted but unused: no preprocessor stage");
    }

    if let Err(e) = run(&args) {
        match &e {
            CliError::Diagnostics(errs) => {
                for d in errs {
                    eprintln!("{d}");
                }
            }
            other => eprintln!("error: {other}"),
        }
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let target = std::env::var("TARGET").unwrap_or_else(|_| "x86_64-unknown-linux-gnu".to_string());
    let is_wasm = target.contains("wasm32");
    let ptr_size: u8 = if is_wasm { 4 } else { 8 };

    let source = std::fs::read_to_string(&args.input).map_err(|e| CliError::Io(args.input.display().to_string(), e))?;
    log::info!("parsing {}", args.input.display());
    let (mut program, types) = front::parse(&source, ptr_size)?;

    apply_extra_exports(&mut program, &args.exports);

    let diags = front::lower(&program);
    if diags.has_errors() {
        return Err(CliError::Diagnostics(diags.into_errors()));
    }

    let default_ext = if is_wasm { "wasm" } else { "s" };
    let output = args.output.clone().unwrap_or_else(|| args.input.with_extension(default_ext));

    if is_wasm {
        log::info!("emitting WebAssembly module to {}", output.display());
        let bytes = back::emit_module(&program)?;
        std::fs::write(&output, bytes).map_err(|e| CliError::Io(output.display().to_string(), e))?;
        return Ok(());
    }

    log::info!("building IR");
    let mut ir = middle::build_program(&program, &types)?;
    for f in ir.functions.iter_mut() {
        middle::allocate(f);
    }

    log::info!("emitting x86-64 assembly to {}", output.display());
    let text = back::emit_program(&ir, &target);
    std::fs::write(&output, &text).map_err(|e| CliError::Io(output.display().to_string(), e))?;

    if args.compile_only {
        let assembled = xcc::assembler::assemble(&text)?;
        for (section, layout) in assembled.layout.iter() {
            log::info!("{section:?}: {} bytes", layout.size);
        }
    }

    let _ = args.assembly_only; // always text output; kept for CLI surface compatibility
    Ok(())
}

fn apply_extra_exports(program: &mut front::Program, exports: &[String]) {
    let names: Set<&str> = exports.iter().map(|s| s.as_str()).collect();
    if names.is_empty() {
        return;
    }
    for f in program.functions.iter_mut() {
        if names.contains(f.name.to_string().as_str()) {
            f.is_static = false;
        }
    }
    for g in program.globals.iter_mut() {
        if names.contains(g.name.to_string().as_str()) {
            g.is_static = false;
        }
    }
}
