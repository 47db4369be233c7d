//! Plume middle-end driver.
//!
//! Provides the `plume` binary: loads scope-resolved module files (JSON
//! interchange form), runs checking and lowering, reports diagnostics to
//! stderr, and emits the primitive form -- human-readable on stdout, or
//! the full module JSON with `-o`.
//!
//! Pass logging is aspect-based: `--log types,builder` routes those
//! passes' trace lines through the single tracing sink on stderr.

use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;

use plume_core::Module;

/// The aspects a `--log` selection may name, with their pass.
const LOG_ASPECTS: &[&str] = &["types", "modes", "unbranch", "builder", "lastcall"];

/// Plume compiler middle-end.
#[derive(Parser)]
#[command(name = "plume", version, about = "Plume compiler middle-end")]
struct Cli {
    /// Module files to compile (JSON interchange form).
    #[arg(required = true)]
    modules: Vec<PathBuf>,

    /// Recompile even when the output is up to date.
    #[arg(short, long)]
    force: bool,

    /// Directories searched for module files not found directly.
    #[arg(short = 'L', long = "libdir")]
    libdirs: Vec<PathBuf>,

    /// Comma-separated pass aspects to log (types, modes, unbranch,
    /// builder, lastcall).
    #[arg(long)]
    log: Option<String>,

    /// Disable LLVM optimisation in the backend (forwarded).
    #[arg(long)]
    no_llvm_opt: bool,

    /// Disable multiple specialisation (forwarded).
    #[arg(long = "no-multi-specz")]
    no_multi_specz: bool,

    /// Write the checked and lowered module as JSON instead of printing
    /// the primitive form.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(msg) = init_logging(cli.log.as_deref()) {
        eprintln!("Error: {}", msg);
        process::exit(2);
    }
    if cli.no_llvm_opt || cli.no_multi_specz {
        tracing::debug!(
            "backend flags forwarded: no_llvm_opt={} no_multi_specz={}",
            cli.no_llvm_opt,
            cli.no_multi_specz
        );
    }

    let mut exit_code = 0;
    for module_path in &cli.modules {
        match run_compile(module_path, &cli) {
            Ok(code) => exit_code = exit_code.max(code),
            Err(msg) => {
                eprintln!("Error: {}", msg);
                exit_code = exit_code.max(2);
            }
        }
    }
    process::exit(exit_code);
}

/// Installs the single tracing sink, filtered to the selected aspects.
fn init_logging(aspects: Option<&str>) -> Result<(), String> {
    use tracing_subscriber::EnvFilter;

    let mut filter = EnvFilter::new("off");
    if let Some(aspects) = aspects {
        for aspect in aspects.split(',').map(str::trim).filter(|a| !a.is_empty()) {
            if !LOG_ASPECTS.contains(&aspect) {
                return Err(format!(
                    "unknown log aspect '{}', expected one of {}",
                    aspect,
                    LOG_ASPECTS.join(", ")
                ));
            }
            filter = filter.add_directive(
                format!("{}=trace", aspect)
                    .parse()
                    .expect("aspect directives are well-formed"),
            );
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
    Ok(())
}

/// Compiles one module file.
///
/// Returns exit code: 0 = success, 1 = compilation errors. I/O and
/// command-line problems come back as `Err`.
fn run_compile(module_path: &Path, cli: &Cli) -> Result<i32, String> {
    let resolved = resolve_module_path(module_path, &cli.libdirs)?;

    if let Some(out_path) = &cli.output {
        if !cli.force && up_to_date(&resolved, out_path) {
            eprintln!(
                "{} is up to date (use --force to recompile)",
                out_path.display()
            );
            return Ok(0);
        }
    }

    let text = std::fs::read_to_string(&resolved)
        .map_err(|e| format!("cannot read '{}': {}", resolved.display(), e))?;
    let mut module: Module = serde_json::from_str(&text)
        .map_err(|e| format!("'{}' is not a module file: {}", resolved.display(), e))?;

    let report = plume_check::check_module(&mut module);
    for diag in &report.diags {
        eprintln!("{}", diag);
    }

    plume_lower::lower_module(&mut module, &report);

    match &cli.output {
        Some(out_path) => {
            let json = serde_json::to_string_pretty(&module)
                .map_err(|e| format!("cannot serialize module: {}", e))?;
            std::fs::write(out_path, json)
                .map_err(|e| format!("cannot write '{}': {}", out_path.display(), e))?;
        }
        None => print_module(&module, &report),
    }

    Ok(if report.is_clean() { 0 } else { 1 })
}

/// Finds a module file directly or under the library directories.
fn resolve_module_path(path: &Path, libdirs: &[PathBuf]) -> Result<PathBuf, String> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    for dir in libdirs {
        let candidate = dir.join(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(format!("module file '{}' not found", path.display()))
}

/// `true` when the output is newer than the input.
fn up_to_date(input: &Path, output: &Path) -> bool {
    let Ok(out_meta) = std::fs::metadata(output) else {
        return false;
    };
    let Ok(in_meta) = std::fs::metadata(input) else {
        return false;
    };
    match (out_meta.modified(), in_meta.modified()) {
        (Ok(out_time), Ok(in_time)) => out_time >= in_time,
        _ => false,
    }
}

/// Prints the primitive form of every successfully lowered procedure.
fn print_module(module: &Module, report: &plume_check::CheckReport) {
    println!("module {}", module.path);
    for spec in module.all_specs() {
        if report.failed.contains(&spec) {
            continue;
        }
        let def = module.get_proc(&spec).expect("enumerated spec");
        if let Some(body) = def.impln.as_prim() {
            println!();
            println!("{} {}:", def.determinism, def.proto);
            print!("{}", body);
        }
    }
}
