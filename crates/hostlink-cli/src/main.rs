//! hostlink command-line interface
//!
//! - `run`: instantiate a guest against the headless host, call its entry
//!   point and drive a number of animation frames
//! - `imports`: print the host capability table
//! - `inspect`: check a module's imports and exports against the bridge

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hostlink::wasm::{
    check_import, Capability, ImportCheck, WasmConfig, WasmModule, WasmSandbox, FREE_EXPORT, MALLOC_EXPORT,
    REALLOC_EXPORT, EXN_STORE_EXPORT,
};
use hostlink::{BridgeStats, ConsoleEntry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "hostlink")]
#[command(author, version, about = "Run and inspect hostlink guest modules", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a guest module against the headless host
    Run {
        /// Module to run (.wasm or .wat)
        module: PathBuf,

        /// Export to call first
        #[arg(short, long, default_value = "start")]
        entry: String,

        /// Animation frames to drive after the entry point returns
        #[arg(long, default_value = "0")]
        frames: u32,

        /// Virtual milliseconds per frame
        #[arg(long, default_value = "16.0")]
        frame_ms: f64,

        /// Canvas element ids to create before the entry point runs
        #[arg(long)]
        canvas: Vec<String>,

        /// JSON config file (defaults apply to missing fields)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print a JSON report instead of text
        #[arg(long)]
        json: bool,
    },

    /// List the host capabilities a guest can import
    Imports {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check a module's imports and exports against the bridge
    Inspect {
        /// Module to inspect (.wasm or .wat)
        module: PathBuf,

        /// JSON config file (for the import module name)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct RunReport<'a> {
    module: &'a str,
    entry: &'a str,
    frames: u32,
    callbacks: usize,
    clock_ms: f64,
    entry_time_us: u64,
    console: &'a [ConsoleEntry],
    stats: BridgeStats,
}

#[derive(Serialize)]
struct CapabilityInfo {
    name: &'static str,
    signature: String,
    catches: bool,
}

fn load_config(path: Option<&Path>) -> Result<WasmConfig> {
    match path {
        Some(path) => WasmConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(WasmConfig::default()),
    }
}

fn load_module(sandbox: &WasmSandbox, path: &Path) -> Result<WasmModule> {
    sandbox
        .load_module(path)
        .with_context(|| format!("failed to load module {}", path.display()))
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    module_path: PathBuf,
    entry: String,
    frames: u32,
    frame_ms: f64,
    canvas: Vec<String>,
    config: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let sandbox = WasmSandbox::new(config).context("failed to create sandbox")?;
    let module = load_module(&sandbox, &module_path)?;
    let mut instance = sandbox
        .instantiate_headless(&module)
        .context("failed to instantiate module")?;

    for id in &canvas {
        instance.host_mut().add_element(id, "canvas");
    }

    info!("Calling {}::{}", module.name(), entry);
    let result = instance
        .call::<(), ()>(&entry, ())
        .with_context(|| format!("{} failed", entry))?;

    let mut callbacks = 0;
    for frame in 0..frames {
        callbacks += instance
            .advance(frame_ms)
            .with_context(|| format!("frame {} failed", frame))?;
    }

    let stats = instance.stats();
    let host = instance.host();

    if json {
        let report = RunReport {
            module: module.name(),
            entry: &entry,
            frames,
            callbacks,
            clock_ms: host.clock(),
            entry_time_us: result.execution_time_us,
            console: host.console_entries(),
            stats,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== {} ===", module.name());
    println!("{}() returned in {}us", entry, result.execution_time_us);
    if let Some(fuel) = result.fuel_consumed {
        println!("Fuel consumed: {}", fuel);
    }
    println!("Frames: {} ({:.1}ms virtual), callbacks run: {}", frames, host.clock(), callbacks);
    println!(
        "Pending: {} timers, {} frames, {} listeners",
        host.pending_timers(),
        host.pending_frames(),
        host.listener_count()
    );
    println!("Host calls recorded: {}", host.calls().len());

    if !host.console_entries().is_empty() {
        println!();
        println!("Console:");
        for entry in host.console_entries() {
            println!("  [{:?}] {}", entry.level, entry.text);
        }
    }

    println!();
    println!("Live handles:        {}", stats.live_handles);
    println!("View rebuilds:       {}", stats.view_rebuilds);
    println!("Exceptions stored:   {}", stats.exceptions_stored);
    println!("Closures invoked:    {}", stats.closures_invoked);
    println!("Closures finalized:  {}", stats.closures_finalized);
    Ok(())
}

fn cmd_imports(json: bool) -> Result<()> {
    if json {
        let table: Vec<_> = Capability::ALL
            .iter()
            .map(|c| CapabilityInfo {
                name: c.name(),
                signature: c.signature().to_string(),
                catches: c.catches(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("{:<26} {:<36} {}", "CAPABILITY", "SIGNATURE", "ON HOST ERROR");
    for cap in Capability::ALL {
        println!(
            "{:<26} {:<36} {}",
            cap.name(),
            cap.signature().to_string(),
            if cap.catches() { "exception store" } else { "trap" }
        );
    }
    Ok(())
}

fn cmd_inspect(module_path: PathBuf, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config.as_deref())?;
    let import_module = config.import_module.clone();
    let link_wasi = config.link_wasi;
    let sandbox = WasmSandbox::new(config).context("failed to create sandbox")?;
    let module = load_module(&sandbox, &module_path)?;

    let mut problems = 0;
    println!("=== {} ===", module.name());
    println!("Imports:");
    for (from, name, ty) in module.function_imports() {
        let status = if from == import_module {
            match check_import(&name, &ty) {
                ImportCheck::Ok(_) => "ok".to_string(),
                ImportCheck::Unknown => {
                    problems += 1;
                    "UNKNOWN capability".to_string()
                }
                ImportCheck::SignatureMismatch { expected, .. } => {
                    problems += 1;
                    format!("SIGNATURE MISMATCH, host provides {}", expected)
                }
            }
        } else if from == "wasi_snapshot_preview1" && link_wasi {
            "wasi".to_string()
        } else {
            problems += 1;
            "UNRESOLVED module".to_string()
        };
        println!("  {}::{:<28} {}", from, name, status);
    }

    let exports: Vec<&str> = module.exports().collect();
    println!("Exports:");
    for (name, required) in [
        (MALLOC_EXPORT, true),
        (FREE_EXPORT, true),
        (REALLOC_EXPORT, false),
        (EXN_STORE_EXPORT, false),
    ] {
        let present = exports.contains(&name);
        if required && !present {
            problems += 1;
        }
        println!(
            "  {:<28} {}",
            name,
            match (present, required) {
                (true, _) => "present",
                (false, true) => "MISSING",
                (false, false) => "absent (optional)",
            }
        );
    }

    if problems > 0 {
        bail!("{} problem(s) found in {}", problems, module_path.display());
    }
    println!("Module is compatible with this host.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(cli.verbose > 1)
        .init();

    match cli.command {
        Commands::Run {
            module,
            entry,
            frames,
            frame_ms,
            canvas,
            config,
            json,
        } => cmd_run(module, entry, frames, frame_ms, canvas, config, json),

        Commands::Imports { json } => cmd_imports(json),

        Commands::Inspect { module, config } => cmd_inspect(module, config),
    }
}
