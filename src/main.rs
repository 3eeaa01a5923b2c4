// src/main.rs
//
// =============================================================================
// REPX-LAB: COMMANDER & ENTRY POINT
// =============================================================================
//
// Modes:
// 1. CHECK:  Load and evaluate a lab file, print a summary.
// 2. PLAN:   Print run order and every job with its effective parameters.
// 3. BUILD:  Evaluate and package the lab into a directory.
// 4. VERIFY: Re-check a packaged lab against its manifest.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use repx_lab::config::{resolve_revision, BuildConfig};
use repx_lab::{dsl, logs, packager, ResolvedLab};
use serde_json::json;
use std::path::{Path, PathBuf};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(
    name = "repx-lab",
    version,
    about = "Resolve, validate and package reproducible experiment labs"
)]
struct Cli {
    /// More output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a lab file and report what it would build.
    Check {
        #[arg(long)]
        file: PathBuf,
    },

    /// Print the run order and the resolved jobs.
    Plan {
        #[arg(long)]
        file: PathBuf,

        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Package the lab.
    Build {
        #[arg(long)]
        file: PathBuf,

        /// Output directory of the lab.
        #[arg(long)]
        out: PathBuf,

        /// Revision id (default: $REPX_LAB_REVISION, else "unknown").
        #[arg(long)]
        revision: Option<String>,

        /// Override lab.version from the lab file.
        #[arg(long)]
        lab_version: Option<String>,

        /// Replace an existing output directory.
        #[arg(long)]
        force: bool,
    },

    /// Verify a packaged lab.
    Verify {
        #[arg(long)]
        lab: PathBuf,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();
    logs::init(cli.verbose);

    match cli.command {
        Commands::Check { file } => run_check(&file),
        Commands::Plan { file, json } => run_plan(&file, json),
        Commands::Build {
            file,
            out,
            revision,
            lab_version,
            force,
        } => {
            let mut config = BuildConfig::new(out)
                .with_revision(resolve_revision(revision))
                .force(force);
            if let Some(v) = lab_version {
                config = config.with_lab_version(v);
            }
            run_build(&file, &config)
        }
        Commands::Verify { lab } => run_verify(&lab),
    }
}

fn evaluate(file: &Path) -> Result<ResolvedLab> {
    log::info!("Loading lab file: {}", file.display());
    let spec = dsl::load_yaml(file).with_context(|| format!("Failed to load {}", file.display()))?;
    let lab = spec
        .evaluate()
        .with_context(|| format!("Failed to resolve lab '{}'", spec.name))?;
    Ok(lab)
}

// ============================================================================
// 3. COMMANDS
// ============================================================================

fn run_check(file: &Path) -> Result<()> {
    let lab = evaluate(file)?;
    let unique = lab.unique_jobs().len();
    println!("lab '{}' version {}", lab.name, lab.version);
    for run in &lab.runs {
        println!("  run {:<24} {:>4} job(s)", run.name, run.jobs.len());
    }
    println!("{} run(s), {} unique job(s)", lab.runs.len(), unique);
    Ok(())
}

fn run_plan(file: &Path, as_json: bool) -> Result<()> {
    let lab = evaluate(file)?;

    if as_json {
        let runs: Vec<_> = lab
            .runs
            .iter()
            .map(|run| {
                json!({
                    "name": run.name,
                    "dependencies": run.dependencies,
                    "jobs": run.jobs.iter().map(|j| json!({
                        "id": j.id,
                        "stage_type": j.stage_type().to_string(),
                        "params": j.params,
                        "effective_params": j.effective_params,
                        "inputs": j.inputs.iter().map(|m| m.to_metadata()).collect::<Vec<_>>(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        let doc = json!({ "lab": lab.name, "runs": runs, "groups": lab.groups });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for (i, run) in lab.runs.iter().enumerate() {
        let deps: Vec<String> = run
            .dependencies
            .iter()
            .map(|(n, k)| format!("{n} ({k})"))
            .collect();
        println!("{}. {}  <- [{}]", i + 1, run.name, deps.join(", "));
        for job in &run.jobs {
            println!(
                "     {:<48} {}",
                job.id.short_id(),
                serde_json::to_string(&job.effective_params)?
            );
        }
    }
    Ok(())
}

fn run_build(file: &Path, config: &BuildConfig) -> Result<()> {
    let lab = evaluate(file)?;
    let report = packager::package(&lab, config)
        .with_context(|| format!("Failed to package lab into {}", config.out.display()))?;
    println!("{}", report.lab_root.display());
    println!("labId {}", report.lab_id);
    Ok(())
}

fn run_verify(lab: &Path) -> Result<()> {
    let report = packager::verify(lab).with_context(|| format!("Lab {} failed verification", lab.display()))?;
    println!("ok: {} file(s), labId {}", report.checked, report.lab_id);
    Ok(())
}
