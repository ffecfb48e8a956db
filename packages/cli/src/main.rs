#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Command line front end for municipal layer consolidation.
//!
//! `muni_merge run <PARENT>` merges every city folder under `PARENT` into
//! one dataset; `muni_merge link <DATASET>` re-runs building/block linkage
//! on a dataset that was already merged. Without a subcommand the tool asks
//! what to do, and prompts for any missing folder.
//!
//! Once a run starts, Ctrl-C cancels it at its next phase boundary; a
//! second Ctrl-C exits immediately.
//!
//! Uses `indicatif-log-bridge` (via [`muni_merge_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use dialoguer::{Input, Select};
use muni_merge_cli_utils::IndicatifProgress;
use muni_merge_pipeline::config::PipelineConfig;
use muni_merge_pipeline::report::RunReport;
use muni_merge_pipeline::{CancelToken, Pipeline};
use muni_merge_spatial::Measure;

#[derive(Parser)]
#[command(name = "muni_merge", about = "Consolidate per-city vector layers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every city folder under a parent folder and link buildings to
    /// blocks
    Run {
        /// Folder holding one sub-folder per city
        parent: Option<PathBuf>,

        /// Destination dataset directory (default: `<PARENT>/<name>_merged`)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Fail instead of replacing layers of an existing dataset
        #[arg(long)]
        no_overwrite: bool,

        /// Measurement mode: planar, geodesic or auto
        #[arg(long, value_parser = parse_measure)]
        measure: Option<Measure>,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Re-run pairing and linkage on an already merged dataset
    Link {
        /// Dataset directory written by `run`
        dataset: Option<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

/// Actions offered when no subcommand is given.
enum Tool {
    Run,
    Link,
}

impl Tool {
    const ALL: &[Self] = &[Self::Run, Self::Link];

    #[must_use]
    const fn label(&self) -> &'static str {
        match self {
            Self::Run => "Merge city folders",
            Self::Link => "Re-link an existing dataset",
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = muni_merge_cli_utils::init_logger();
    let cli = Cli::parse();
    let cancel = CancelToken::new();

    let command = match cli.command {
        Some(command) => command,
        None => choose_command()?,
    };

    match command {
        Commands::Run {
            parent,
            output,
            no_overwrite,
            measure,
            common,
        } => {
            let parent = folder_or_prompt(parent, "Parent folder holding one folder per city")?;
            let mut config = load_config(common.config.as_deref())?;
            if output.is_some() {
                config.output_dir = output;
            }
            if no_overwrite {
                config.overwrite = false;
            }
            if let Some(measure) = measure {
                config.measure = measure;
            }

            cancel_on_ctrl_c(&cancel);
            let progress = IndicatifProgress::steps_bar(&multi, "Consolidating");
            let report = Pipeline::new(config).run(&parent, Some(&progress), &cancel)?;
            write_report(common.report.as_deref(), &report)?;
        }
        Commands::Link { dataset, common } => {
            let dataset = folder_or_prompt(dataset, "Merged dataset folder")?;
            let config = load_config(common.config.as_deref())?;

            cancel_on_ctrl_c(&cancel);
            let progress = IndicatifProgress::steps_bar(&multi, "Linking");
            let report = Pipeline::new(config).link_existing(&dataset, Some(&progress), &cancel)?;
            write_report(common.report.as_deref(), &report)?;
        }
    }

    Ok(())
}

fn parse_measure(value: &str) -> Result<Measure, String> {
    value
        .parse()
        .map_err(|_| format!("unknown measure {value:?}, expected planar, geodesic or auto"))
}

/// Spawns a watcher thread that cancels `token` on the first Ctrl-C and
/// exits the process on the second.
fn cancel_on_ctrl_c(token: &CancelToken) {
    let token = token.clone();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::warn!("Ctrl-C handling unavailable: {e}");
                return;
            }
        };

        runtime.block_on(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Ctrl-C handling unavailable: {e}");
                return;
            }
            log::warn!("Interrupted, stopping at the next phase (Ctrl-C again to quit now)");
            token.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}

fn choose_command() -> Result<Commands, Box<dyn std::error::Error>> {
    let labels: Vec<&str> = Tool::ALL.iter().map(Tool::label).collect();

    let idx = Select::new()
        .with_prompt("What would you like to do?")
        .items(&labels)
        .default(0)
        .interact()?;

    let common = CommonArgs {
        config: None,
        report: None,
    };
    Ok(match Tool::ALL[idx] {
        Tool::Run => Commands::Run {
            parent: None,
            output: None,
            no_overwrite: false,
            measure: None,
            common,
        },
        Tool::Link => Commands::Link {
            dataset: None,
            common,
        },
    })
}

fn folder_or_prompt(
    folder: Option<PathBuf>,
    prompt: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(folder) = folder {
        return Ok(folder);
    }
    let answer: String = Input::new()
        .with_prompt(prompt)
        .validate_with(|input: &String| -> Result<(), &str> {
            if Path::new(input.trim()).is_dir() {
                Ok(())
            } else {
                Err("not a directory")
            }
        })
        .interact_text()?;
    Ok(PathBuf::from(answer.trim()))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn write_report(path: Option<&Path>, report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    log::info!("Wrote run report to {}", path.display());
    Ok(())
}
