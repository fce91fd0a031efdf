use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rayon::ThreadPoolBuilder;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use geolink_core::config::{load_config, load_config_with_overrides, PipelineConfig};
use geolink_core::time::utc_run_id;
use geolink_pipeline::package::{finalize_event_package, make_event_bundle};
use geolink_pipeline::summary::{render_event_summary, SummaryFormat};
use geolink_pipeline::{parse_stages, run_stages, StageContext, STAGE_ORDER};

mod cli;

use cli::{Cli, Commands};

fn configure_threads(spec: &str) {
    let count = if spec.eq_ignore_ascii_case("auto") {
        num_cpus::get()
    } else {
        spec.parse().unwrap_or_else(|_| num_cpus::get())
    };
    let _ = ThreadPoolBuilder::new().num_threads(count).build_global();
}

fn resolve_config(
    base_dir: &Path,
    config: &Path,
    overrides: Option<&Path>,
) -> Result<PipelineConfig> {
    let config_path = base_dir.join(config);
    match overrides {
        Some(overrides) => load_config_with_overrides(&config_path, &base_dir.join(overrides)),
        None => load_config(&config_path),
    }
}

fn write_config_snapshot(ctx: &StageContext, config_path: &Path) -> Result<()> {
    let snapshot = serde_json::json!({
        "run_id": ctx.run_id,
        "params_hash": ctx.params_hash,
        "config_path": config_path.display().to_string(),
        "config": ctx.config,
    });
    let yaml = serde_yaml::to_string(&snapshot).context("serializing config snapshot")?;
    std::fs::write(ctx.paths.reports.join("config_snapshot.yaml"), yaml)
        .context("writing config snapshot")
}

fn cmd_run(
    base_dir: &Path,
    config_path: &Path,
    overrides: Option<&Path>,
    stages_spec: Option<&str>,
    event_id: Option<String>,
    strict: bool,
    threads: &str,
) -> Result<()> {
    configure_threads(threads);
    let stages_spec = stages_spec
        .ok_or_else(|| anyhow::anyhow!("--stages is required (or use --list-stages)"))?;
    let stages = parse_stages(stages_spec)?;
    let config = resolve_config(base_dir, config_path, overrides)?;
    let run_id = utc_run_id();
    let ctx = StageContext::new(base_dir, config, run_id, strict, event_id)?;
    info!(
        run_id = ctx.run_id.as_str(),
        params_hash = ctx.params_hash.as_str(),
        "starting pipeline run"
    );
    write_config_snapshot(&ctx, config_path)?;
    let timings = run_stages(&ctx, &stages)?;
    for timing in &timings {
        println!("{:<10} {:>8.3}s  {}", timing.stage, timing.duration_s, timing.status);
    }
    println!(
        "Run {} complete (details in {})",
        ctx.run_id,
        ctx.paths.reports.join("runtime_report.json").display()
    );
    Ok(())
}

fn event_paths(base_dir: &Path, config_path: &Path) -> Result<(geolink_store::OutputPaths, PipelineConfig)> {
    let config = resolve_config(base_dir, config_path, None)?;
    let root = if config.outputs.root.is_absolute() {
        config.outputs.root.clone()
    } else {
        base_dir.join(&config.outputs.root)
    };
    Ok((geolink_store::OutputPaths::new(root), config))
}

fn run_command(cli: &Cli) -> Result<()> {
    let base_dir: PathBuf = cli.base_dir.clone();
    match &cli.command {
        Commands::Run {
            config,
            overrides,
            stages,
            event_id,
            strict,
            list_stages,
            threads,
        } => {
            if *list_stages {
                println!(
                    "{}",
                    STAGE_ORDER
                        .iter()
                        .map(|stage| stage.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                );
                return Ok(());
            }
            cmd_run(
                &base_dir,
                config,
                overrides.as_deref(),
                stages.as_deref(),
                event_id.clone(),
                *strict,
                threads,
            )
        }
        Commands::Finalize {
            config,
            event_id,
            strict,
        } => {
            let (paths, _) = event_paths(&base_dir, config)?;
            paths.ensure()?;
            let final_dir = finalize_event_package(&paths, event_id, &utc_run_id(), *strict)?;
            println!("Event package committed to {}", final_dir.display());
            Ok(())
        }
        Commands::Bundle { config, event_id } => {
            let (paths, _) = event_paths(&base_dir, config)?;
            let bundle = make_event_bundle(&paths.event_package(event_id), event_id)?;
            println!("Bundle written to {}", bundle.display());
            Ok(())
        }
        Commands::Render {
            config,
            event_id,
            format,
        } => {
            let (paths, _) = event_paths(&base_dir, config)?;
            let event_dir = paths.event_package(event_id);
            let md_path = render_event_summary(
                &event_dir,
                event_id,
                SummaryFormat::from_name(format),
            )?;
            println!("Summary rendered to {}", md_path.display());
            Ok(())
        }
        Commands::Stages => {
            println!(
                "{}",
                STAGE_ORDER
                    .iter()
                    .map(|stage| stage.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install tracing subscriber");
    }

    match run_command(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;

    #[test]
    fn stages_lists_the_pipeline_order() {
        Command::cargo_bin("geolink")
            .unwrap()
            .arg("stages")
            .assert()
            .success()
            .stdout(predicate::str::contains(
                "manifest,ingest,raw,standard,spatial,link,features,model,plots",
            ));
    }

    #[test]
    fn run_requires_a_stage_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        std::fs::write(&config, "pipeline:\n  version: \"0.1.0\"\n").unwrap();
        Command::cargo_bin("geolink")
            .unwrap()
            .args([
                "--base-dir",
                dir.path().to_str().unwrap(),
                "run",
                "--config",
                "config.yaml",
            ])
            .assert()
            .failure();
    }

    #[test]
    fn out_of_order_stages_fail_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.yaml");
        std::fs::write(&config, "pipeline:\n  version: \"0.1.0\"\n").unwrap();
        Command::cargo_bin("geolink")
            .unwrap()
            .args([
                "--base-dir",
                dir.path().to_str().unwrap(),
                "run",
                "--config",
                "config.yaml",
                "--stages",
                "link,ingest",
            ])
            .assert()
            .failure();
        // No outputs directory should have been created by stage work.
        assert!(!dir.path().join("outputs/linked").join("ev1").exists());
    }
}
