//! Stage ordering, validation, execution and timing.
//!
//! A run names a non-empty subset of the stage order; unknown names or an
//! out-of-order subset fail before any stage executes. Each stage is timed
//! and recorded in `reports/runtime_report.json`; a failing stage stops
//! the run with its error captured in the report.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use geolink_core::error::GeolinkError;
use geolink_core::time::utc_now_iso;
use geolink_store::manifest::{build_manifest, write_manifest};

use crate::context::StageContext;
use crate::report::write_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Manifest,
    Ingest,
    Raw,
    Standard,
    Spatial,
    Link,
    Features,
    Model,
    Plots,
}

pub const STAGE_ORDER: [Stage; 9] = [
    Stage::Manifest,
    Stage::Ingest,
    Stage::Raw,
    Stage::Standard,
    Stage::Spatial,
    Stage::Link,
    Stage::Features,
    Stage::Model,
    Stage::Plots,
];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Manifest => "manifest",
            Stage::Ingest => "ingest",
            Stage::Raw => "raw",
            Stage::Standard => "standard",
            Stage::Spatial => "spatial",
            Stage::Link => "link",
            Stage::Features => "features",
            Stage::Model => "model",
            Stage::Plots => "plots",
        }
    }

    fn order_index(&self) -> usize {
        STAGE_ORDER
            .iter()
            .position(|stage| stage == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manifest" => Ok(Stage::Manifest),
            "ingest" => Ok(Stage::Ingest),
            "raw" => Ok(Stage::Raw),
            "standard" => Ok(Stage::Standard),
            "spatial" => Ok(Stage::Spatial),
            "link" => Ok(Stage::Link),
            "features" => Ok(Stage::Features),
            "model" => Ok(Stage::Model),
            "plots" => Ok(Stage::Plots),
            other => Err(anyhow!("unknown stage: {other}")),
        }
    }
}

/// Parse a comma-separated stage list, enforcing pipeline order. Failures
/// are configuration errors raised before any stage touches the disk.
pub fn parse_stages(spec: &str) -> Result<Vec<Stage>> {
    let stages: Vec<Stage> = spec
        .split(',')
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(|name| {
            Stage::from_str(name)
                .map_err(|err| GeolinkError::Config(err.to_string()).into())
        })
        .collect::<Result<_>>()?;
    if stages.is_empty() {
        return Err(GeolinkError::Config("no stages requested".to_string()).into());
    }
    let mut last = None;
    for stage in &stages {
        let index = stage.order_index();
        if let Some(previous) = last {
            if index < previous {
                let order = STAGE_ORDER
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(GeolinkError::Config(format!(
                    "stage order must follow {order}"
                ))
                .into());
            }
        }
        last = Some(index);
    }
    Ok(stages)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub start_utc: String,
    pub end_utc: String,
    pub duration_s: f64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn dispatch(ctx: &StageContext, stage: Stage) -> Result<()> {
    match stage {
        Stage::Manifest => {
            let manifest = build_manifest(&ctx.base_dir, &ctx.config, &ctx.run_id, &ctx.params_hash)?;
            write_manifest(
                &ctx.paths.manifests.join(format!("run_{}.json", ctx.run_id)),
                &manifest,
            )
        }
        Stage::Ingest => crate::ingest::run_ingest(ctx),
        Stage::Raw => crate::raw::run_raw(ctx),
        Stage::Standard => crate::standard::run_standard(ctx),
        Stage::Spatial => crate::spatial::run_spatial(ctx),
        Stage::Link => crate::link::run_link(ctx),
        Stage::Features => crate::features::run_features(ctx),
        Stage::Model => crate::model::run_model(ctx),
        Stage::Plots => crate::plots::run_plots(ctx),
    }
}

fn write_runtime_report(
    ctx: &StageContext,
    run_start: &str,
    timings: &[StageTiming],
    failed_stage: Option<&str>,
) -> Result<()> {
    let total_s: f64 = timings.iter().map(|t| t.duration_s).sum();
    write_json(
        &ctx.paths.reports.join("runtime_report.json"),
        &serde_json::json!({
            "run_id": ctx.run_id,
            "params_hash": ctx.params_hash,
            "start_utc": run_start,
            "end_utc": utc_now_iso(),
            "duration_s": total_s,
            "failed_stage": failed_stage,
            "stages": timings,
        }),
    )
}

/// Execute the requested stages in order, timing each. The runtime report
/// is written whether or not a stage fails; after a failure no further
/// stage runs.
pub fn run_stages(ctx: &StageContext, stages: &[Stage]) -> Result<Vec<StageTiming>> {
    if stages.is_empty() {
        bail!("no stages requested");
    }
    let run_start = utc_now_iso();
    let mut timings: Vec<StageTiming> = Vec::new();

    for stage in stages {
        info!(stage = stage.as_str(), "running stage");
        let start_utc = utc_now_iso();
        let tick = Instant::now();
        let result = dispatch(ctx, *stage);
        let duration_s = tick.elapsed().as_secs_f64();
        match result {
            Ok(()) => {
                timings.push(StageTiming {
                    stage: stage.as_str().to_string(),
                    start_utc,
                    end_utc: utc_now_iso(),
                    duration_s,
                    status: "ok".to_string(),
                    error: None,
                });
            }
            Err(err) => {
                error!(stage = stage.as_str(), error = %err, "stage failed");
                timings.push(StageTiming {
                    stage: stage.as_str().to_string(),
                    start_utc,
                    end_utc: utc_now_iso(),
                    duration_s,
                    status: "error".to_string(),
                    error: Some(err.to_string()),
                });
                write_runtime_report(ctx, &run_start, &timings, Some(stage.as_str()))?;
                return Err(GeolinkError::Stage {
                    stage: stage.as_str().to_string(),
                    message: err.to_string(),
                }
                .into());
            }
        }
    }
    write_runtime_report(ctx, &run_start, &timings, None)?;
    Ok(timings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_subset_must_be_ordered() {
        let stages = parse_stages("manifest,ingest,raw").unwrap();
        assert_eq!(stages, vec![Stage::Manifest, Stage::Ingest, Stage::Raw]);

        // Gaps are fine, reversals are not.
        assert!(parse_stages("ingest,link").is_ok());
        assert!(parse_stages("link,ingest").is_err());
        assert!(parse_stages("").is_err());
        assert!(parse_stages("warp").is_err());
    }

    #[test]
    fn duplicate_stage_is_allowed_by_order_check() {
        // Monotone, so re-running a stage in the same invocation passes
        // validation; the stage itself is idempotent.
        assert!(parse_stages("standard,standard").is_ok());
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in STAGE_ORDER {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
    }
}
