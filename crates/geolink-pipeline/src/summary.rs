//! Event summary rendering: a Markdown report assembled from the event
//! metadata, linked summary, top anomalies, and DQ notes, written into the
//! event package's `reports/` directory.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use geolink_store::layout::ensure_dir;

use crate::model::{read_anomalies, AnomalyRow};
use crate::report::load_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryFormat {
    Md,
    Html,
    Both,
}

impl SummaryFormat {
    pub fn from_name(name: &str) -> SummaryFormat {
        match name.to_ascii_lowercase().as_str() {
            "html" => SummaryFormat::Html,
            "both" => SummaryFormat::Both,
            _ => SummaryFormat::Md,
        }
    }
}

fn anomalies_table(anomalies: Option<&[AnomalyRow]>) -> String {
    let Some(rows) = anomalies else {
        return "No anomaly file".to_string();
    };
    if rows.is_empty() {
        return "No anomalies above threshold".to_string();
    }
    let mut table = String::from("| rank | source | station_id | feature | score |\n");
    table.push_str("| --- | --- | --- | --- | --- |\n");
    for row in rows {
        let _ = writeln!(
            table,
            "| {} | {} | {} | {} | {:.4} |",
            row.rank, row.source, row.station_id, row.feature, row.score
        );
    }
    table
}

fn plot_line(event_dir: &Path, name: &str) -> String {
    let path = event_dir.join("plots/html").join(name);
    if path.exists() {
        format!("[{name}](../plots/html/{name})")
    } else {
        format!("MISSING: {name}")
    }
}

fn pretty(value: Option<serde_json::Value>) -> String {
    value
        .map(|v| serde_json::to_string_pretty(&v).unwrap_or_else(|_| "{}".to_string()))
        .unwrap_or_else(|| "{}".to_string())
}

/// Render `reports/event_summary.md` (and the `<pre>` HTML wrapper when
/// requested) inside an assembled event directory. Returns the Markdown
/// path.
pub fn render_event_summary(
    event_dir: &Path,
    event_id: &str,
    format: SummaryFormat,
) -> Result<PathBuf> {
    let report_dir = event_dir.join("reports");
    ensure_dir(&report_dir)?;

    let event_meta = load_json(&event_dir.join("event.json")).unwrap_or(serde_json::json!({}));
    let linked_summary = load_json(&event_dir.join("linked/summary.json"));
    let anomalies = read_anomalies(&event_dir.join("features/anomaly.parquet"))?;

    let notes = serde_json::json!({
        "dq_event_link": load_json(&report_dir.join("dq_event_link.json")),
        "dq_event_features": load_json(&report_dir.join("dq_event_features.json")),
        "dq_plots": load_json(&report_dir.join("dq_plots.json")),
        "filter_effect": load_json(&report_dir.join("filter_effect.json")),
    });

    let text_field = |key: &str| {
        event_meta
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    let number_field = |key: &str| {
        event_meta
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_default()
    };

    let mut md = String::new();
    let _ = writeln!(md, "# Event summary: {event_id}");
    let _ = writeln!(md);
    let _ = writeln!(md, "- **Name**: {}", text_field("name"));
    let _ = writeln!(md, "- **Origin (UTC)**: {}", text_field("origin_time_utc"));
    let _ = writeln!(
        md,
        "- **Epicenter**: lat {}, lon {}",
        number_field("lat"),
        number_field("lon")
    );
    let _ = writeln!(md, "- **Pipeline version**: {}", text_field("pipeline_version"));
    let _ = writeln!(md, "- **Params hash**: `{}`", text_field("params_hash"));
    let _ = writeln!(md);
    let _ = writeln!(md, "## Linked data");
    let _ = writeln!(md);
    let _ = writeln!(md, "```json\n{}\n```", pretty(linked_summary));
    let _ = writeln!(md);
    let _ = writeln!(md, "## Top anomalies");
    let _ = writeln!(md);
    let _ = writeln!(md, "{}", anomalies_table(anomalies.as_deref()));
    let _ = writeln!(md);
    let _ = writeln!(md, "## Plots");
    let _ = writeln!(md);
    for name in [
        "plot_aligned_timeseries.html",
        "plot_station_map.html",
        "plot_filter_effect.html",
        "plot_vlf_spectrogram.html",
    ] {
        let _ = writeln!(md, "- {}", plot_line(event_dir, name));
    }
    let _ = writeln!(md);
    let _ = writeln!(md, "## Reproduce");
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "```\ngeolink run --stages link,features,model,plots --event_id {event_id}\n```"
    );
    let _ = writeln!(md);
    let _ = writeln!(md, "## DQ notes");
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "```json\n{}\n```",
        serde_json::to_string_pretty(&notes).unwrap_or_else(|_| "{}".to_string())
    );

    let md_path = report_dir.join("event_summary.md");
    std::fs::write(&md_path, &md)
        .with_context(|| format!("writing '{}'", md_path.display()))?;

    if matches!(format, SummaryFormat::Html | SummaryFormat::Both) {
        let html_path = report_dir.join("event_summary.html");
        std::fs::write(&html_path, format!("<pre>{md}</pre>"))
            .with_context(|| format!("writing '{}'", html_path.display()))?;
    }
    Ok(md_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_renders_with_missing_artifacts() {
        let dir = tempdir().unwrap();
        let event_dir = dir.path().join("ev1");
        std::fs::create_dir_all(&event_dir).unwrap();
        std::fs::write(
            event_dir.join("event.json"),
            serde_json::json!({
                "event_id": "ev1",
                "origin_time_utc": "2020-01-02T00:00:00Z",
                "lat": 35.0,
                "lon": 139.0,
                "params_hash": "abc123def456",
                "pipeline_version": "0.1.0",
            })
            .to_string(),
        )
        .unwrap();

        let path = render_event_summary(&event_dir, "ev1", SummaryFormat::Both).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# Event summary: ev1"));
        assert!(text.contains("abc123def456"));
        assert!(text.contains("No anomaly file"));
        assert!(text.contains("MISSING: plot_station_map.html"));
        assert!(event_dir.join("reports/event_summary.html").exists());
    }

    #[test]
    fn anomaly_table_formats_rows() {
        let rows = vec![AnomalyRow {
            rank: 1,
            source: "geomag".into(),
            station_id: "ABK".into(),
            feature: "mean".into(),
            score: 3.21,
        }];
        let table = anomalies_table(Some(&rows));
        assert!(table.contains("| 1 | geomag | ABK | mean | 3.2100 |"));
        assert_eq!(anomalies_table(Some(&[])), "No anomalies above threshold");
    }
}
