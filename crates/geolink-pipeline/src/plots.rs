//! Plot artifacts behind a renderer interface.
//!
//! Real plotting engines are external collaborators; the built-in
//! [`HtmlShellRenderer`] writes self-contained HTML shells with the
//! underlying JSON embedded, which keeps the event package complete
//! without dragging a charting stack into the core.

use anyhow::Result;

use geolink_store::layout::ensure_dir;

use crate::context::StageContext;
use crate::report::{load_json, write_dq_report};

pub trait PlotRenderer {
    /// Produce the document body for one plot from its payload.
    fn render(&self, title: &str, payload: &serde_json::Value) -> String;
}

/// Fallback renderer: a static page embedding the payload as JSON.
pub struct HtmlShellRenderer;

impl PlotRenderer for HtmlShellRenderer {
    fn render(&self, title: &str, payload: &serde_json::Value) -> String {
        let data = serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
             <body>\n<h1>{title}</h1>\n\
             <script type=\"application/json\" id=\"plot-data\">\n{data}\n</script>\n\
             <noscript>Data embedded above.</noscript>\n</body>\n</html>\n"
        )
    }
}

pub fn run_plots(ctx: &StageContext) -> Result<()> {
    run_plots_with(ctx, &HtmlShellRenderer)
}

pub fn run_plots_with(ctx: &StageContext, renderer: &dyn PlotRenderer) -> Result<()> {
    let event = ctx.event()?.clone();
    let html_dir = ctx.paths.plots.join("html").join(&event.event_id);
    let spec_dir = ctx.paths.plots.join("spec").join(&event.event_id);
    ensure_dir(&html_dir)?;
    ensure_dir(&spec_dir)?;

    let linked_dir = ctx.paths.linked_event(&event.event_id);
    let linked_summary =
        load_json(&linked_dir.join("summary.json")).unwrap_or(serde_json::json!({}));
    let stations = load_json(&linked_dir.join("stations.json")).unwrap_or(serde_json::json!({}));
    let filter_effect = load_json(&ctx.paths.reports.join("filter_effect.json"))
        .unwrap_or(serde_json::json!({}));

    let mut written = vec![
        "plot_aligned_timeseries.html",
        "plot_station_map.html",
        "plot_filter_effect.html",
    ];
    std::fs::write(
        html_dir.join("plot_aligned_timeseries.html"),
        renderer.render("Aligned time series", &linked_summary),
    )?;
    std::fs::write(
        html_dir.join("plot_station_map.html"),
        renderer.render("Station map", &stations),
    )?;
    std::fs::write(
        html_dir.join("plot_filter_effect.html"),
        renderer.render("Filter effect", &filter_effect),
    )?;

    let has_vlf = linked_summary
        .get("sources")
        .and_then(|sources| sources.get("vlf"))
        .is_some();
    if has_vlf {
        let catalog =
            load_json(&ctx.paths.raw.join("vlf_catalog.json")).unwrap_or(serde_json::json!([]));
        std::fs::write(
            html_dir.join("plot_vlf_spectrogram.html"),
            renderer.render("VLF spectrogram", &catalog),
        )?;
        written.push("plot_vlf_spectrogram.html");
    }

    write_dq_report(
        &spec_dir.join("dq_plots.json"),
        serde_json::json!({
            "event_id": event.event_id,
            "plots": written,
            "vlf_included": has_vlf,
        }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_renderer_embeds_payload() {
        let html = HtmlShellRenderer.render("Test plot", &serde_json::json!({"rows": 5}));
        assert!(html.contains("<title>Test plot</title>"));
        assert!(html.contains("\"rows\": 5"));
        assert!(html.starts_with("<!DOCTYPE html>"));
    }
}
