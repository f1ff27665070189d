//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Render
//!
//! ```text
//! Rendered photo.jpg → photo-edit.png (1200x800, worker)
//!     Filters: brightness 50, sepia 40
//!     Transform: rotate 90, flip horizontal
//!     Watermark: text "(c) 2024"
//! Preview: 1 rendered, 0 skipped (0 direct, 1 worker, 0 fallback)
//!     Average: 42ms
//! Cache: 0 unchanged, 1 rendered (1 checks)
//! Workers: 2 slots, 1 completed, 0 failed, 0 timeouts, 0 restarts
//! Fallback: 0 runs, 0 operations
//! ```
//!
//! ## Presets
//!
//! ```text
//! Presets
//! 001 none
//! 002 vintage: brightness 10, contrast -10, saturation -20, sepia 40
//! ```
//!
//! # Architecture
//!
//! Each block has a `format_*` function (returns `Vec<String>`) for testability
//! and a `print_*` wrapper that writes to stdout. Format functions are pure:
//! no I/O, no side effects.

use crate::imaging::{FilterState, PRESET_NAMES, Transform, preset};
use crate::preview::PerformanceMetrics;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Format a filter value without a trailing `.0` for whole numbers.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

/// `brightness 50, sepia 40`, or `none` for a neutral state.
fn format_filters(filters: &FilterState) -> String {
    let parts: Vec<String> = filters
        .iter()
        .filter(|(_, v)| *v != 0.0)
        .map(|(k, v)| format!("{} {}", k, format_value(v)))
        .collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

fn format_transform(transform: &Transform) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(resize) = transform.resize {
        parts.push(format!("resize {}x{}", resize.width, resize.height));
    }
    if transform.rotation.degrees() != 0 {
        parts.push(format!("rotate {}", transform.rotation.degrees()));
    }
    if transform.flip_horizontal {
        parts.push("flip horizontal".to_string());
    }
    if transform.flip_vertical {
        parts.push("flip vertical".to_string());
    }
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 1 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}

// ============================================================================
// Render
// ============================================================================

/// What the render command did, for display.
pub struct RenderSummary<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub dimensions: (u32, u32),
    pub path: &'a str,
    pub filters: FilterState,
    pub transform: Transform,
    pub watermark_text: Option<&'a str>,
}

pub fn format_render_output(summary: &RenderSummary) -> Vec<String> {
    let mut lines = vec![format!(
        "Rendered {} → {} ({}x{}, {})",
        summary.input.display(),
        summary.output.display(),
        summary.dimensions.0,
        summary.dimensions.1,
        summary.path
    )];
    lines.push(format!(
        "{}Filters: {}",
        indent(1),
        format_filters(&summary.filters)
    ));
    if let Some(transform) = format_transform(&summary.transform) {
        lines.push(format!("{}Transform: {}", indent(1), transform));
    }
    if let Some(text) = summary.watermark_text {
        lines.push(format!("{}Watermark: text {:?}", indent(1), text));
    }
    lines
}

pub fn print_render_output(summary: &RenderSummary) {
    for line in format_render_output(summary) {
        println!("{}", line);
    }
}

// ============================================================================
// Metrics
// ============================================================================

pub fn format_metrics(metrics: &PerformanceMetrics) -> Vec<String> {
    let preview = &metrics.preview;
    let mut lines = vec![format!(
        "Preview: {} rendered, {} skipped ({} direct, {} worker, {} fallback)",
        preview.renders,
        preview.skipped,
        preview.direct_renders,
        preview.worker_renders,
        preview.fallback_renders
    )];
    if let Some(avg) = preview.average_render_time() {
        lines.push(format!("{}Average: {}", indent(1), format_duration(avg)));
    }
    if preview.worker_failures > 0 {
        lines.push(format!(
            "{}Worker retries: {}",
            indent(1),
            preview.worker_failures
        ));
    }
    if preview.failures > 0 {
        lines.push(format!("{}Failed: {}", indent(1), preview.failures));
    }
    lines.push(format!("Cache: {}", metrics.cache));
    match &metrics.pool {
        Some(pool) => lines.push(format!(
            "Workers: {} slots, {} completed, {} failed, {} timeouts, {} restarts",
            pool.size,
            pool.completed,
            pool.failed + pool.faults,
            pool.timeouts,
            pool.restarts
        )),
        None => lines.push("Workers: disabled".to_string()),
    }
    lines.push(format!(
        "Fallback: {} runs, {} operations",
        metrics.fallback.runs, metrics.fallback.operations_applied
    ));
    lines
}

pub fn print_metrics(metrics: &PerformanceMetrics) {
    for line in format_metrics(metrics) {
        println!("{}", line);
    }
}

// ============================================================================
// Presets
// ============================================================================

pub fn format_presets() -> Vec<String> {
    let mut lines = vec!["Presets".to_string()];
    for (i, name) in PRESET_NAMES.iter().enumerate() {
        let state = preset(name).unwrap_or_default();
        if state.is_neutral() {
            lines.push(format!("{} {}", format_index(i + 1), name));
        } else {
            lines.push(format!(
                "{} {}: {}",
                format_index(i + 1),
                name,
                format_filters(&state)
            ));
        }
    }
    lines
}

pub fn print_presets() {
    for line in format_presets() {
        println!("{}", line);
    }
}
