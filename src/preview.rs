//! Preview orchestration: the composition root of the editor core.
//!
//! The orchestrator owns every service object (cache, debounce, worker pool,
//! fallback, loading) and the document being edited. Edits mutate state and
//! request a preview; the request is debounced, and each tick that actually
//! runs goes through one render cycle:
//!
//! ```text
//! Idle ──► Deciding ──┬─► DirectPath ───┐
//!                     ├─► WorkerPath ───┼─► Committing ──► Idle
//!                     └─► FallbackPath ─┘
//! ```
//!
//! ## Deciding
//!
//! A tick is skipped when neither the filter state (by cache hash) nor the
//! document (by revision) changed since the last commit. Otherwise the base
//! image is redrawn from the source with the current transform and the filter
//! operations are priced at `pixels x operations`:
//!
//! | Cost | Path |
//! |---|---|
//! | below `worker_cost_threshold` | direct, on the calling task |
//! | at or above, pool available | [`WorkerPool`] |
//! | at or above, no pool | [`FallbackProcessor`] |
//!
//! A worker failure of any kind (timeout, fault, rejection) retries once on
//! the fallback with a freshly drawn base image. If that fails too, the user
//! gets one error and the last good frame stays on screen.
//!
//! ## Committing
//!
//! Watermarks are drawn on the calling task after the filters, never in a
//! worker. The frame is swapped in, the filter state is marked applied and
//! snapshotted under `"current"`.
//!
//! Renders never overlap: a tick waits for the previous one to commit.
//!
//! A filter's loading indicator is released by the first render that includes
//! its latest edit. Edits made while a render is running keep their controls
//! disabled until the next one.

use crate::cache::{CacheStats, FilterCache};
use crate::config::EditorConfig;
use crate::debounce::{DebounceOptions, DebounceStats, Debounced, SmartDebounce};
use crate::fallback::{FallbackExecutor, FallbackOptions, FallbackProcessor, FallbackStats};
use crate::host::{ControlPanel, FilterSource, Notifier};
use crate::imaging::{
    ApplyContext, FilterKind, FilterState, ImageData, ImageWatermark, Operation, Surface,
    SurfaceError, TextWatermark, Transform, apply_operation, apply_operations,
    calculate_render_cost, draw_base_image, preset, watermark,
};
use crate::loading::{GLOBAL, LoadingCoordinator};
use crate::lock;
use crate::workers::{
    DispatchOptions, PoolConfig, PoolStats, ThreadSpawner, WorkerPool, WorkerSpawner,
};
use ab_glyph::FontArc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Debounce key for preview renders.
const PREVIEW_KEY: &str = "preview";
/// Cache key of the committed state.
const CURRENT_STATE: &str = "current";

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("no image loaded")]
    NoImage,
    #[error("unknown preset: {0}")]
    UnknownPreset(String),
    #[error("preview failed on every path: {0}")]
    AllPathsFailed(String),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("export failed: {0}")]
    Export(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewPhase {
    Idle,
    Deciding,
    DirectPath,
    WorkerPath,
    FallbackPath,
    Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPath {
    Direct,
    Worker,
    Fallback,
}

impl RenderPath {
    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Worker => "worker",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Nothing changed since the last commit.
    Skipped,
    Rendered(RenderPath),
}

/// Zoom and pan. Display-only; changing it never re-renders.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub zoom: f32,
    pub pan_x: f32,
    pub pan_y: f32,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PreviewMetrics {
    /// Committed renders.
    pub renders: u64,
    /// Ticks skipped because nothing changed.
    pub skipped: u64,
    /// Pixel pipelines run, including failed attempts.
    pub pixel_passes: u64,
    pub direct_renders: u64,
    pub worker_renders: u64,
    pub fallback_renders: u64,
    /// Worker attempts that had to be retried on the fallback.
    pub worker_failures: u64,
    /// Ticks where every path failed.
    pub failures: u64,
    pub last_path: Option<RenderPath>,
    pub last_render: Option<Duration>,
    pub total_render_time: Duration,
}

impl PreviewMetrics {
    pub fn average_render_time(&self) -> Option<Duration> {
        u32::try_from(self.renders)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total_render_time / n)
    }
}

/// Everything [`PreviewOrchestrator::get_performance_metrics`] reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceMetrics {
    pub preview: PreviewMetrics,
    pub cache: CacheStats,
    pub debounce: DebounceStats,
    pub fallback: FallbackStats,
    /// `None` when running without workers.
    pub pool: Option<PoolStats>,
}

#[derive(Debug, Clone, Default)]
struct Document {
    source: Option<Arc<ImageData>>,
    transform: Transform,
    text_watermark: Option<TextWatermark>,
    image_watermark: Option<ImageWatermark>,
    revision: u64,
}

impl Document {
    fn touch(&mut self) {
        self.revision += 1;
    }

    /// Output dimensions after the transform.
    fn output_dimensions(&self) -> Option<(u32, u32)> {
        let source = self.source.as_ref()?;
        let (w, h) = self
            .transform
            .resize
            .map(|r| (r.width, r.height))
            .unwrap_or(source.dimensions());
        Some(if self.transform.rotation.degrees() % 180 == 0 {
            (w, h)
        } else {
            (h, w)
        })
    }

    fn watermark_operations(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        if let Some(text) = &self.text_watermark {
            ops.push(Operation::WatermarkText(text.clone()));
        }
        if let Some(image) = &self.image_watermark {
            ops.push(Operation::WatermarkImage(image.clone()));
        }
        ops
    }
}

/// Sequence of filter edits, and the last edit of each filter.
#[derive(Debug, Default)]
struct FilterEdits {
    seq: u64,
    latest: HashMap<FilterKind, u64>,
}

/// Builder for [`PreviewOrchestrator`]. Every collaborator is optional.
pub struct PreviewBuilder {
    config: EditorConfig,
    notifier: Option<Arc<dyn Notifier>>,
    controls: Option<Arc<dyn ControlPanel>>,
    filter_source: Option<Arc<dyn FilterSource>>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    fallback: Option<Arc<dyn FallbackExecutor>>,
    font: Option<FontArc>,
}

impl PreviewBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn controls(mut self, controls: Arc<dyn ControlPanel>) -> Self {
        self.controls = Some(controls);
        self
    }

    pub fn filter_source(mut self, source: Arc<dyn FilterSource>) -> Self {
        self.filter_source = Some(source);
        self
    }

    /// Replace the thread spawner used for the worker pool.
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Replace the calling-task processor built from `[fallback]`.
    pub fn fallback(mut self, fallback: Arc<dyn FallbackExecutor>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Font for text watermarks. Overrides `watermark.font_path`.
    pub fn font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    /// Start the services. Must run inside a tokio runtime.
    ///
    /// A pool that cannot start is logged and the orchestrator runs on the
    /// fallback alone, as it does with workers disabled.
    pub fn build(self) -> Arc<PreviewOrchestrator> {
        let config = self.config;
        let pool = if config.workers.enabled {
            let spawner = self.spawner.unwrap_or_else(|| Arc::new(ThreadSpawner));
            match WorkerPool::new(PoolConfig::from_config(&config.workers), spawner) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "worker pool unavailable, using fallback only");
                    None
                }
            }
        } else {
            None
        };

        let font = self.font.or_else(|| {
            let path = config.watermark.font_path.as_deref()?;
            watermark::load_font(path)
                .inspect_err(|e| warn!(path = %path.display(), error = %e, "font not loaded"))
                .ok()
        });

        let debounce = SmartDebounce::from_config(&config.debounce);
        let fallback = self.fallback.unwrap_or_else(|| {
            Arc::new(FallbackProcessor::from_config(
                &config.fallback,
                debounce.clock(),
            ))
        });
        let loading =
            LoadingCoordinator::from_config(&config.loading, self.notifier.clone(), self.controls);
        let cache = FilterCache::new(config.cache.clone());

        Arc::new_cyclic(|weak: &Weak<PreviewOrchestrator>| {
            let handle = weak.clone();
            let preview = debounce.intelligent(
                PREVIEW_KEY,
                move |()| {
                    let handle = handle.clone();
                    async move {
                        let Some(orchestrator) = handle.upgrade() else {
                            return;
                        };
                        if let Err(e) = orchestrator.render_preview().await {
                            debug!(error = %e, "debounced preview did not render");
                        }
                    }
                },
                config.debounce.delay(),
                DebounceOptions {
                    use_animation_frame: config.debounce.use_animation_frame,
                    on_cancel: None,
                },
            );
            PreviewOrchestrator {
                config,
                notifier: self.notifier,
                filter_source: self.filter_source,
                font,
                loading,
                debounce,
                pool,
                fallback,
                preview,
                cache: Mutex::new(cache),
                filters: Mutex::new(FilterState::default()),
                edits: Mutex::new(FilterEdits::default()),
                document: Mutex::new(Document::default()),
                rendered_revision: Mutex::new(None),
                frame: Mutex::new(None),
                view: Mutex::new(ViewState::default()),
                metrics: Mutex::new(PreviewMetrics::default()),
                phase: Mutex::new(PreviewPhase::Idle),
                render_gate: tokio::sync::Mutex::new(()),
            }
        })
    }
}

/// Owns the editing session. Created through [`PreviewOrchestrator::builder`].
pub struct PreviewOrchestrator {
    config: EditorConfig,
    notifier: Option<Arc<dyn Notifier>>,
    filter_source: Option<Arc<dyn FilterSource>>,
    font: Option<FontArc>,
    loading: LoadingCoordinator,
    debounce: SmartDebounce,
    pool: Option<WorkerPool>,
    fallback: Arc<dyn FallbackExecutor>,
    preview: Debounced<()>,
    cache: Mutex<FilterCache>,
    filters: Mutex<FilterState>,
    edits: Mutex<FilterEdits>,
    document: Mutex<Document>,
    rendered_revision: Mutex<Option<u64>>,
    frame: Mutex<Option<Arc<ImageData>>>,
    view: Mutex<ViewState>,
    metrics: Mutex<PreviewMetrics>,
    phase: Mutex<PreviewPhase>,
    render_gate: tokio::sync::Mutex<()>,
}

impl PreviewOrchestrator {
    pub fn builder(config: EditorConfig) -> PreviewBuilder {
        PreviewBuilder {
            config,
            notifier: None,
            controls: None,
            filter_source: None,
            spawner: None,
            fallback: None,
            font: None,
        }
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn loading(&self) -> &LoadingCoordinator {
        &self.loading
    }

    // -------------------------------------------------------------------------
    // Edits
    // -------------------------------------------------------------------------

    /// Replace the source image.
    pub fn load_image(&self, image: ImageData) -> Result<(), PreviewError> {
        image.validate()?;
        info!(width = image.width, height = image.height, "image loaded");
        {
            let mut doc = lock(&self.document);
            doc.source = Some(Arc::new(image));
            doc.touch();
        }
        lock(&self.cache).invalidate();
        self.request_preview();
        Ok(())
    }

    /// Update filters and request a preview.
    ///
    /// | `kind` | `value` | Effect |
    /// |---|---|---|
    /// | `Some` | `Some` | set that filter |
    /// | `Some` | `None` | copy that filter from the [`FilterSource`] |
    /// | `None` | any | copy every filter from the [`FilterSource`] |
    ///
    /// Values are clamped to the filter's range; non-finite values are ignored.
    pub fn apply_filter(&self, kind: Option<FilterKind>, value: Option<f64>) {
        let from_source = || self.filter_source.as_ref().map(|s| s.current_filters());
        match (kind, value) {
            (Some(kind), Some(value)) => self.set_filter(kind, value),
            (Some(kind), None) => match from_source() {
                Some(state) => self.set_filter(kind, state.get(kind)),
                None => warn!(filter = %kind, "no filter source, nothing to apply"),
            },
            (None, _) => match from_source() {
                Some(state) => {
                    let mut filters = lock(&self.filters);
                    for (kind, value) in state.iter() {
                        if value.is_finite() {
                            filters.set(kind, kind.clamp(value));
                        }
                    }
                }
                None => warn!("no filter source, nothing to apply"),
            },
        }
        self.request_preview();
    }

    fn set_filter(&self, kind: FilterKind, value: f64) {
        if !value.is_finite() {
            warn!(filter = %kind, value, "ignoring non-finite filter value");
            return;
        }
        lock(&self.filters).set(kind, kind.clamp(value));
        self.loading.show(kind.name(), &format!("Applying {kind}"));
        // Recorded after the value is set, so a render that sees this edit's
        // sequence number also sees its value.
        let mut edits = lock(&self.edits);
        edits.seq += 1;
        let seq = edits.seq;
        edits.latest.insert(kind, seq);
    }

    pub fn apply_preset(&self, name: &str) -> Result<(), PreviewError> {
        let state = preset(name).ok_or_else(|| PreviewError::UnknownPreset(name.to_string()))?;
        *lock(&self.filters) = state;
        debug!(preset = name, "preset applied");
        self.request_preview();
        Ok(())
    }

    /// Return every filter to neutral.
    pub fn reset(&self) {
        *lock(&self.filters) = FilterState::default();
        self.request_preview();
    }

    pub fn filters(&self) -> FilterState {
        *lock(&self.filters)
    }

    pub fn set_transform(&self, transform: Transform) {
        let mut doc = lock(&self.document);
        if doc.transform != transform {
            doc.transform = transform;
            doc.touch();
            drop(doc);
            self.request_preview();
        }
    }

    pub fn set_text_watermark(&self, watermark: Option<TextWatermark>) {
        {
            let mut doc = lock(&self.document);
            doc.text_watermark = watermark;
            doc.touch();
        }
        self.request_preview();
    }

    pub fn set_image_watermark(&self, watermark: Option<ImageWatermark>) {
        {
            let mut doc = lock(&self.document);
            doc.image_watermark = watermark;
            doc.touch();
        }
        self.request_preview();
    }

    pub fn set_view(&self, view: ViewState) {
        *lock(&self.view) = ViewState {
            zoom: view.zoom.clamp(0.1, 10.0),
            ..view
        };
    }

    pub fn view(&self) -> ViewState {
        *lock(&self.view)
    }

    // -------------------------------------------------------------------------
    // Rendering
    // -------------------------------------------------------------------------

    /// Schedule a debounced render. Returns false if the call was dropped.
    pub fn request_preview(&self) -> bool {
        self.preview.call(())
    }

    /// Whether the current document and filters would render on a worker.
    pub fn should_use_worker(&self) -> bool {
        if self.pool.is_none() {
            return false;
        }
        let Some(dimensions) = lock(&self.document).output_dimensions() else {
            return false;
        };
        let ops = lock(&self.filters).to_operations().len();
        calculate_render_cost(dimensions, ops) >= self.config.preview.worker_cost_threshold
    }

    pub fn phase(&self) -> PreviewPhase {
        *lock(&self.phase)
    }

    pub fn current_frame(&self) -> Option<Arc<ImageData>> {
        lock(&self.frame).clone()
    }

    /// Run one render cycle now, bypassing the debounce.
    pub async fn render_preview(&self) -> Result<RenderOutcome, PreviewError> {
        let _gate = self.render_gate.lock().await;

        let edit_seq = lock(&self.edits).seq;
        let filters = *lock(&self.filters);
        let doc = lock(&self.document).clone();
        let Some(source) = doc.source.clone() else {
            return Err(PreviewError::NoImage);
        };

        let filters_changed = lock(&self.cache).has_changed(&filters);
        let document_changed = *lock(&self.rendered_revision) != Some(doc.revision);
        if !filters_changed && !document_changed {
            lock(&self.metrics).skipped += 1;
            self.release_filter_tokens(edit_seq);
            debug!("preview unchanged, skipping");
            return Ok(RenderOutcome::Skipped);
        }

        self.set_phase(PreviewPhase::Deciding);
        self.loading.show(GLOBAL, "Updating preview");
        let started = Instant::now();
        let rendered = self.render(&source, &doc, &filters).await;
        self.loading.hide(GLOBAL);
        self.release_filter_tokens(edit_seq);

        let outcome = match rendered {
            Ok((frame, path)) => {
                self.set_phase(PreviewPhase::Committing);
                self.commit(frame, &filters, doc.revision, path, started.elapsed());
                Ok(RenderOutcome::Rendered(path))
            }
            Err(e) => {
                lock(&self.metrics).failures += 1;
                warn!(error = %e, "preview failed, keeping last frame");
                if let Some(notifier) = &self.notifier {
                    notifier.error("Could not update the preview; showing the last good result");
                }
                Err(e)
            }
        };
        self.set_phase(PreviewPhase::Idle);
        outcome
    }

    async fn render(
        &self,
        source: &ImageData,
        doc: &Document,
        filters: &FilterState,
    ) -> Result<(ImageData, RenderPath), PreviewError> {
        let base = draw_base_image(source, &doc.transform)?;
        let operations = filters.to_operations();
        let cost = calculate_render_cost(base.dimensions(), operations.len());
        let threshold = self.config.preview.worker_cost_threshold;

        let (pixels, path) = if cost < threshold {
            self.set_phase(PreviewPhase::DirectPath);
            lock(&self.metrics).pixel_passes += 1;
            let mut surface = Surface::new(base)?;
            apply_operations(&mut surface, &operations, &self.main_context(), |_| {});
            (surface.into_image_data(), RenderPath::Direct)
        } else if let Some(pool) = &self.pool {
            self.set_phase(PreviewPhase::WorkerPath);
            lock(&self.metrics).pixel_passes += 1;
            debug!(cost, threshold, "rendering on worker");
            match pool
                .dispatch(base, operations.clone(), DispatchOptions::default())
                .await
            {
                Ok(pixels) => (pixels, RenderPath::Worker),
                Err(worker_error) => {
                    warn!(error = %worker_error, "worker render failed, retrying on fallback");
                    lock(&self.metrics).worker_failures += 1;
                    let base = draw_base_image(source, &doc.transform)?;
                    let pixels = self.run_fallback(&base, &operations).await.map_err(|e| {
                        PreviewError::AllPathsFailed(format!("worker: {worker_error}; fallback: {e}"))
                    })?;
                    (pixels, RenderPath::Fallback)
                }
            }
        } else {
            let pixels = self
                .run_fallback(&base, &operations)
                .await
                .map_err(|e| PreviewError::AllPathsFailed(e.to_string()))?;
            (pixels, RenderPath::Fallback)
        };

        let watermarks = doc.watermark_operations();
        if watermarks.is_empty() {
            return Ok((pixels, path));
        }
        let mut surface = Surface::new(pixels)?;
        let ctx = self.main_context();
        for op in &watermarks {
            if let Err(e) = apply_operation(&mut surface, op, &ctx) {
                warn!(operation = %op.label(), error = %e, "watermark skipped");
            }
        }
        Ok((surface.into_image_data(), path))
    }

    async fn run_fallback(
        &self,
        base: &ImageData,
        operations: &[Operation],
    ) -> Result<ImageData, SurfaceError> {
        self.set_phase(PreviewPhase::FallbackPath);
        lock(&self.metrics).pixel_passes += 1;
        let options = FallbackOptions {
            context: self.main_context(),
            progress: None,
        };
        self.fallback.process(base, operations, options).await
    }

    fn commit(
        &self,
        frame: ImageData,
        filters: &FilterState,
        revision: u64,
        path: RenderPath,
        elapsed: Duration,
    ) {
        *lock(&self.frame) = Some(Arc::new(frame));
        *lock(&self.rendered_revision) = Some(revision);
        {
            let mut cache = lock(&self.cache);
            cache.mark_applied(filters);
            cache.save_state(
                CURRENT_STATE,
                filters,
                json!({ "revision": revision, "path": path.name() }),
            );
        }
        let mut metrics = lock(&self.metrics);
        metrics.renders += 1;
        match path {
            RenderPath::Direct => metrics.direct_renders += 1,
            RenderPath::Worker => metrics.worker_renders += 1,
            RenderPath::Fallback => metrics.fallback_renders += 1,
        }
        metrics.last_path = Some(path);
        metrics.last_render = Some(elapsed);
        metrics.total_render_time += elapsed;
        debug!(path = path.name(), ?elapsed, revision, "preview committed");
    }

    fn main_context(&self) -> ApplyContext {
        ApplyContext::main_thread(self.font.clone())
    }

    fn set_phase(&self, phase: PreviewPhase) {
        *lock(&self.phase) = phase;
    }

    /// Hide the indicators of filters whose latest edit is at or before `seq`.
    fn release_filter_tokens(&self, seq: u64) {
        let released: Vec<FilterKind> = {
            let mut edits = lock(&self.edits);
            let kinds: Vec<FilterKind> = edits
                .latest
                .iter()
                .filter(|&(_, &edit)| edit <= seq)
                .map(|(&kind, _)| kind)
                .collect();
            for kind in &kinds {
                edits.latest.remove(kind);
            }
            kinds
        };
        for kind in released {
            self.loading.hide(kind.name());
        }
    }

    // -------------------------------------------------------------------------
    // Reporting and lifecycle
    // -------------------------------------------------------------------------

    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            preview: *lock(&self.metrics),
            cache: lock(&self.cache).stats(),
            debounce: self.debounce.stats(),
            fallback: self.fallback.stats(),
            pool: self.pool.as_ref().map(WorkerPool::stats),
        }
    }

    /// Write the committed frame to `path`; the format follows the extension.
    pub fn export_frame(&self, path: &Path) -> Result<(), PreviewError> {
        let frame = self.current_frame().ok_or(PreviewError::NoImage)?;
        let buffer = (*frame).clone().into_rgba_image()?;
        buffer.save(path)?;
        info!(path = %path.display(), "frame exported");
        if let Some(notifier) = &self.notifier {
            notifier.success(&format!("Exported {}", path.display()));
        }
        Ok(())
    }

    /// Cancel pending renders, stop the workers, clear indicators.
    pub fn shutdown(&self) {
        self.debounce.cancel_all();
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
        self.loading.hide_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::{Placement, ResizeTarget, Rotation};
    use crate::test_helpers::{
        EchoSpawner, FailingFallback, RecordingControls, RecordingNotifier, RejectingSpawner,
        SilentSpawner, StaticFilterSource, solid,
    };
    use tokio::time::sleep;

    fn config(threshold: u64, workers: bool) -> EditorConfig {
        let mut config = EditorConfig::default();
        config.preview.worker_cost_threshold = threshold;
        config.workers.enabled = workers;
        config.workers.pool_size = Some(1);
        config.workers.timeout_ms = 100;
        config
    }

    fn direct_only() -> Arc<PreviewOrchestrator> {
        PreviewOrchestrator::builder(config(u64::MAX, false)).build()
    }

    // =========================================================================
    // Direct path and caching
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn brightness_on_red_renders_direct() {
        let editor = direct_only();
        editor.load_image(solid(100, 100, [255, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Brightness), Some(50.0));

        let outcome = editor.render_preview().await.unwrap();
        assert_eq!(outcome, RenderOutcome::Rendered(RenderPath::Direct));
        let frame = editor.current_frame().unwrap();
        assert_eq!(frame.pixel(50, 50), [255, 50, 50, 255]);
        assert_eq!(editor.phase(), PreviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_second_render_is_cache_hit() {
        let editor = direct_only();
        editor.load_image(solid(8, 8, [10, 20, 30, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Contrast), Some(30.0));
        editor.render_preview().await.unwrap();
        let passes = editor.get_performance_metrics().preview.pixel_passes;

        assert_eq!(editor.render_preview().await.unwrap(), RenderOutcome::Skipped);
        let metrics = editor.get_performance_metrics();
        assert_eq!(metrics.preview.pixel_passes, passes);
        assert_eq!(metrics.preview.skipped, 1);
        assert!(metrics.cache.hits >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn document_change_rerenders_with_same_filters() {
        let editor = direct_only();
        editor.load_image(solid(4, 2, [0, 0, 255, 255])).unwrap();
        editor.render_preview().await.unwrap();

        editor.set_transform(Transform {
            rotation: Rotation::Quarter,
            ..Transform::default()
        });
        assert!(matches!(
            editor.render_preview().await.unwrap(),
            RenderOutcome::Rendered(_)
        ));
        assert_eq!(editor.current_frame().unwrap().dimensions(), (2, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn view_changes_never_render() {
        let editor = direct_only();
        editor.load_image(solid(4, 4, [1, 2, 3, 255])).unwrap();
        editor.render_preview().await.unwrap();
        editor.set_view(ViewState {
            zoom: 50.0,
            pan_x: 3.0,
            pan_y: -1.0,
        });
        assert_eq!(editor.view().zoom, 10.0);
        assert_eq!(editor.render_preview().await.unwrap(), RenderOutcome::Skipped);
    }

    #[tokio::test]
    async fn render_without_image_fails() {
        let editor = direct_only();
        assert!(matches!(
            editor.render_preview().await,
            Err(PreviewError::NoImage)
        ));
    }

    // =========================================================================
    // Debounced requests
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_render_once() {
        let editor = direct_only();
        editor.load_image(solid(4, 4, [100, 100, 100, 255])).unwrap();
        for v in [10.0, 20.0, 30.0] {
            editor.apply_filter(Some(FilterKind::Brightness), Some(v));
            sleep(Duration::from_millis(20)).await;
        }
        sleep(Duration::from_millis(500)).await;

        let metrics = editor.get_performance_metrics();
        assert_eq!(metrics.preview.renders, 1);
        assert_eq!(editor.current_frame().unwrap().pixel(0, 0), [130, 130, 130, 255]);
        assert!(!editor.loading().has_any_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn filter_control_is_disabled_until_render() {
        let controls = Arc::new(RecordingControls::default());
        let editor = PreviewOrchestrator::builder(config(u64::MAX, false))
            .controls(controls.clone())
            .build();
        editor.load_image(solid(2, 2, [0, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Hue), Some(90.0));
        assert!(!controls.is_enabled(FilterKind::Hue));
        editor.render_preview().await.unwrap();
        assert!(controls.is_enabled(FilterKind::Hue));
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_render_keeps_its_control_disabled() {
        let controls = Arc::new(RecordingControls::default());
        let editor = PreviewOrchestrator::builder(config(1, true))
            .spawner(Arc::new(SilentSpawner))
            .controls(controls.clone())
            .build();
        editor.load_image(solid(4, 4, [0, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Brightness), Some(20.0));

        let rendering = Arc::clone(&editor);
        let render = tokio::spawn(async move { rendering.render_preview().await });
        sleep(Duration::from_millis(10)).await;
        assert_eq!(editor.phase(), PreviewPhase::WorkerPath);
        editor.apply_filter(Some(FilterKind::Contrast), Some(30.0));

        // the worker never answers; the fallback finishes this render
        render.await.unwrap().unwrap();
        assert!(controls.is_enabled(FilterKind::Brightness));
        assert!(!controls.is_enabled(FilterKind::Contrast));
        assert!(editor.loading().is_loading("contrast"));

        editor.render_preview().await.unwrap();
        assert!(controls.is_enabled(FilterKind::Contrast));
        assert!(!editor.loading().is_loading("contrast"));
    }

    // =========================================================================
    // Filter sources and presets
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn apply_filter_without_args_reads_source() {
        let state = FilterState::default()
            .with(FilterKind::Invert, 100.0)
            .with(FilterKind::Brightness, 500.0);
        let editor = PreviewOrchestrator::builder(config(u64::MAX, false))
            .filter_source(Arc::new(StaticFilterSource(state)))
            .build();
        editor.apply_filter(None, None);
        let filters = editor.filters();
        assert_eq!(filters.invert, 100.0);
        assert_eq!(filters.brightness, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn presets_and_reset() {
        let editor = direct_only();
        editor.apply_preset("vintage").unwrap();
        assert_eq!(editor.filters(), preset("vintage").unwrap());
        assert!(matches!(
            editor.apply_preset("nope"),
            Err(PreviewError::UnknownPreset(_))
        ));
        editor.reset();
        assert!(editor.filters().is_neutral());
    }

    // =========================================================================
    // Path selection
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn expensive_render_goes_to_worker() {
        let editor = PreviewOrchestrator::builder(config(10, true))
            .spawner(Arc::new(EchoSpawner::default()))
            .build();
        editor.load_image(solid(4, 4, [9, 9, 9, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Sepia), Some(50.0));
        assert!(editor.should_use_worker());
        assert_eq!(
            editor.render_preview().await.unwrap(),
            RenderOutcome::Rendered(RenderPath::Worker)
        );
        assert_eq!(editor.get_performance_metrics().pool.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_timeout_retries_on_fallback() {
        let notifier = Arc::new(RecordingNotifier::default());
        let editor = PreviewOrchestrator::builder(config(10, true))
            .spawner(Arc::new(SilentSpawner))
            .notifier(notifier.clone())
            .build();
        editor.load_image(solid(4, 4, [255, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Brightness), Some(50.0));

        assert_eq!(
            editor.render_preview().await.unwrap(),
            RenderOutcome::Rendered(RenderPath::Fallback)
        );
        assert_eq!(editor.current_frame().unwrap().pixel(0, 0), [255, 50, 50, 255]);
        let metrics = editor.get_performance_metrics();
        assert_eq!(metrics.preview.worker_failures, 1);
        assert_eq!(metrics.pool.unwrap().timeouts, 1);
        assert!(notifier.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_and_fallback_failure_keeps_last_frame() {
        let notifier = Arc::new(RecordingNotifier::default());
        let editor = PreviewOrchestrator::builder(config(20, true))
            .spawner(Arc::new(RejectingSpawner))
            .fallback(Arc::new(FailingFallback))
            .notifier(notifier.clone())
            .build();
        editor.load_image(solid(4, 4, [255, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Brightness), Some(50.0));
        // 16 pixels x 1 operation stays direct
        assert_eq!(
            editor.render_preview().await.unwrap(),
            RenderOutcome::Rendered(RenderPath::Direct)
        );
        let before = editor.current_frame().unwrap();

        editor.apply_filter(Some(FilterKind::Invert), Some(100.0));
        assert!(editor.should_use_worker());
        let err = editor.render_preview().await.unwrap_err();
        assert!(matches!(err, PreviewError::AllPathsFailed(_)));
        assert_eq!(notifier.errors().len(), 1);
        assert!(Arc::ptr_eq(&editor.current_frame().unwrap(), &before));

        let metrics = editor.get_performance_metrics();
        assert_eq!(metrics.preview.renders, 1);
        assert_eq!(metrics.preview.failures, 1);
        assert_eq!(metrics.preview.worker_failures, 1);
        assert_eq!(metrics.pool.unwrap().failed, 1);
        assert_eq!(editor.phase(), PreviewPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn no_pool_uses_fallback() {
        let editor = PreviewOrchestrator::builder(config(1, false)).build();
        editor.load_image(solid(4, 4, [0, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Invert), Some(100.0));
        assert!(!editor.should_use_worker());
        assert_eq!(
            editor.render_preview().await.unwrap(),
            RenderOutcome::Rendered(RenderPath::Fallback)
        );
        assert_eq!(editor.current_frame().unwrap().pixel(3, 3), [255, 255, 255, 255]);
    }

    // =========================================================================
    // Watermarks and export
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn transparent_text_watermark_is_bit_identical() {
        let editor = direct_only();
        editor.load_image(solid(16, 16, [40, 80, 120, 255])).unwrap();
        editor.render_preview().await.unwrap();
        let before = editor.current_frame().unwrap();

        editor.set_text_watermark(Some(TextWatermark {
            text: "(c) me".into(),
            opacity: 0.0,
            ..TextWatermark::default()
        }));
        editor.render_preview().await.unwrap();
        assert_eq!(*editor.current_frame().unwrap(), *before);
    }

    #[tokio::test(start_paused = true)]
    async fn image_watermark_is_drawn_after_filters() {
        let editor = direct_only();
        editor.load_image(solid(4, 4, [0, 0, 0, 255])).unwrap();
        editor.apply_filter(Some(FilterKind::Invert), Some(100.0));
        editor.set_image_watermark(Some(ImageWatermark {
            image: solid(1, 1, [255, 0, 0, 255]),
            opacity: 1.0,
            scale: None,
            placement: Placement::TopLeft,
            margin: 0,
        }));
        editor.render_preview().await.unwrap();
        let frame = editor.current_frame().unwrap();
        // invert ran first; the overlay is untouched by it
        assert_eq!(frame.pixel(0, 0), [255, 0, 0, 255]);
        assert_eq!(frame.pixel(3, 3), [255, 255, 255, 255]);
    }

    #[tokio::test(start_paused = true)]
    async fn resize_changes_output_dimensions() {
        let editor = direct_only();
        editor.load_image(solid(8, 8, [0, 0, 0, 255])).unwrap();
        editor.set_transform(Transform {
            resize: Some(ResizeTarget {
                width: 4,
                height: 2,
            }),
            ..Transform::default()
        });
        editor.render_preview().await.unwrap();
        assert_eq!(editor.current_frame().unwrap().dimensions(), (4, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn export_writes_png() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.png");
        let notifier = Arc::new(RecordingNotifier::default());
        let editor = PreviewOrchestrator::builder(config(u64::MAX, false))
            .notifier(notifier.clone())
            .build();
        assert!(matches!(editor.export_frame(&path), Err(PreviewError::NoImage)));
        editor.load_image(solid(3, 3, [1, 2, 3, 255])).unwrap();
        editor.render_preview().await.unwrap();
        editor.export_frame(&path).unwrap();
        assert_eq!(notifier.successes().len(), 1);
        let reloaded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(reloaded.dimensions(), (3, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_preview() {
        let editor = PreviewOrchestrator::builder(config(10, true))
            .spawner(Arc::new(EchoSpawner::default()))
            .build();
        editor.load_image(solid(2, 2, [0, 0, 0, 255])).unwrap();
        editor.shutdown();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(editor.get_performance_metrics().preview.renders, 0);
        assert!(editor.get_performance_metrics().pool.is_some());
    }
}
