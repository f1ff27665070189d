//! End-to-end preview pipeline scenarios through the public API.

use simple_edit::config::EditorConfig;
use simple_edit::imaging::{FilterKind, ImageData, TextWatermark};
use simple_edit::preview::{PreviewOrchestrator, RenderOutcome, RenderPath};
use simple_edit::workers::{WorkerEvent, WorkerHandle, WorkerRequest, WorkerSpawner};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Workers that accept jobs and never answer.
struct Unresponsive;

struct UnresponsiveHandle;

impl WorkerHandle for UnresponsiveHandle {
    fn post(&mut self, _request: WorkerRequest) -> Result<(), String> {
        Ok(())
    }

    fn terminate(&mut self) {}
}

impl WorkerSpawner for Unresponsive {
    fn spawn(
        &self,
        _slot: usize,
        _worker_id: u64,
        _events: UnboundedSender<WorkerEvent>,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        Ok(Box::new(UnresponsiveHandle))
    }
}

fn config() -> EditorConfig {
    let mut config = EditorConfig::default();
    config.workers.pool_size = Some(1);
    config
}

fn red(size: u32) -> ImageData {
    ImageData::solid(size, size, [255, 0, 0, 255])
}

#[tokio::test(start_paused = true)]
async fn brightness_on_red_square() {
    let editor = PreviewOrchestrator::builder(config()).build();
    editor.load_image(red(100)).unwrap();
    editor.apply_filter(Some(FilterKind::Brightness), Some(50.0));
    editor.render_preview().await.unwrap();

    let frame = editor.current_frame().unwrap();
    for (x, y) in [(0, 0), (50, 50), (99, 99)] {
        assert_eq!(frame.pixel(x, y), [255, 50, 50, 255]);
    }
    editor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn debounced_edits_settle_to_last_value() {
    let editor = PreviewOrchestrator::builder(config()).build();
    editor.load_image(red(10)).unwrap();
    for v in [10.0, 25.0, 50.0] {
        editor.apply_filter(Some(FilterKind::Brightness), Some(v));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(editor.current_frame().unwrap().pixel(5, 5), [255, 50, 50, 255]);
    assert_eq!(editor.get_performance_metrics().preview.renders, 1);
    editor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn invisible_watermark_leaves_frame_untouched() {
    let editor = PreviewOrchestrator::builder(config()).build();
    editor.load_image(red(32)).unwrap();
    editor.apply_filter(Some(FilterKind::Sepia), Some(60.0));
    editor.render_preview().await.unwrap();
    let before = editor.current_frame().unwrap();

    editor.set_text_watermark(Some(TextWatermark {
        text: "draft".into(),
        opacity: 0.0,
        ..TextWatermark::default()
    }));
    editor.render_preview().await.unwrap();
    assert_eq!(*editor.current_frame().unwrap(), *before);
    editor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn second_identical_render_does_no_pixel_work() {
    let editor = PreviewOrchestrator::builder(config()).build();
    editor.load_image(red(16)).unwrap();
    editor.apply_preset("vintage").unwrap();
    editor.render_preview().await.unwrap();
    let first = editor.get_performance_metrics();

    assert_eq!(editor.render_preview().await.unwrap(), RenderOutcome::Skipped);
    let second = editor.get_performance_metrics();
    assert_eq!(second.preview.pixel_passes, first.preview.pixel_passes);
    assert_eq!(second.cache.hits, first.cache.hits + 1);
    editor.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unresponsive_worker_falls_back_after_timeout() {
    let mut config = config();
    config.preview.worker_cost_threshold = 1;
    config.workers.timeout_ms = 2_000;
    let editor = PreviewOrchestrator::builder(config)
        .spawner(Arc::new(Unresponsive))
        .build();
    editor.load_image(red(8)).unwrap();
    editor.apply_filter(Some(FilterKind::Brightness), Some(50.0));
    assert!(editor.should_use_worker());

    let started = tokio::time::Instant::now();
    let outcome = editor.render_preview().await.unwrap();
    assert_eq!(outcome, RenderOutcome::Rendered(RenderPath::Fallback));
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(editor.current_frame().unwrap().pixel(0, 0), [255, 50, 50, 255]);

    let metrics = editor.get_performance_metrics();
    assert_eq!(metrics.pool.unwrap().timeouts, 1);
    assert_eq!(metrics.preview.worker_failures, 1);
    editor.shutdown();
}
