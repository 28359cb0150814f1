use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::Deserialize;
use sourcemark_core::{
    Citation, DisplayMode, EngineConfig, PageRenderer, Rect, ScrollTarget, TextFragment,
    ViewportEvent,
};
use sourcemark_engine::HighlightEngine;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "sourcemark",
    version,
    about = "replay a scripted document against the source-highlight engine"
)]
struct Args {
    /// Document script (JSON) describing pages and their rendered fragments
    #[arg(long)]
    script: PathBuf,

    /// 1-based page the citation claims to quote from
    #[arg(short, long)]
    page: u32,

    /// Cited text to locate
    #[arg(short, long)]
    text: String,

    /// Overlay color for the highlight
    #[arg(long)]
    color: Option<String>,

    /// Display mode: "scroll" or "page"
    #[arg(long, default_value = "scroll")]
    mode: String,

    /// Issue a scroll-to-highlight request with this key after resolution
    #[arg(long)]
    scroll_key: Option<u64>,

    /// Re-lay the document out at this scale factor after resolution and
    /// recalculate the highlight
    #[arg(long)]
    zoom: Option<f32>,

    /// Engine tunables (JSON); defaults are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,
}

/// A fake document: pages with pre-scripted fragments, each optionally
/// becoming available only after a delay, so the poller has something real
/// to wait on.
#[derive(Debug, Deserialize)]
struct DocumentScript {
    #[serde(default = "default_visible_page")]
    visible_page: u32,
    pages: Vec<ScriptPage>,
}

fn default_visible_page() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ScriptPage {
    surface: Rect,
    #[serde(default)]
    fragments: Vec<TextFragment>,
    /// Milliseconds after startup before this page's text layer exists.
    #[serde(default)]
    delay_ms: u64,
}

struct ScriptedRenderer {
    started: Instant,
    visible_page: u32,
    pages: Mutex<Vec<ScriptPage>>,
    navigations: Mutex<Vec<ScrollTarget>>,
}

impl ScriptedRenderer {
    fn new(script: DocumentScript) -> Self {
        Self {
            started: Instant::now(),
            visible_page: script.visible_page,
            pages: Mutex::new(script.pages),
            navigations: Mutex::new(Vec::new()),
        }
    }

    fn page_ready(&self, page: &ScriptPage) -> bool {
        self.started.elapsed() >= Duration::from_millis(page.delay_ms)
    }

    /// Re-lays every page out at `factor`, as a zoom change would.
    fn rescale(&self, factor: f32) {
        let mut pages = self.pages.lock();
        for page in pages.iter_mut() {
            page.surface = scale_rect(&page.surface, factor);
            for fragment in page.fragments.iter_mut() {
                fragment.rect = scale_rect(&fragment.rect, factor);
            }
        }
    }

    fn navigations(&self) -> Vec<ScrollTarget> {
        self.navigations.lock().clone()
    }
}

fn scale_rect(rect: &Rect, factor: f32) -> Rect {
    Rect::new(
        rect.left * factor,
        rect.top * factor,
        rect.width * factor,
        rect.height * factor,
    )
}

impl PageRenderer for ScriptedRenderer {
    fn page_count(&self) -> Option<u32> {
        Some(self.pages.lock().len() as u32)
    }

    fn fragments(&self, page: u32) -> Option<Vec<TextFragment>> {
        let pages = self.pages.lock();
        let page = pages.get((page as usize).checked_sub(1)?)?;
        if !self.page_ready(page) {
            return None;
        }
        Some(page.fragments.clone())
    }

    fn page_surface_rect(&self, page: u32) -> Option<Rect> {
        let pages = self.pages.lock();
        let page = pages.get((page as usize).checked_sub(1)?)?;
        if !self.page_ready(page) {
            return None;
        }
        Some(page.surface)
    }

    fn visible_page(&self) -> u32 {
        self.visible_page
    }

    fn scroll_to(&self, target: ScrollTarget) {
        info!(?target, "navigation request");
        self.navigations.lock().push(target);
    }
}

fn describe(target: &ScrollTarget) -> String {
    match target {
        ScrollTarget::Page(page) => format!("page {}", page),
        ScrollTarget::Region { page, rect } => format!(
            "region {} [x {:.1}, y {:.1}, w {:.1}, h {:.1}]",
            page, rect.left, rect.top, rect.width, rect.height
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    let mode = match args.mode.as_str() {
        "scroll" => DisplayMode::Scroll,
        "page" => DisplayMode::Page,
        other => return Err(anyhow!("unknown display mode {:?}", other)),
    };

    let config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {:?}", path))?;
            serde_json::from_str::<EngineConfig>(&raw)
                .with_context(|| format!("failed to decode config {:?}", path))?
        }
        None => EngineConfig::default(),
    };

    let raw = fs::read_to_string(&args.script)
        .with_context(|| format!("failed to read script {:?}", args.script))?;
    let script: DocumentScript = serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode script {:?}", args.script))?;

    let renderer = Arc::new(ScriptedRenderer::new(script));
    let engine = HighlightEngine::new(Arc::clone(&renderer), config);
    engine.notify_document_ready();
    engine.set_display_mode(mode);

    let mut citation = Citation::new(args.page, args.text.clone());
    if let Some(color) = &args.color {
        citation = citation.with_color(color.clone());
    }
    engine.set_citation(citation).await;

    if let Some(factor) = args.zoom {
        renderer.rescale(factor);
        engine.notify_viewport_event(ViewportEvent::ZoomChanged).await;
    }

    if let Some(key) = args.scroll_key {
        engine.request_scroll(key).await;
    }

    let navigations: Vec<String> = renderer.navigations().iter().map(describe).collect();
    let report = serde_json::json!({
        "highlight": engine.highlight(),
        "navigations": navigations,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_logging() -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let appender = ProjectDirs::from("io", "sourcemark", "sourcemark").and_then(|dirs| {
        let log_dir = dirs.data_local_dir().join("logs");
        fs::create_dir_all(&log_dir).ok()?;
        Some(tracing_appender::rolling::never(log_dir, "sourcemark.log"))
    });

    match appender {
        Some(appender) => {
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(file_layer)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .init();
            None
        }
    }
}
