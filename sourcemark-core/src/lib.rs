use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default overlay color, matching the chat UI's citation badge tint.
pub const DEFAULT_HIGHLIGHT_COLOR: &str = "rgba(59, 130, 246, 0.3)";

/// Collapses runs of whitespace to single spaces, lowercases and trims.
///
/// Citation text and rendered fragment text both go through this before any
/// comparison, so fragment boundaries that split mid-word or carry layout
/// whitespace do not defeat matching.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        }
    }
    out
}

/// Axis-aligned rectangle in the renderer's coordinate space.
///
/// Fragment boxes arrive in viewport coordinates at the current zoom; a
/// highlight's rect is page-relative (origin at the page surface's top-left).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    /// A fragment box that has not been laid out yet reports zero area.
    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0 && self.width.is_finite() && self.height.is_finite()
    }

    pub fn union(&self, other: &Rect) -> Rect {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(left, top, right - left, bottom - top)
    }

    /// Re-expresses this rect relative to `origin`'s top-left corner.
    pub fn relative_to(&self, origin: &Rect) -> Rect {
        Rect::new(self.left - origin.left, self.top - origin.top, self.width, self.height)
    }

    /// Clamps this rect into `bounds`, keeping width/height non-negative.
    pub fn clamped_to(&self, bounds: &Rect) -> Rect {
        let left = self.left.clamp(bounds.left, bounds.right());
        let top = self.top.clamp(bounds.top, bounds.bottom());
        let right = self.right().clamp(bounds.left, bounds.right());
        let bottom = self.bottom().clamp(bounds.top, bounds.bottom());
        Rect::new(left, top, (right - left).max(0.0), (bottom - top).max(0.0))
    }
}

/// A caller-supplied request to highlight a quoted region of the document.
///
/// Identity is `(page, text)`; a new citation with either changed supersedes
/// the previous one. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub page: u32,
    pub text: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl Citation {
    pub fn new(page: u32, text: impl Into<String>) -> Self {
        Self {
            page,
            text: text.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.page >= 1 && !self.text.trim().is_empty()
    }

    pub fn same_request(&self, other: &Citation) -> bool {
        self.page == other.page && self.text == other.text
    }
}

/// The smallest unit of rendered text with a known position, as exposed by
/// the renderer collaborator.
///
/// Fragments are ephemeral: they are only valid until the page re-renders, so
/// nothing downstream may hold on to one. Matching consumes them by value and
/// persists only [`FragmentSnapshot`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextFragment {
    pub content: String,
    pub rect: Rect,
}

impl TextFragment {
    pub fn new(content: impl Into<String>, rect: Rect) -> Self {
        Self {
            content: content.into(),
            rect,
        }
    }
}

/// Value snapshot of a matched fragment: duplicated text plus the box it had
/// at capture time. This is all a highlight retains, which lets the
/// recalculation path re-locate the text after a full re-render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentSnapshot {
    pub original_text: String,
    pub original_rect: Rect,
}

impl FragmentSnapshot {
    pub fn capture(fragment: &TextFragment) -> Self {
        Self {
            original_text: fragment.content.clone(),
            original_rect: fragment.rect,
        }
    }
}

/// Which matching tier produced a result. Tier order is fixed; earlier tiers
/// are higher confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTier {
    /// Accumulation scan over a sliding window of consecutive fragments.
    WindowRun,
    /// A single fragment contains the whole target.
    WholeFragment,
    /// Longest-common-substring fallback; low confidence.
    Fuzzy,
}

/// Outcome of a successful match: the contributing fragment run and a score
/// in 0..=100. Consumed immediately to build a [`Highlight`].
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub page: u32,
    pub fragments: Vec<TextFragment>,
    pub score: f32,
    pub tier: MatchTier,
}

/// The resolved, displayable rectangle plus provenance for a citation.
///
/// `rect` is page-relative. `source_fragments` carries no live renderer
/// handles, only text and geometry snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub page: u32,
    pub rect: Rect,
    pub color: String,
    pub source_fragments: Vec<FragmentSnapshot>,
}

impl Highlight {
    /// Whether this highlight already answers `citation`, i.e. same page and
    /// the captured source text contains the citation text. Two citations can
    /// target the same page with different text, so page equality alone is
    /// not enough.
    pub fn covers(&self, citation: &Citation) -> bool {
        if self.page != citation.page {
            return false;
        }
        let captured = normalize_text(
            &self
                .source_fragments
                .iter()
                .map(|s| s.original_text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        captured.contains(&normalize_text(&citation.text))
    }
}

/// Continuous-scroll vs single-page presentation of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    Scroll,
    Page,
}

/// Navigation request handed to the renderer collaborator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollTarget {
    /// Bring the whole page into view, centered.
    Page(u32),
    /// Bring a page-relative region into view, centered.
    Region { page: u32, rect: Rect },
}

/// Notifications delivered to the caller, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    DocumentReady { page_count: u32 },
    PageChanged(u32),
    HighlightResolved { page: u32 },
    HighlightCleared,
}

/// Shared event buffer handed out to the caller.
pub type EventSink = Arc<Mutex<Vec<EngineEvent>>>;

/// Viewport changes that can invalidate a highlight's on-screen rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportEvent {
    Scrolled,
    Resized,
    ZoomChanged,
    ContentChanged,
}

/// Why a resolution pass did not produce (or finish producing) a highlight.
///
/// None of these surface to the caller as errors; they select between
/// retrying, abandoning and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("page {page} has no rendered fragments yet")]
    NotYetReady { page: u32 },
    #[error("no fragment run matched the citation text")]
    NoMatch,
    #[error("citation was superseded during resolution")]
    Superseded,
    #[error("degenerate fragment geometry on page {page}")]
    GeometryInvalid { page: u32 },
}

/// The paginated renderer collaborator.
///
/// The engine never parses document formats itself; it queries whatever the
/// renderer has produced so far. Every accessor may return `None` while the
/// corresponding surface is still rendering.
pub trait PageRenderer: Send + Sync {
    /// Total pages, once the document has loaded.
    fn page_count(&self) -> Option<u32>;

    /// The rendered text fragments of `page`, in reading order. `None` while
    /// the page's text layer has not been populated. Boxes are in viewport
    /// coordinates at the current zoom.
    fn fragments(&self, page: u32) -> Option<Vec<TextFragment>>;

    /// The page surface's own bounding box in viewport coordinates.
    fn page_surface_rect(&self, page: u32) -> Option<Rect>;

    /// The page most recently determined visible in scroll mode.
    fn visible_page(&self) -> u32;

    /// Executes a navigation request.
    fn scroll_to(&self, target: ScrollTarget);
}

/// Engine tunables.
///
/// The fuzzy threshold and window pruning factor were chosen empirically and
/// are not load-bearing contracts; callers with very short or highly
/// repetitive citations may want to adjust them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll cadence while a page's fragments are absent.
    pub poll_interval_ms: u64,
    /// Budget for the readiness poller before giving up silently.
    pub poll_deadline_ms: u64,
    /// Debounce window coalescing bursts of viewport events.
    pub recalc_debounce_ms: u64,
    /// How long the scroll orchestrator waits, in page mode, for a highlight
    /// to become locatable on a freshly shown page before falling back to a
    /// whole-page scroll.
    pub scroll_wait_ms: u64,
    /// Minimum fuzzy score (0..=100) to accept a tier-3 match.
    pub fuzzy_accept_score: f32,
    /// Minimum common-substring length considered by the fuzzy tier.
    pub min_common_run: usize,
    /// The accumulation window is pruned from the front once it grows past
    /// `prune factor x target length`.
    pub window_prune_factor: usize,
    /// Overlay color when the citation does not carry one.
    pub default_color: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            poll_deadline_ms: 1000,
            recalc_debounce_ms: 100,
            scroll_wait_ms: 1500,
            fuzzy_accept_score: 30.0,
            min_common_run: 4,
            window_prune_factor: 2,
            default_color: DEFAULT_HIGHLIGHT_COLOR.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_millis(self.poll_deadline_ms)
    }

    pub fn recalc_debounce(&self) -> Duration {
        Duration::from_millis(self.recalc_debounce_ms)
    }

    pub fn scroll_wait(&self) -> Duration {
        Duration::from_millis(self.scroll_wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Net\t Revenue\n increased "), "net revenue increased");
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn rect_union_covers_both() {
        let a = Rect::new(10.0, 10.0, 20.0, 5.0);
        let b = Rect::new(5.0, 12.0, 10.0, 10.0);
        let u = a.union(&b);
        assert_eq!(u, Rect::new(5.0, 10.0, 25.0, 12.0));
    }

    #[test]
    fn rect_relative_translates_origin() {
        let frag = Rect::new(120.0, 340.0, 60.0, 12.0);
        let page = Rect::new(100.0, 300.0, 800.0, 1000.0);
        assert_eq!(frag.relative_to(&page), Rect::new(20.0, 40.0, 60.0, 12.0));
    }

    #[test]
    fn rect_clamp_keeps_non_negative_extent() {
        let bounds = Rect::new(0.0, 0.0, 100.0, 100.0);
        let outside = Rect::new(150.0, -20.0, 30.0, 10.0);
        let clamped = outside.clamped_to(&bounds);
        assert!(clamped.width >= 0.0 && clamped.height >= 0.0);
        assert!(clamped.left >= bounds.left && clamped.right() <= bounds.right());
    }

    #[test]
    fn zero_area_rect_has_no_area() {
        assert!(!Rect::new(1.0, 1.0, 0.0, 5.0).has_area());
        assert!(!Rect::new(1.0, 1.0, 5.0, 0.0).has_area());
        assert!(Rect::new(1.0, 1.0, 0.1, 0.1).has_area());
    }

    #[test]
    fn highlight_covers_same_page_and_contained_text() {
        let highlight = Highlight {
            page: 3,
            rect: Rect::new(0.0, 0.0, 10.0, 10.0),
            color: DEFAULT_HIGHLIGHT_COLOR.to_string(),
            source_fragments: vec![
                FragmentSnapshot {
                    original_text: "Net revenue".to_string(),
                    original_rect: Rect::new(0.0, 0.0, 5.0, 5.0),
                },
                FragmentSnapshot {
                    original_text: "increased 12%".to_string(),
                    original_rect: Rect::new(5.0, 0.0, 5.0, 5.0),
                },
            ],
        };

        assert!(highlight.covers(&Citation::new(3, "net revenue increased")));
        assert!(!highlight.covers(&Citation::new(2, "net revenue increased")));
        assert!(!highlight.covers(&Citation::new(3, "gross margin declined")));
    }

    #[test]
    fn citation_identity_is_page_and_text() {
        let a = Citation::new(2, "alpha");
        let b = Citation::new(2, "alpha").with_color("red");
        let c = Citation::new(2, "beta");
        assert!(a.same_request(&b));
        assert!(!a.same_request(&c));
    }

    #[test]
    fn invalid_citations_are_rejected() {
        assert!(!Citation::new(0, "text").is_valid());
        assert!(!Citation::new(1, "   ").is_valid());
        assert!(Citation::new(1, "text").is_valid());
    }

    #[test]
    fn config_defaults_match_empirical_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.poll_deadline(), Duration::from_millis(1000));
        assert_eq!(config.recalc_debounce(), Duration::from_millis(100));
        assert_eq!(config.scroll_wait(), Duration::from_millis(1500));
        assert_eq!(config.fuzzy_accept_score, 30.0);
        assert_eq!(config.window_prune_factor, 2);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"poll_deadline_ms": 2000}"#).unwrap();
        assert_eq!(config.poll_deadline_ms, 2000);
        assert_eq!(config.poll_interval_ms, 50);
    }
}
