//! The coordination layer: given a citation, locate it on its page once the
//! renderer has produced text fragments, keep the resulting highlight
//! geometrically correct across zoom/scroll/re-render, and drive one-shot
//! scroll-to-highlight navigation.
//!
//! Everything runs on the caller's event loop; "concurrency" here is
//! interleaved async callbacks, not threads. Logical races (a slow lookup
//! overwriting the result for a newer citation) are prevented by comparing
//! the in-flight request against the engine's most recently stored citation
//! by reference identity, never by queueing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sourcemark_core::{
    Citation, DisplayMode, EngineConfig, EngineEvent, EventSink, FragmentSnapshot, Highlight,
    PageRenderer, ResolveError, ScrollTarget, ViewportEvent,
};
use sourcemark_match::{find_match, relocate_region, resolve_region, MatchTuning};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

/// One step of a bounded retry loop.
pub enum Attempt<T> {
    /// The awaited condition holds; stop with this value.
    Ready(T),
    /// Not there yet; try again after the interval.
    NotReady,
    /// The loop's reason to exist is gone; stop without a value.
    Abort,
}

/// How a [`retry_until`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Ready(T),
    Aborted,
    TimedOut,
}

/// Polls `attempt` at `interval` until it produces a value, aborts, or
/// `deadline` elapses. The first attempt runs immediately.
///
/// Shared by the readiness poller and the scroll orchestrator's bounded wait.
pub async fn retry_until<T, F>(
    mut attempt: F,
    interval: Duration,
    deadline: Duration,
) -> RetryOutcome<T>
where
    F: FnMut() -> Attempt<T>,
{
    let give_up_at = Instant::now() + deadline;
    loop {
        match attempt() {
            Attempt::Ready(value) => return RetryOutcome::Ready(value),
            Attempt::Abort => return RetryOutcome::Aborted,
            Attempt::NotReady => {}
        }
        let now = Instant::now();
        if now >= give_up_at {
            return RetryOutcome::TimedOut;
        }
        sleep(interval.min(give_up_at - now)).await;
    }
}

#[derive(Debug)]
struct EngineState {
    mode: DisplayMode,
    current_page: u32,
    page_count: Option<u32>,
    /// Most recently requested citation. Retries hold their own `Arc` and
    /// compare against this by pointer to detect supersession.
    active: Option<Arc<Citation>>,
    /// The single active highlight (set of size 0 or 1).
    highlight: Option<Highlight>,
    handled_scroll_keys: HashSet<u64>,
    /// A scroll key observed before any highlight existed; re-attempted when
    /// resolution completes.
    pending_scroll_key: Option<u64>,
    /// Bumped per viewport trigger; lets the debounce discard stale wakeups.
    recalc_epoch: u64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Scroll,
            current_page: 1,
            page_count: None,
            active: None,
            highlight: None,
            handled_scroll_keys: HashSet::new(),
            pending_scroll_key: None,
            recalc_epoch: 0,
        }
    }
}

/// The engine facade. Cheap to clone; clones share state, so the caller can
/// hand one to each event source.
pub struct HighlightEngine<R> {
    renderer: Arc<R>,
    config: EngineConfig,
    tuning: MatchTuning,
    state: Arc<Mutex<EngineState>>,
    events: EventSink,
}

impl<R> Clone for HighlightEngine<R> {
    fn clone(&self) -> Self {
        Self {
            renderer: Arc::clone(&self.renderer),
            config: self.config.clone(),
            tuning: self.tuning,
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
        }
    }
}

impl<R: PageRenderer> HighlightEngine<R> {
    pub fn new(renderer: Arc<R>, config: EngineConfig) -> Self {
        let tuning = MatchTuning::from(&config);
        Self {
            renderer,
            config,
            tuning,
            state: Arc::new(Mutex::new(EngineState::default())),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared buffer of notifications for the caller, in arrival order.
    pub fn events(&self) -> EventSink {
        Arc::clone(&self.events)
    }

    pub fn highlight(&self) -> Option<Highlight> {
        self.state.lock().highlight.clone()
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.state.lock().mode
    }

    pub fn current_page(&self) -> u32 {
        self.state.lock().current_page
    }

    pub fn page_count(&self) -> Option<u32> {
        self.state.lock().page_count
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }

    fn is_active(&self, request: &Arc<Citation>) -> bool {
        match &self.state.lock().active {
            Some(current) => Arc::ptr_eq(current, request),
            None => false,
        }
    }

    /// To be called once the renderer knows the document's page count.
    pub fn notify_document_ready(&self) {
        let Some(page_count) = self.renderer.page_count() else {
            debug!("renderer signalled ready without a page count");
            return;
        };
        let mut to_emit = vec![EngineEvent::DocumentReady { page_count }];
        {
            let mut state = self.state.lock();
            state.page_count = Some(page_count);
            let clamped = state.current_page.clamp(1, page_count.max(1));
            if clamped != state.current_page {
                state.current_page = clamped;
                to_emit.push(EngineEvent::PageChanged(clamped));
            }
        }
        for event in to_emit {
            self.emit(event);
        }
    }

    /// Full reset on document change: drops the citation, the highlight and
    /// all scroll bookkeeping. The display mode is a viewer preference and
    /// survives.
    pub fn reset(&self) {
        let cleared = {
            let mut state = self.state.lock();
            let mode = state.mode;
            let had_highlight = state.highlight.is_some();
            *state = EngineState {
                mode,
                ..EngineState::default()
            };
            had_highlight
        };
        if cleared {
            self.emit(EngineEvent::HighlightCleared);
        }
    }

    /// Installs `citation` as the active one and drives resolution to
    /// completion. Any in-flight resolution for an older citation observes
    /// the replacement and abandons itself without writing.
    #[instrument(skip(self, citation), fields(page = citation.page))]
    pub async fn set_citation(&self, citation: Citation) {
        if !citation.is_valid() {
            debug!("ignoring invalid citation");
            return;
        }
        let request = Arc::new(citation);
        self.state.lock().active = Some(Arc::clone(&request));
        self.resolve(request).await;
    }

    /// Drops the active citation; the highlight set empties in the same
    /// update cycle.
    pub fn clear_citation(&self) {
        let cleared = {
            let mut state = self.state.lock();
            state.active = None;
            state.highlight.take().is_some()
        };
        if cleared {
            self.emit(EngineEvent::HighlightCleared);
        }
    }

    /// Switches between continuous-scroll and single-page presentation.
    ///
    /// Scroll to Page snaps the current page to whatever the renderer last
    /// reported visible; a highlight that does not belong to that page is
    /// suppressed. Page to Scroll needs no page change, the continuous layout
    /// shows every page.
    pub fn set_display_mode(&self, mode: DisplayMode) {
        let mut to_emit = Vec::new();
        {
            let mut state = self.state.lock();
            if state.mode == mode {
                return;
            }
            if state.mode == DisplayMode::Scroll && mode == DisplayMode::Page {
                let visible = self.renderer.visible_page();
                if visible != state.current_page {
                    state.current_page = visible;
                    to_emit.push(EngineEvent::PageChanged(visible));
                }
                let off_page = state
                    .highlight
                    .as_ref()
                    .is_some_and(|h| h.page != state.current_page);
                if off_page {
                    state.highlight = None;
                    to_emit.push(EngineEvent::HighlightCleared);
                }
            }
            state.mode = mode;
        }
        for event in to_emit {
            self.emit(event);
        }
    }

    /// Shows `page` (clamped to the document). In page mode a highlight left
    /// behind on another page is cleared rather than rendered out of place.
    pub fn set_page(&self, page: u32) {
        let mut to_emit = Vec::new();
        {
            let mut state = self.state.lock();
            let max = state.page_count.unwrap_or(u32::MAX).max(1);
            let next = page.clamp(1, max);
            if next == state.current_page {
                return;
            }
            state.current_page = next;
            to_emit.push(EngineEvent::PageChanged(next));
            if state.mode == DisplayMode::Page {
                let off_page = state.highlight.as_ref().is_some_and(|h| h.page != next);
                if off_page {
                    state.highlight = None;
                    to_emit.push(EngineEvent::HighlightCleared);
                }
            }
        }
        for event in to_emit {
            self.emit(event);
        }
    }

    pub fn next_page(&self) {
        let current = self.current_page();
        self.set_page(current.saturating_add(1));
    }

    pub fn prev_page(&self) {
        let current = self.current_page();
        self.set_page(current.saturating_sub(1).max(1));
    }

    async fn resolve(&self, request: Arc<Citation>) {
        let mut to_emit = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(count) = state.page_count {
                if request.page > count {
                    debug!(count, "citation page beyond document, skipping");
                    return;
                }
            }
            // Two citations can target the same page with different text, so
            // the redundant-work check compares captured source text too.
            if state
                .highlight
                .as_ref()
                .is_some_and(|h| h.covers(request.as_ref()))
            {
                debug!("existing highlight already covers this citation");
                return;
            }
            // Viewport synchronizer: in page mode the citation's page must be
            // shown before any match attempt starts.
            if state.mode == DisplayMode::Page && state.current_page != request.page {
                state.current_page = request.page;
                if state.highlight.take().is_some() {
                    to_emit.push(EngineEvent::HighlightCleared);
                }
                to_emit.push(EngineEvent::PageChanged(request.page));
            }
        }
        for event in to_emit {
            self.emit(event);
        }

        // Readiness poller: fragments populate asynchronously after the page
        // surface is requested.
        let outcome = retry_until(
            || {
                if !self.is_active(&request) {
                    return Attempt::Abort;
                }
                let Some(page_rect) = self.renderer.page_surface_rect(request.page) else {
                    return Attempt::NotReady;
                };
                match self.renderer.fragments(request.page) {
                    Some(fragments) if !fragments.is_empty() => {
                        Attempt::Ready((page_rect, fragments))
                    }
                    _ => Attempt::NotReady,
                }
            },
            self.config.poll_interval(),
            self.config.poll_deadline(),
        )
        .await;

        let (page_rect, fragments) = match outcome {
            RetryOutcome::Ready(value) => value,
            RetryOutcome::Aborted => {
                debug!("{}", ResolveError::Superseded);
                return;
            }
            RetryOutcome::TimedOut => {
                debug!("{}", ResolveError::NotYetReady { page: request.page });
                return;
            }
        };

        let Some(result) = find_match(request.page, &request.text, &fragments, &self.tuning)
        else {
            debug!("{}", ResolveError::NoMatch);
            self.clear_highlight_for(&request);
            return;
        };
        let Some(rect) = resolve_region(&result.fragments, &page_rect) else {
            warn!("{}", ResolveError::GeometryInvalid { page: request.page });
            return;
        };

        let highlight = Highlight {
            page: request.page,
            rect,
            color: request
                .color
                .clone()
                .unwrap_or_else(|| self.config.default_color.clone()),
            source_fragments: result
                .fragments
                .iter()
                .map(FragmentSnapshot::capture)
                .collect(),
        };

        // Last gate before the write: a newer citation may have arrived while
        // the poller slept.
        {
            let mut state = self.state.lock();
            match &state.active {
                Some(current) if Arc::ptr_eq(current, &request) => {
                    state.highlight = Some(highlight);
                }
                _ => {
                    debug!("{}", ResolveError::Superseded);
                    return;
                }
            }
        }
        debug!(score = result.score, tier = ?result.tier, "highlight resolved");
        self.emit(EngineEvent::HighlightResolved { page: request.page });
        self.flush_pending_scroll().await;
    }

    fn clear_highlight_for(&self, request: &Arc<Citation>) {
        let cleared = {
            let mut state = self.state.lock();
            let still_active = matches!(&state.active, Some(cur) if Arc::ptr_eq(cur, request));
            still_active && state.highlight.take().is_some()
        };
        if cleared {
            self.emit(EngineEvent::HighlightCleared);
        }
    }

    /// One-shot navigation to the active highlight.
    ///
    /// `key` must be strictly increasing per user intent; a given key value
    /// triggers at most one navigation, ever. A key observed before any
    /// highlight exists is parked and re-attempted when resolution completes.
    pub async fn request_scroll(&self, key: u64) {
        let action = {
            let mut state = self.state.lock();
            if state.handled_scroll_keys.contains(&key) {
                return;
            }
            match state.highlight.clone() {
                Some(highlight) => {
                    state.handled_scroll_keys.insert(key);
                    if state.pending_scroll_key == Some(key) {
                        state.pending_scroll_key = None;
                    }
                    Some((state.mode, highlight, state.active.clone()))
                }
                None => {
                    state.pending_scroll_key = Some(key);
                    None
                }
            }
        };
        if let Some((mode, highlight, owner)) = action {
            self.perform_scroll(key, mode, highlight, owner).await;
        }
    }

    async fn flush_pending_scroll(&self) {
        let action = {
            let mut state = self.state.lock();
            let Some(key) = state.pending_scroll_key else {
                return;
            };
            if state.handled_scroll_keys.contains(&key) {
                state.pending_scroll_key = None;
                return;
            }
            let Some(highlight) = state.highlight.clone() else {
                return;
            };
            state.handled_scroll_keys.insert(key);
            state.pending_scroll_key = None;
            (key, state.mode, highlight, state.active.clone())
        };
        let (key, mode, highlight, owner) = action;
        self.perform_scroll(key, mode, highlight, owner).await;
    }

    /// `owner` is the citation the highlight was resolved for, captured when
    /// the key was consumed. The page-mode wait belongs to that citation:
    /// once a newer one takes over, the wait may neither write geometry nor
    /// navigate.
    #[instrument(skip(self, highlight, owner), fields(page = highlight.page))]
    async fn perform_scroll(
        &self,
        key: u64,
        mode: DisplayMode,
        highlight: Highlight,
        owner: Option<Arc<Citation>>,
    ) {
        match mode {
            DisplayMode::Scroll => {
                debug!(key, "scrolling page into view");
                self.renderer.scroll_to(ScrollTarget::Page(highlight.page));
            }
            DisplayMode::Page => {
                // The page switch must land before we can aim at the region.
                let mut to_emit = Vec::new();
                {
                    let mut state = self.state.lock();
                    if state.current_page != highlight.page {
                        state.current_page = highlight.page;
                        to_emit.push(EngineEvent::PageChanged(highlight.page));
                    }
                }
                for event in to_emit {
                    self.emit(event);
                }

                // The freshly shown page re-renders its text layer, so wait
                // (bounded) until the highlight's source text is locatable
                // there again; fall back to the page as a whole.
                let page = highlight.page;
                let snapshots = highlight.source_fragments.clone();
                let outcome = retry_until(
                    || {
                        if let Some(owner) = &owner {
                            if !self.is_active(owner) {
                                return Attempt::Abort;
                            }
                        }
                        let Some(page_rect) = self.renderer.page_surface_rect(page) else {
                            return Attempt::NotReady;
                        };
                        let Some(fragments) = self.renderer.fragments(page) else {
                            return Attempt::NotReady;
                        };
                        match relocate_region(&snapshots, &fragments, &page_rect) {
                            Some(rect) => Attempt::Ready(rect),
                            None => Attempt::NotReady,
                        }
                    },
                    self.config.poll_interval(),
                    self.config.scroll_wait(),
                )
                .await;

                match outcome {
                    RetryOutcome::Ready(rect) => {
                        // The wait slept; re-check ownership under the lock so
                        // a highlight resolved for a newer citation keeps its
                        // own geometry.
                        let owned = {
                            let mut state = self.state.lock();
                            let owned = owner.as_ref().map_or(true, |o| {
                                matches!(&state.active, Some(cur) if Arc::ptr_eq(cur, o))
                            });
                            if owned {
                                if let Some(current) = state.highlight.as_mut() {
                                    if current.page == page {
                                        current.rect = rect;
                                    }
                                }
                            }
                            owned
                        };
                        if owned {
                            debug!(key, "scrolling highlight region into view");
                            self.renderer
                                .scroll_to(ScrollTarget::Region { page, rect });
                        } else {
                            debug!(key, "{}", ResolveError::Superseded);
                        }
                    }
                    RetryOutcome::Aborted => {
                        debug!(key, "{}", ResolveError::Superseded);
                    }
                    RetryOutcome::TimedOut => {
                        debug!(key, "highlight never re-appeared, scrolling to page");
                        self.renderer.scroll_to(ScrollTarget::Page(page));
                    }
                }
            }
        }
    }

    /// Recalculation engine: re-derives the highlight rectangle from its
    /// stored source text after anything that could have moved it. Bursts of
    /// triggers coalesce through the debounce; only the newest wakeup runs.
    pub async fn notify_viewport_event(&self, event: ViewportEvent) {
        let epoch = {
            let mut state = self.state.lock();
            if state.highlight.is_none() {
                return;
            }
            state.recalc_epoch += 1;
            state.recalc_epoch
        };
        debug!(?event, epoch, "viewport event, debouncing recalculation");
        sleep(self.config.recalc_debounce()).await;
        if self.state.lock().recalc_epoch != epoch {
            // A newer trigger owns the recalculation now.
            return;
        }
        self.recalculate_now();
    }

    /// Immediate recalculation against the current fragment set. The rect is
    /// replaced in place; when none of the original fragments re-locate the
    /// highlight is left untouched rather than cleared, so transient renderer
    /// states do not cause flicker.
    pub fn recalculate_now(&self) {
        let Some((page, snapshots)) = ({
            let state = self.state.lock();
            state
                .highlight
                .as_ref()
                .map(|h| (h.page, h.source_fragments.clone()))
        }) else {
            return;
        };
        let Some(page_rect) = self.renderer.page_surface_rect(page) else {
            debug!(page, "page surface unavailable, keeping previous rectangle");
            return;
        };
        let Some(fragments) = self.renderer.fragments(page) else {
            debug!(page, "fragments unavailable, keeping previous rectangle");
            return;
        };
        match relocate_region(&snapshots, &fragments, &page_rect) {
            Some(rect) => {
                let mut state = self.state.lock();
                if let Some(highlight) = state.highlight.as_mut() {
                    if highlight.page == page {
                        highlight.rect = rect;
                    }
                }
            }
            None => {
                debug!(page, "no source fragment re-located, keeping previous rectangle");
            }
        }
    }
}
