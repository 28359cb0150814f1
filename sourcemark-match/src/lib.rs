//! Pure fragment matching and geometry resolution.
//!
//! Everything in this crate is side-effect-free and deterministic so the
//! readiness poller can retry it safely. Matching runs three tiers in order
//! and the first success wins: an accumulation scan over consecutive
//! fragments, whole-fragment containment, and a longest-common-substring
//! fallback. Citations come from an upstream text-generation step and are not
//! guaranteed to align with the renderer's fragment boundaries (which often
//! split mid-word), so the tiers trade precision for robustness: a visibly
//! best-effort highlight beats no highlight.

use std::collections::VecDeque;

use sourcemark_core::{
    normalize_text, EngineConfig, FragmentSnapshot, MatchResult, MatchTier, Rect, TextFragment,
};
use tracing::debug;

/// Score assigned to containment matches (tiers 1 and 2).
pub const EXACT_SCORE: f32 = 100.0;

/// Knobs for the matcher, lifted out of [`EngineConfig`] so this crate stays
/// independent of the engine's timing configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchTuning {
    pub fuzzy_accept_score: f32,
    pub min_common_run: usize,
    pub window_prune_factor: usize,
}

impl Default for MatchTuning {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for MatchTuning {
    fn from(config: &EngineConfig) -> Self {
        Self {
            fuzzy_accept_score: config.fuzzy_accept_score,
            min_common_run: config.min_common_run,
            window_prune_factor: config.window_prune_factor,
        }
    }
}

/// Finds the best-matching fragment run for `target` on `page`.
///
/// Returns `None` when all three tiers come up empty; that is a normal,
/// silent outcome.
pub fn find_match(
    page: u32,
    target: &str,
    fragments: &[TextFragment],
    tuning: &MatchTuning,
) -> Option<MatchResult> {
    let needle = normalize_text(target);
    if needle.is_empty() || fragments.is_empty() {
        return None;
    }

    if let Some(run) = accumulation_scan(&needle, fragments, tuning.window_prune_factor) {
        debug!(page, run_len = run.len(), "accumulation scan matched");
        return Some(MatchResult {
            page,
            fragments: run,
            score: EXACT_SCORE,
            tier: MatchTier::WindowRun,
        });
    }

    if let Some(fragment) = whole_fragment_scan(&needle, fragments) {
        debug!(page, "whole-fragment containment matched");
        return Some(MatchResult {
            page,
            fragments: vec![fragment],
            score: EXACT_SCORE,
            tier: MatchTier::WholeFragment,
        });
    }

    if let Some((fragment, score)) = fuzzy_scan(&needle, fragments, tuning) {
        debug!(page, score, "fuzzy fallback matched");
        return Some(MatchResult {
            page,
            fragments: vec![fragment],
            score,
            tier: MatchTier::Fuzzy,
        });
    }

    debug!(page, "no tier matched");
    None
}

/// Tier 1: walks fragments left to right, accumulating their normalized text
/// into a sliding window (joined on single spaces). A window that contains
/// the target yields the run of fragments currently in the window. Once the
/// window text grows past `prune_factor x target length`, fragments are
/// dropped from the front so stale context cannot pin the window open.
pub fn accumulation_scan(
    needle: &str,
    fragments: &[TextFragment],
    prune_factor: usize,
) -> Option<Vec<TextFragment>> {
    let limit = needle.len().saturating_mul(prune_factor.max(1));
    let mut window: VecDeque<(usize, String)> = VecDeque::new();
    let mut window_text = String::new();

    for (index, fragment) in fragments.iter().enumerate() {
        let normalized = normalize_text(&fragment.content);
        if normalized.is_empty() {
            continue;
        }
        window.push_back((index, normalized));
        rebuild_window_text(&window, &mut window_text);

        if window_text.contains(needle) {
            return Some(
                window
                    .iter()
                    .map(|(i, _)| fragments[*i].clone())
                    .collect(),
            );
        }

        while window.len() > 1 && window_text.len() > limit {
            window.pop_front();
            rebuild_window_text(&window, &mut window_text);
        }
    }

    None
}

fn rebuild_window_text(window: &VecDeque<(usize, String)>, out: &mut String) {
    out.clear();
    for (pos, (_, text)) in window.iter().enumerate() {
        if pos > 0 {
            out.push(' ');
        }
        out.push_str(text);
    }
}

/// Tier 2: a fragment whose own text contains the whole target. Catches
/// targets that straddle no fragment boundary even when the accumulation
/// window was pruned past them.
pub fn whole_fragment_scan(needle: &str, fragments: &[TextFragment]) -> Option<TextFragment> {
    fragments
        .iter()
        .find(|fragment| normalize_text(&fragment.content).contains(needle))
        .cloned()
}

/// Tier 3: per-fragment longest common substring of at least
/// `min_common_run` characters, scored as
/// `100 x run / max(target_len, fragment_len)`. The best-scoring fragment is
/// accepted if it clears `fuzzy_accept_score`; ties keep the first fragment
/// encountered.
pub fn fuzzy_scan(
    needle: &str,
    fragments: &[TextFragment],
    tuning: &MatchTuning,
) -> Option<(TextFragment, f32)> {
    let needle_chars: Vec<char> = needle.chars().collect();
    let mut best: Option<(usize, f32)> = None;

    for (index, fragment) in fragments.iter().enumerate() {
        let normalized = normalize_text(&fragment.content);
        if normalized.is_empty() {
            continue;
        }
        let fragment_chars: Vec<char> = normalized.chars().collect();
        let run = longest_common_run(&needle_chars, &fragment_chars);
        if run < tuning.min_common_run {
            continue;
        }
        let denom = needle_chars.len().max(fragment_chars.len()) as f32;
        let score = 100.0 * run as f32 / denom;
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((index, score));
        }
    }

    match best {
        Some((index, score)) if score > tuning.fuzzy_accept_score => {
            Some((fragments[index].clone(), score))
        }
        _ => None,
    }
}

/// Length of the longest common substring of `a` and `b`.
fn longest_common_run(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    let mut best = 0;
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb { prev[j] + 1 } else { 0 };
            best = best.max(curr[j + 1]);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    best
}

/// Computes the minimal enclosing rectangle of a matched run, expressed
/// relative to the page surface origin and clamped into the page bounds.
///
/// Returns `None` for an empty run or when any fragment reports a zero-area
/// box, which means the text layer has not finished laying out.
pub fn resolve_region(fragments: &[TextFragment], page_surface: &Rect) -> Option<Rect> {
    if fragments.is_empty() {
        return None;
    }
    let mut union: Option<Rect> = None;
    for fragment in fragments {
        if !fragment.rect.has_area() {
            return None;
        }
        union = Some(match union {
            Some(acc) => acc.union(&fragment.rect),
            None => fragment.rect,
        });
    }
    let bounds = Rect::new(0.0, 0.0, page_surface.width, page_surface.height);
    union.map(|rect| rect.relative_to(page_surface).clamped_to(&bounds))
}

/// Re-derives a highlight's rectangle from its stored source text against the
/// page's *current* fragments.
///
/// For each snapshot, the first current fragment with exactly equal
/// normalized text and a laid-out box contributes its current geometry.
/// Returns `None` when nothing re-locates, e.g. the page content genuinely
/// changed; the caller keeps the old rectangle in that case to avoid flicker.
pub fn relocate_region(
    snapshots: &[FragmentSnapshot],
    current: &[TextFragment],
    page_surface: &Rect,
) -> Option<Rect> {
    let mut union: Option<Rect> = None;
    for snapshot in snapshots {
        let wanted = normalize_text(&snapshot.original_text);
        if wanted.is_empty() {
            continue;
        }
        let located = current
            .iter()
            .find(|fragment| normalize_text(&fragment.content) == wanted);
        if let Some(fragment) = located {
            if fragment.rect.has_area() {
                union = Some(match union {
                    Some(acc) => acc.union(&fragment.rect),
                    None => fragment.rect,
                });
            }
        }
    }
    let bounds = Rect::new(0.0, 0.0, page_surface.width, page_surface.height);
    union.map(|rect| rect.relative_to(page_surface).clamped_to(&bounds))
}
