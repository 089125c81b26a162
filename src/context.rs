//! Upstream context assembly.
//!
//! The broker turns dependency outputs into one provenance-tagged block of
//! text that fits a character budget. Each piece of upstream output becomes a
//! [`Segment`], rendered as
//!
//! ```text
//! <<< source: phase 1.5 / survey / item chapter-2 >>>
//! ...output...
//! <<< end: phase 1.5 / item chapter-2 >>>
//! ```
//!
//! Assembly is a pure function of its inputs: the same outputs and budget
//! always produce byte-identical text. Resumed jobs depend on this to
//! reproduce prompts exactly.

use crate::dag::builder::ResolvedPhase;
use crate::dag::state::PhaseOutcome;
use crate::plan::PhaseId;
use std::collections::HashMap;

/// Default context budget in characters.
pub const DEFAULT_BUDGET_CHARS: usize = 48_000;

/// Marker appended when a segment body is cut to fit the budget.
const TRUNCATION_MARKER: &str = "\n[... truncated to fit context budget ...]";

/// Separator placed between rendered segments.
const SEGMENT_SEPARATOR: &str = "\n\n";

/// How important a segment is when the budget forces drops.
///
/// Lower priorities are dropped first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SegmentPriority {
    /// Individual item outputs already covered by a synthesis
    Detail,
    /// Phase outputs, synthesis outputs, chain steps
    Primary,
    /// Short failure notices that explain gaps
    Notice,
}

/// One tagged piece of upstream output.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub phase: PhaseId,
    pub operation: String,
    pub item: Option<String>,
    pub text: String,
    pub priority: SegmentPriority,
}

impl Segment {
    pub fn new(phase: &PhaseId, operation: &str, text: &str) -> Self {
        Self {
            phase: phase.clone(),
            operation: operation.to_string(),
            item: None,
            text: text.to_string(),
            priority: SegmentPriority::Primary,
        }
    }

    pub fn for_item(mut self, item: &str) -> Self {
        self.item = Some(item.to_string());
        self
    }

    pub fn with_priority(mut self, priority: SegmentPriority) -> Self {
        self.priority = priority;
        self
    }

    fn header(&self) -> String {
        let mut header = format!("<<< source: phase {}", self.phase);
        if !self.operation.is_empty() {
            header.push_str(" / ");
            header.push_str(&self.operation);
        }
        if let Some(item) = &self.item {
            header.push_str(" / item ");
            header.push_str(item);
        }
        header.push_str(" >>>\n");
        header
    }

    fn footer(&self) -> String {
        match &self.item {
            Some(item) => format!("\n<<< end: phase {} / item {} >>>", self.phase, item),
            None => format!("\n<<< end: phase {} >>>", self.phase),
        }
    }

    /// Full rendering, tags included.
    pub fn render(&self) -> String {
        format!("{}{}{}", self.header(), self.text, self.footer())
    }

    fn rendered_len(&self) -> usize {
        char_len(&self.header()) + char_len(&self.text) + char_len(&self.footer())
    }

    /// Render with the body cut so the whole segment fits `limit` chars.
    /// Returns `None` if not even the tags and marker fit.
    fn render_within(&self, limit: usize) -> Option<String> {
        let header = self.header();
        let footer = self.footer();
        let frame = char_len(&header) + char_len(&footer) + char_len(TRUNCATION_MARKER);
        if frame > limit {
            return None;
        }
        let body: String = self.text.chars().take(limit - frame).collect();
        Some(format!("{}{}{}{}", header, body, TRUNCATION_MARKER, footer))
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Assembles upstream context for calls.
#[derive(Debug, Clone)]
pub struct ContextBroker {
    default_budget: usize,
}

impl Default for ContextBroker {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_CHARS)
    }
}

impl ContextBroker {
    pub fn new(default_budget: usize) -> Self {
        Self { default_budget }
    }

    pub fn default_budget(&self) -> usize {
        self.default_budget
    }

    /// Budget that applies to `phase`: its own cap, else the default.
    pub fn budget_for(&self, phase: &ResolvedPhase) -> usize {
        phase.context_budget.unwrap_or(self.default_budget)
    }

    /// Assemble the context for `phase` from its dependencies' outcomes.
    ///
    /// Dependencies are visited in declaration order. Dependencies with no
    /// recorded outcome, or whose outcome has no output, contribute nothing.
    pub fn assemble(&self, phase: &ResolvedPhase, upstream: &HashMap<PhaseId, PhaseOutcome>) -> String {
        let segments: Vec<Segment> = phase
            .depends_on
            .iter()
            .filter_map(|dep| upstream.get(dep))
            .flat_map(Self::segments_for)
            .collect();

        self.assemble_segments(&segments, self.budget_for(phase))
    }

    /// Split a phase outcome into tagged segments.
    ///
    /// Per-item outcomes yield the synthesis (if any), one segment per
    /// successful item and one notice listing failed items.
    pub fn segments_for(outcome: &PhaseOutcome) -> Vec<Segment> {
        let mut segments = Vec::new();

        if outcome.items.is_empty() {
            if let Some(output) = outcome.output.as_deref().filter(|o| !o.is_empty()) {
                segments.push(Segment::new(&outcome.phase, &outcome.operation, output));
            }
            return segments;
        }

        let synthesized = outcome.output.is_some();
        if let Some(output) = &outcome.output {
            segments.push(Segment::new(
                &outcome.phase,
                &format!("{} synthesis", outcome.operation),
                output,
            ));
        }

        let item_priority = if synthesized {
            SegmentPriority::Detail
        } else {
            SegmentPriority::Primary
        };
        for item in outcome.successful_items() {
            if let Some(output) = &item.output {
                segments.push(
                    Segment::new(&outcome.phase, &outcome.operation, output)
                        .for_item(&item.key)
                        .with_priority(item_priority),
                );
            }
        }

        let failures: Vec<String> = outcome
            .failed_items()
            .map(|item| match &item.error {
                Some(err) => format!("- {}: {}", item.key, err),
                None => format!("- {}", item.key),
            })
            .collect();
        if !failures.is_empty() {
            let notice = format!("Items that failed and are missing above:\n{}", failures.join("\n"));
            segments.push(
                Segment::new(&outcome.phase, "failures", &notice)
                    .with_priority(SegmentPriority::Notice),
            );
        }

        segments
    }

    /// Render `segments` in order, dropping or cutting to fit `budget` chars.
    ///
    /// While over budget, the lowest-priority segment is dropped, earliest
    /// first among equals. If a single segment remains and is still too
    /// large, its body is cut and marked; tags are never cut.
    pub fn assemble_segments(&self, segments: &[Segment], budget: usize) -> String {
        if segments.is_empty() {
            return String::new();
        }

        let mut kept: Vec<usize> = (0..segments.len()).collect();
        let total = |kept: &[usize]| -> usize {
            let body: usize = kept.iter().map(|&i| segments[i].rendered_len()).sum();
            body + kept.len().saturating_sub(1) * char_len(SEGMENT_SEPARATOR)
        };

        while kept.len() > 1 && total(&kept) > budget {
            let victim = kept
                .iter()
                .enumerate()
                .min_by_key(|(pos, idx)| (segments[**idx].priority, *pos))
                .map(|(pos, _)| pos);
            match victim {
                Some(pos) => {
                    kept.remove(pos);
                }
                None => break,
            }
        }

        if total(&kept) <= budget {
            return kept
                .iter()
                .map(|&i| segments[i].render())
                .collect::<Vec<_>>()
                .join(SEGMENT_SEPARATOR);
        }

        // One segment left and it alone exceeds the budget
        kept.first()
            .and_then(|&i| segments[i].render_within(budget))
            .unwrap_or_default()
    }
}
