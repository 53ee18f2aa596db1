use crate::breaking::{
    Alignment, BreakOutcome, BreakingAlgorithm, KnuthNode, MeasureProvider, NodeId, SearchHooks,
    SearchStats,
};
use crate::element::{BreakClass, Element};
use crate::provider::{FootnoteRange, PartProvider};
use crate::sequence::ElementSequence;
use crate::types::{Mpt, Ratio};
use std::collections::BTreeMap;

pub(crate) const DEFAULT_DEFERRED_FOOTNOTE_DEMERITS: i64 = 50_000;

// Leaving footnote material unplaced at a forced break means extra
// footnote-only parts later, so end-of-part deferral costs much more.
const FORCED_DEFERRAL_FACTOR: i64 = 20;

/// The element list of one footnote citation: where in the body sequence the
/// citation sits, and the footnote body content to place on (or after) the
/// part carrying it. Lists must arrive ordered by citation position.
#[derive(Debug, Clone)]
pub struct FootnoteBody {
    pub citation_pos: usize,
    pub elements: ElementSequence,
}

/// Insertion cursor into the footnote side lists: everything before
/// (list, element) has been placed, `inserted_len` is the cumulative placed
/// content length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct FootnoteProgress {
    inserted_len: Mpt,
    list: usize,
    element: usize,
}

/// One emitted page/column break with its fitting metadata and the exact
/// footnote slice belonging to the part it terminates.
#[derive(Debug, Clone, Copy)]
pub struct PageBreakPosition {
    pub leaf_pos: usize,
    pub adjust_ratio: Ratio,
    /// Slack between the part's available block-progression dimension and
    /// its demand (body plus inserted footnote material). Negative when the
    /// part overflows.
    pub difference: Mpt,
    pub footnotes: Option<FootnoteRange>,
    pub break_class: BreakClass,
}

#[derive(Debug, Clone, Copy)]
pub struct FloatEdge {
    pub position: usize,
    pub height: Mpt,
    pub y_offset: Mpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatMode {
    #[default]
    None,
    HandlingStartOfFloat {
        y_offset: Mpt,
    },
    HandlingEndOfFloat {
        float_height: Mpt,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PageBreakOutcome {
    pub positions: Vec<PageBreakPosition>,
    pub fallback_used: bool,
    pub stats: SearchStats,
    pub float_edge: Option<FloatEdge>,
    /// Footnote material still unplaced after the final break; the
    /// orchestrator spills it into footnote-only continuation parts.
    pub deferred_footnotes: Option<FootnoteRange>,
    pub(crate) core: BreakOutcome,
}

impl PageBreakOutcome {
    pub fn part_ranges(&self, seq: &ElementSequence) -> Vec<(usize, usize)> {
        self.core.part_ranges(seq)
    }
}

/// Page-level specialization of the core search. The target measure becomes
/// the per-part block-progression dimension from a [`PartProvider`], and
/// footnote content competes with the body for that measure before the
/// adjustment ratio is computed.
#[derive(Debug, Clone)]
pub struct PageBreakingAlgorithm {
    core: BreakingAlgorithm,
    footnote_separator: Mpt,
    deferred_footnote_demerits: i64,
    float_mode: FloatMode,
}

impl PageBreakingAlgorithm {
    pub fn new(core: BreakingAlgorithm) -> Self {
        Self {
            core,
            footnote_separator: Mpt::ZERO,
            deferred_footnote_demerits: DEFAULT_DEFERRED_FOOTNOTE_DEMERITS,
            float_mode: FloatMode::None,
        }
    }

    pub fn with_footnote_separator(mut self, separator: Mpt) -> Self {
        self.footnote_separator = separator;
        self
    }

    pub fn with_deferred_footnote_demerits(mut self, demerits: i64) -> Self {
        self.deferred_footnote_demerits = demerits;
        self
    }

    pub fn set_float_mode(&mut self, mode: FloatMode) {
        self.float_mode = mode;
    }

    pub fn float_mode(&self) -> FloatMode {
        self.float_mode
    }

    pub fn footnote_separator(&self) -> Mpt {
        self.footnote_separator
    }

    pub fn find_page_break_points(
        &self,
        seq: &ElementSequence,
        footnotes: &[FootnoteBody],
        provider: &dyn PartProvider,
        first_part_index: usize,
    ) -> PageBreakOutcome {
        let first_part_reduction = match self.float_mode {
            FloatMode::HandlingEndOfFloat { float_height } => float_height,
            _ => Mpt::ZERO,
        };
        let measures = PartMeasures {
            provider,
            part_offset: first_part_index,
            first_part_reduction,
        };
        let mut hooks = FootnoteHooks::new(
            footnotes,
            self.footnote_separator,
            self.deferred_footnote_demerits,
        );
        let core = self
            .core
            .find_break_points_with_hooks(seq, &measures, &mut hooks);

        let mut positions = Vec::with_capacity(core.breaks.len());
        let mut prev_progress = FootnoteProgress::default();
        for (bp, node_id) in core.breaks.iter().zip(core.chosen_nodes.iter()) {
            let progress = hooks.progress_of(*node_id);
            let footnotes_slice = if progress.inserted_len > prev_progress.inserted_len {
                Some(FootnoteRange {
                    first_list: prev_progress.list,
                    first_element: prev_progress.element,
                    last_list: progress.list,
                    last_element: progress.element,
                })
            } else {
                None
            };
            positions.push(PageBreakPosition {
                leaf_pos: bp.position,
                adjust_ratio: bp.adjust_ratio,
                difference: bp.difference,
                footnotes: footnotes_slice,
                break_class: bp.break_class,
            });
            prev_progress = progress;
        }

        let deferred_footnotes = hooks.deferred_range(&prev_progress);

        PageBreakOutcome {
            positions,
            fallback_used: core.fallback_used,
            stats: core.stats,
            float_edge: None,
            deferred_footnotes,
            core,
        }
    }

    /// Restricted pass used while a float start is being handled: searches
    /// only up to the float citation, with the end of that region treated as
    /// a mandatory edge, and reports the resulting best edge node so the
    /// orchestrator can materialize the float and resume behind it.
    pub fn find_float_edge(
        &self,
        seq: &ElementSequence,
        footnotes: &[FootnoteBody],
        provider: &dyn PartProvider,
        first_part_index: usize,
        citation_pos: usize,
        float_height: Mpt,
    ) -> PageBreakOutcome {
        let range = seq.effective_range();
        if range.is_empty() {
            return PageBreakOutcome::default();
        }
        let stop = citation_pos.min(range.end - 1);
        let mut truncated = ElementSequence::with_capacity(stop + 2);
        for index in 0..=stop {
            truncated.push(seq[index]);
        }
        truncated.set_ignore_at_start(seq.ignore_at_start());
        if !truncated.ends_with_forced_break() {
            truncated.push(Element::forced_break(BreakClass::None));
        }

        let mut outcome =
            self.find_page_break_points(&truncated, footnotes, provider, first_part_index);
        let count = outcome.positions.len();
        if count > 0 {
            let last = &mut outcome.positions[count - 1];
            last.leaf_pos = last.leaf_pos.min(stop);
            let edge_position = last.leaf_pos;
            let difference = last.difference;
            let target = provider.part_dims(first_part_index + count - 1).bpd;
            outcome.float_edge = Some(FloatEdge {
                position: edge_position,
                height: float_height,
                y_offset: (target - difference).clamp_non_negative(),
            });
        }
        outcome
    }
}

/// Balancing variant for the final part of a multi-column span: the target
/// stays the column height, but the cost of a break becomes the squared
/// deviation from the ideal per-column fill, which minimizes the maximum
/// column height over the fixed column count.
#[derive(Debug, Clone)]
pub struct BalancingColumnBreakingAlgorithm {
    inner: PageBreakingAlgorithm,
    columns: usize,
}

impl BalancingColumnBreakingAlgorithm {
    pub fn new(inner: PageBreakingAlgorithm, columns: usize) -> Self {
        Self {
            inner,
            columns: columns.max(1),
        }
    }

    pub fn find_balanced_break_points(
        &self,
        seq: &ElementSequence,
        footnotes: &[FootnoteBody],
        column_bpd: Mpt,
        first_part_index: usize,
    ) -> PageBreakOutcome {
        let total = seq.effective_content_length()
            + footnotes
                .iter()
                .map(|f| f.elements.calc_content_length_all())
                .sum();
        let ideal = (total / self.columns as i32).min(column_bpd);

        let mut core_cfg = self.inner.core.clone();
        core_cfg.alignment = Alignment::Start;
        let mut hooks = BalancingHooks {
            footnotes: FootnoteHooks::new(
                footnotes,
                self.inner.footnote_separator,
                self.inner.deferred_footnote_demerits,
            ),
            ideal,
        };
        let core = core_cfg.find_break_points_with_hooks(seq, &column_bpd, &mut hooks);

        let mut positions = Vec::with_capacity(core.breaks.len());
        let mut prev_progress = FootnoteProgress::default();
        for (bp, node_id) in core.breaks.iter().zip(core.chosen_nodes.iter()) {
            let progress = hooks.footnotes.progress_of(*node_id);
            let footnotes_slice = if progress.inserted_len > prev_progress.inserted_len {
                Some(FootnoteRange {
                    first_list: prev_progress.list,
                    first_element: prev_progress.element,
                    last_list: progress.list,
                    last_element: progress.element,
                })
            } else {
                None
            };
            positions.push(PageBreakPosition {
                leaf_pos: bp.position,
                adjust_ratio: bp.adjust_ratio,
                difference: bp.difference,
                footnotes: footnotes_slice,
                break_class: bp.break_class,
            });
            prev_progress = progress;
        }
        let deferred_footnotes = hooks.footnotes.deferred_range(&prev_progress);
        let _ = first_part_index;

        PageBreakOutcome {
            positions,
            fallback_used: core.fallback_used,
            stats: core.stats,
            float_edge: None,
            deferred_footnotes,
            core,
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }
}

/// Adapter turning the part provider's BPD into the core search's measure,
/// with the part indices offset for tail passes and the first part reduced
/// while an end-of-float displacement is active.
struct PartMeasures<'a> {
    provider: &'a dyn PartProvider,
    part_offset: usize,
    first_part_reduction: Mpt,
}

impl MeasureProvider for PartMeasures<'_> {
    fn measure_for_part(&self, part: usize) -> Mpt {
        let dims = self.provider.part_dims(self.part_offset + part);
        let bpd = if part == 0 {
            dims.bpd - self.first_part_reduction
        } else {
            dims.bpd
        };
        bpd.clamp_non_negative()
    }
}

#[derive(Debug, Clone, Copy)]
struct FootnoteCandidate {
    progress: FootnoteProgress,
    deferred: usize,
}

/// Per-node footnote bookkeeping, kept in side tables parallel to the
/// search's node arena. `extra_length` greedily inserts visible footnote
/// elements into the remaining space of the candidate part; the winning
/// insertion state is attached to the node the search then creates.
struct FootnoteHooks<'a> {
    footnotes: &'a [FootnoteBody],
    separator: Mpt,
    deferred_demerits: i64,
    element_lengths: Vec<Vec<Mpt>>,
    progress: Vec<FootnoteProgress>,
    candidates: BTreeMap<(NodeId, usize), FootnoteCandidate>,
}

impl<'a> FootnoteHooks<'a> {
    fn new(footnotes: &'a [FootnoteBody], separator: Mpt, deferred_demerits: i64) -> Self {
        let element_lengths = footnotes
            .iter()
            .map(|body| {
                body.elements
                    .iter()
                    .map(|el| {
                        if el.is_box() || el.is_glue() {
                            el.width()
                        } else {
                            Mpt::ZERO
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            footnotes,
            separator,
            deferred_demerits,
            element_lengths,
            progress: Vec::new(),
            candidates: BTreeMap::new(),
        }
    }

    fn progress_of(&self, id: NodeId) -> FootnoteProgress {
        self.progress.get(id).copied().unwrap_or_default()
    }

    fn set_progress(&mut self, id: NodeId, progress: FootnoteProgress) {
        if self.progress.len() <= id {
            self.progress.resize(id + 1, FootnoteProgress::default());
        }
        self.progress[id] = progress;
    }

    fn deferred_range(&self, progress: &FootnoteProgress) -> Option<FootnoteRange> {
        if self.footnotes.is_empty() || progress.list >= self.footnotes.len() {
            return None;
        }
        Some(FootnoteRange {
            first_list: progress.list,
            first_element: progress.element,
            last_list: self.footnotes.len(),
            last_element: 0,
        })
    }
}

impl SearchHooks for FootnoteHooks<'_> {
    fn extra_length(
        &mut self,
        pred: NodeId,
        _pred_node: &KnuthNode,
        pos: usize,
        body: Mpt,
        target: Mpt,
    ) -> Mpt {
        if self.footnotes.is_empty() {
            return Mpt::ZERO;
        }
        let visible = self.footnotes.partition_point(|f| f.citation_pos <= pos);
        let start = self.progress_of(pred);
        let mut cursor = start;
        let mut inserted = Mpt::ZERO;
        if cursor.list < visible {
            let budget = target - body - self.separator;
            'insertion: while cursor.list < visible {
                let list = &self.element_lengths[cursor.list];
                while cursor.element < list.len() {
                    let width = list[cursor.element];
                    if inserted + width <= budget {
                        inserted += width;
                        cursor.element += 1;
                    } else {
                        break 'insertion;
                    }
                }
                cursor.list += 1;
                cursor.element = 0;
            }
        }
        let mut deferred = 0;
        if cursor.list < visible {
            deferred += self.element_lengths[cursor.list].len() - cursor.element;
            for list in cursor.list + 1..visible {
                deferred += self.element_lengths[list].len();
            }
        }
        cursor.inserted_len = start.inserted_len + inserted;
        self.candidates
            .insert((pred, pos), FootnoteCandidate { progress: cursor, deferred });
        if inserted > Mpt::ZERO {
            self.separator + inserted
        } else {
            Mpt::ZERO
        }
    }

    fn extra_demerits(&mut self, pred: NodeId, pos: usize, is_forced: bool) -> i64 {
        let Some(candidate) = self.candidates.get(&(pred, pos)) else {
            return 0;
        };
        if candidate.deferred == 0 {
            return 0;
        }
        let factor = if is_forced { FORCED_DEFERRAL_FACTOR } else { 1 };
        (candidate.deferred as i64)
            .saturating_mul(self.deferred_demerits)
            .saturating_mul(factor)
    }

    fn root_created(&mut self, id: NodeId) {
        self.set_progress(id, FootnoteProgress::default());
    }

    fn node_created(&mut self, id: NodeId, pred: NodeId, pos: usize) {
        let progress = match self.candidates.get(&(pred, pos)) {
            Some(candidate) => candidate.progress,
            None => self.progress_of(pred),
        };
        self.set_progress(id, progress);
    }
}

struct BalancingHooks<'a> {
    footnotes: FootnoteHooks<'a>,
    ideal: Mpt,
}

impl SearchHooks for BalancingHooks<'_> {
    fn extra_length(
        &mut self,
        pred: NodeId,
        pred_node: &KnuthNode,
        pos: usize,
        body: Mpt,
        target: Mpt,
    ) -> Mpt {
        self.footnotes.extra_length(pred, pred_node, pos, body, target)
    }

    fn extra_demerits(&mut self, pred: NodeId, pos: usize, is_forced: bool) -> i64 {
        self.footnotes.extra_demerits(pred, pos, is_forced)
    }

    fn demerits_override(&mut self, _pred_node: &KnuthNode, diff: Mpt, target: Mpt) -> Option<i64> {
        let part_len = target - diff;
        let deviation = (part_len - self.ideal).to_milli() as i128;
        let cost = (deviation * deviation) / 1000;
        Some(cost.clamp(0, crate::breaking::MAX_DEMERITS as i128) as i64)
    }

    fn root_created(&mut self, id: NodeId) {
        self.footnotes.root_created(id);
    }

    fn node_created(&mut self, id: NodeId, pred: NodeId, pos: usize) {
        self.footnotes.node_created(id, pred, pos);
    }
}

/// Producer contract check used by the orchestrator before a pass.
pub(crate) fn footnotes_are_ordered(footnotes: &[FootnoteBody], seq_len: usize) -> bool {
    let mut previous = 0;
    for body in footnotes {
        if body.citation_pos < previous || body.citation_pos >= seq_len {
            return false;
        }
        previous = body.citation_pos;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UniformPartProvider;

    fn mpt(v: i64) -> Mpt {
        Mpt::from_milli(v)
    }

    fn algorithm() -> PageBreakingAlgorithm {
        PageBreakingAlgorithm::new(BreakingAlgorithm::new(Alignment::Start))
    }

    fn footnote(citation_pos: usize, widths: &[i64]) -> FootnoteBody {
        let mut elements = ElementSequence::new();
        for w in widths {
            elements.push(Element::new_box(mpt(*w)));
        }
        FootnoteBody {
            citation_pos,
            elements,
        }
    }

    fn lines(count: usize, height: i64) -> ElementSequence {
        let mut seq = ElementSequence::new();
        for i in 0..count {
            if i > 0 {
                seq.push(Element::penalty(0, false));
            }
            seq.push(Element::new_box(mpt(height)));
        }
        seq
    }

    #[test]
    fn footnote_is_inserted_on_its_citation_part() {
        let seq = lines(3, 30_000);
        let footnotes = vec![footnote(0, &[20_000])];
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let algo = algorithm().with_footnote_separator(mpt(5_000));
        let outcome = algo.find_page_break_points(&seq, &footnotes, &provider, 0);
        assert_eq!(outcome.positions.len(), 2);
        let first = &outcome.positions[0];
        assert_eq!(
            first.footnotes,
            Some(FootnoteRange {
                first_list: 0,
                first_element: 0,
                last_list: 1,
                last_element: 0,
            })
        );
        assert!(outcome.positions[1].footnotes.is_none());
        assert!(outcome.deferred_footnotes.is_none());
    }

    #[test]
    fn footnote_length_competes_with_body_content() {
        // Without the footnote both lines fit on one part; with it the
        // second line must move to the next part.
        let seq = lines(2, 30_000);
        let provider = UniformPartProvider::new(mpt(65_000), mpt(400_000));
        let algo = algorithm().with_footnote_separator(mpt(5_000));
        let plain = algo.find_page_break_points(&seq, &[], &provider, 0);
        assert_eq!(plain.positions.len(), 1);
        let footnotes = vec![footnote(0, &[20_000])];
        let with_note = algo.find_page_break_points(&seq, &footnotes, &provider, 0);
        assert_eq!(with_note.positions.len(), 2);
        assert!(with_note.positions[0].footnotes.is_some());
    }

    #[test]
    fn oversized_footnote_splits_across_parts() {
        let seq = lines(2, 15_000);
        let footnotes = vec![footnote(0, &[10_000, 10_000, 10_000])];
        let provider = UniformPartProvider::new(mpt(30_000), mpt(400_000));
        let algo = algorithm().with_footnote_separator(mpt(2_000));
        let outcome = algo.find_page_break_points(&seq, &footnotes, &provider, 0);
        assert_eq!(outcome.positions.len(), 2);
        assert_eq!(
            outcome.positions[0].footnotes,
            Some(FootnoteRange {
                first_list: 0,
                first_element: 0,
                last_list: 0,
                last_element: 1,
            })
        );
        assert_eq!(
            outcome.positions[1].footnotes,
            Some(FootnoteRange {
                first_list: 0,
                first_element: 1,
                last_list: 0,
                last_element: 2,
            })
        );
        // One element did not fit anywhere and spills past the final break.
        assert_eq!(
            outcome.deferred_footnotes,
            Some(FootnoteRange {
                first_list: 0,
                first_element: 2,
                last_list: 1,
                last_element: 0,
            })
        );
    }

    #[test]
    fn balancing_three_columns_yields_even_heights() {
        let seq = lines(24, 10_000);
        let column_bpd = mpt(100_000);
        let balancer = BalancingColumnBreakingAlgorithm::new(algorithm(), 3);
        let outcome = balancer.find_balanced_break_points(&seq, &[], column_bpd, 0);
        assert_eq!(outcome.positions.len(), 3);
        let ranges = outcome.part_ranges(&seq);
        let heights: Vec<Mpt> = ranges
            .iter()
            .map(|(start, end)| seq.calc_content_length(*start, *end))
            .collect();
        let max = heights.iter().copied().fold(Mpt::ZERO, Mpt::max);
        let min = heights.iter().copied().fold(Mpt::MAX, Mpt::min);
        assert!(max - min <= mpt(10_000));
    }

    #[test]
    fn float_edge_pass_stops_at_the_citation() {
        let seq = lines(6, 30_000);
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let algo = algorithm();
        // Citation sits on the third line (element index 4).
        let outcome = algo.find_float_edge(&seq, &[], &provider, 0, 4, mpt(25_000));
        let edge = outcome.float_edge.expect("edge node");
        assert!(edge.position <= 4);
        assert_eq!(edge.height, mpt(25_000));
        assert!(edge.y_offset > Mpt::ZERO);
        let last = outcome.positions.last().expect("at least one part");
        assert_eq!(last.leaf_pos, edge.position);
    }

    #[test]
    fn end_of_float_mode_reduces_the_first_part_measure() {
        let seq = lines(4, 30_000);
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let mut algo = algorithm();
        algo.set_float_mode(FloatMode::HandlingEndOfFloat {
            float_height: mpt(40_000),
        });
        let outcome = algo.find_page_break_points(&seq, &[], &provider, 0);
        // Only one 30k line fits into the reduced 30k first part.
        let ranges = outcome.part_ranges(&seq);
        assert_eq!(seq.calc_content_length(ranges[0].0, ranges[0].1), mpt(30_000));
        assert!(outcome.positions.len() >= 2);
    }

    #[test]
    fn footnote_ordering_contract_is_checked() {
        let seq_len = 10;
        let ordered = vec![footnote(1, &[1_000]), footnote(4, &[1_000])];
        assert!(footnotes_are_ordered(&ordered, seq_len));
        let unordered = vec![footnote(4, &[1_000]), footnote(1, &[1_000])];
        assert!(!footnotes_are_ordered(&unordered, seq_len));
        let out_of_range = vec![footnote(10, &[1_000])];
        assert!(!footnotes_are_ordered(&out_of_range, seq_len));
    }
}
