use crate::element::{BreakClass, Element, INFINITE_PENALTY};
use crate::sequence::ElementSequence;
use crate::types::{Mpt, Ratio};
use std::collections::BTreeMap;

/// Supplies the target measure for each part being formed: line widths for a
/// paragraph, column content heights for a flow. Successive parts may have
/// different measures. Must be reentrant-safe across restarts of the same
/// breaker; concurrent invocations use separate providers.
pub trait MeasureProvider {
    fn measure_for_part(&self, part: usize) -> Mpt;
}

/// Uniform measure: every part gets the same target.
impl MeasureProvider for Mpt {
    fn measure_for_part(&self, _part: usize) -> Mpt {
        *self
    }
}

/// Explicit per-part measures; the last entry repeats for any further parts.
impl MeasureProvider for Vec<Mpt> {
    fn measure_for_part(&self, part: usize) -> Mpt {
        match self.get(part) {
            Some(m) => *m,
            None => self.last().copied().unwrap_or(Mpt::ZERO),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Start,
    End,
    Center,
    Justify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedBreaks {
    All,
    OnlyForced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Full dynamic-programming search minimizing total demerits.
    Optimal,
    /// Greedy earliest-feasible breaking; cheap preview passes only.
    FirstFit,
}

/// Fitness class of an adjustment ratio. Consecutive parts whose classes
/// differ by more than one step pick up a demerits surcharge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Fitness {
    Tight,
    Normal,
    Loose,
    VeryLoose,
}

impl Fitness {
    fn from_ratio(ratio: Ratio) -> Fitness {
        if ratio < Ratio::from_milli(-500) {
            Fitness::Tight
        } else if ratio <= Ratio::from_milli(500) {
            Fitness::Normal
        } else if ratio <= Ratio::ONE {
            Fitness::Loose
        } else {
            Fitness::VeryLoose
        }
    }

    fn index(self) -> usize {
        match self {
            Fitness::Tight => 0,
            Fitness::Normal => 1,
            Fitness::Loose => 2,
            Fitness::VeryLoose => 3,
        }
    }

    fn from_index(index: usize) -> Fitness {
        match index {
            0 => Fitness::Tight,
            1 => Fitness::Normal,
            2 => Fitness::Loose,
            _ => Fitness::VeryLoose,
        }
    }

    fn jump(self, other: Fitness) -> usize {
        self.index().abs_diff(other.index())
    }
}

pub(crate) type NodeId = usize;

/// One surviving partial solution: "break part `part` at element `position`,
/// having consumed the cumulative totals". Nodes live in an arena owned by a
/// single search; `previous` is an arena index, so the whole chain is
/// released in one shot when the search ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KnuthNode {
    pub position: usize,
    pub part: usize,
    pub fitness: Fitness,
    pub total_width: Mpt,
    pub total_stretch: Mpt,
    pub total_shrink: Mpt,
    pub adjust_ratio: Ratio,
    pub difference: Mpt,
    pub flagged: bool,
    pub flagged_run: u32,
    pub break_class: BreakClass,
    pub total_demerits: i64,
    pub previous: Option<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakPoint {
    /// Index of the element the break occurs at; the element belongs to the
    /// part this break terminates.
    pub position: usize,
    /// Zero-based index of the terminated part.
    pub part: usize,
    pub adjust_ratio: Ratio,
    /// Slack between the target measure and the part's demand. Negative when
    /// the part overflows.
    pub difference: Mpt,
    pub demerits: i64,
    pub break_class: BreakClass,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SearchStats {
    pub nodes_created: u64,
    pub nodes_pruned: u64,
    pub breaks_considered: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BreakOutcome {
    pub breaks: Vec<BreakPoint>,
    /// True when some part had no feasible fit and the least-bad infeasible
    /// node was accepted instead.
    pub fallback_used: bool,
    pub stats: SearchStats,
    pub(crate) chosen_nodes: Vec<NodeId>,
}

impl BreakOutcome {
    pub fn positions(&self) -> Vec<usize> {
        self.breaks.iter().map(|b| b.position).collect()
    }

    /// Inclusive element ranges of the emitted parts. Concatenated in order
    /// they partition the sequence's non-ignored elements exactly.
    pub fn part_ranges(&self, seq: &ElementSequence) -> Vec<(usize, usize)> {
        let range = seq.effective_range();
        let mut out = Vec::with_capacity(self.breaks.len());
        let mut start = range.start;
        for bp in &self.breaks {
            out.push((start, bp.position));
            start = bp.position + 1;
        }
        out
    }
}

/// Extension seam for the page-level specialization: extra per-part length
/// demand (footnotes), extra demerits (deferred footnote material), a full
/// demerits override (column balancing), and node bookkeeping callbacks.
/// `extra_length` is always invoked before `extra_demerits` for the same
/// (predecessor, position) pair.
pub(crate) trait SearchHooks {
    fn extra_length(
        &mut self,
        _pred: NodeId,
        _pred_node: &KnuthNode,
        _pos: usize,
        _body: Mpt,
        _target: Mpt,
    ) -> Mpt {
        Mpt::ZERO
    }

    fn extra_demerits(&mut self, _pred: NodeId, _pos: usize, _is_forced: bool) -> i64 {
        0
    }

    fn demerits_override(&mut self, _pred_node: &KnuthNode, _diff: Mpt, _target: Mpt) -> Option<i64> {
        None
    }

    fn root_created(&mut self, _id: NodeId) {}

    fn node_created(&mut self, _id: NodeId, _pred: NodeId, _pos: usize) {}
}

pub(crate) struct NoHooks;

impl SearchHooks for NoHooks {}

pub(crate) const MAX_DEMERITS: i64 = i64::MAX / 4;

pub(crate) const DEFAULT_FLAGGED_DEMERITS: i64 = 10_000;
pub(crate) const DEFAULT_FITNESS_DEMERITS: i64 = 10_000;
pub(crate) const DEFAULT_MAX_FLAGGED_RUN: u32 = 3;

/// The generalized Knuth-Plass search: scans an element sequence left to
/// right, keeps an active list of non-dominated partial solutions, relaxes
/// the best node per (part, fitness class) at every legal break, and walks
/// the back-pointer chain of the cheapest terminal node.
#[derive(Debug, Clone)]
pub struct BreakingAlgorithm {
    pub(crate) alignment: Alignment,
    pub(crate) threshold: Ratio,
    pub(crate) underfull_cap: Ratio,
    pub(crate) flagged_demerits: i64,
    pub(crate) flagged_run_demerits: i64,
    pub(crate) max_flagged_run: u32,
    pub(crate) fitness_demerits: i64,
    pub(crate) allowed_breaks: AllowedBreaks,
    pub(crate) mode: SearchMode,
}

impl BreakingAlgorithm {
    pub fn new(alignment: Alignment) -> Self {
        Self {
            alignment,
            threshold: Ratio::ONE,
            underfull_cap: Ratio::ONE,
            flagged_demerits: DEFAULT_FLAGGED_DEMERITS,
            flagged_run_demerits: DEFAULT_FLAGGED_DEMERITS,
            max_flagged_run: DEFAULT_MAX_FLAGGED_RUN,
            fitness_demerits: DEFAULT_FITNESS_DEMERITS,
            allowed_breaks: AllowedBreaks::All,
            mode: SearchMode::Optimal,
        }
    }

    pub fn with_threshold(mut self, threshold: Ratio) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_allowed_breaks(mut self, allowed: AllowedBreaks) -> Self {
        self.allowed_breaks = allowed;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn find_break_points(
        &self,
        seq: &ElementSequence,
        measures: &dyn MeasureProvider,
    ) -> BreakOutcome {
        self.find_break_points_with_hooks(seq, measures, &mut NoHooks)
    }

    pub(crate) fn find_break_points_with_hooks(
        &self,
        seq: &ElementSequence,
        measures: &dyn MeasureProvider,
        hooks: &mut dyn SearchHooks,
    ) -> BreakOutcome {
        match self.mode {
            SearchMode::Optimal => {
                let mut search = Search::new(self, seq, measures);
                search.run(hooks)
            }
            SearchMode::FirstFit => self.first_fit(seq, measures),
        }
    }

    fn break_allowed(&self, element: &Element) -> bool {
        match self.allowed_breaks {
            AllowedBreaks::All => true,
            AllowedBreaks::OnlyForced => element.is_forced_break(),
        }
    }

    /// Greedy pass: fill each part as far as it fits, break at the latest
    /// feasible candidate once the next one overflows. Linear, no arena.
    fn first_fit(&self, seq: &ElementSequence, measures: &dyn MeasureProvider) -> BreakOutcome {
        let range = seq.effective_range();
        let mut outcome = BreakOutcome::default();
        if range.is_empty() {
            return outcome;
        }

        // Prefix sums over [range.start, range.end], so rescans after a
        // rewind stay cheap.
        let count = range.end - range.start;
        let mut pw = Vec::with_capacity(count + 1);
        let mut pst = Vec::with_capacity(count + 1);
        let mut psh = Vec::with_capacity(count + 1);
        pw.push(Mpt::ZERO);
        pst.push(Mpt::ZERO);
        psh.push(Mpt::ZERO);
        for index in range.clone() {
            let el = &seq[index];
            let counted = el.is_box() || el.is_glue();
            let last_w = pw[pw.len() - 1];
            let last_st = pst[pst.len() - 1];
            let last_sh = psh[psh.len() - 1];
            pw.push(last_w + if counted { el.width() } else { Mpt::ZERO });
            pst.push(last_st + el.stretch());
            psh.push(last_sh + el.shrink());
        }
        let at = |index: usize| index - range.start;

        let mut part = 0usize;
        let mut start = range.start;
        let mut last_feasible: Option<(usize, Ratio, Mpt)> = None;
        let mut index = range.start;

        // Restart a part after a break: discarded glue between the break and
        // the first following box stays out of the next part's demand.
        let restart_after = |bp: usize| {
            let mut j = bp + 1;
            while j < range.end && !seq[j].is_box() {
                j += 1;
            }
            j
        };

        while index < range.end {
            let el = &seq[index];
            let glue_break = el.is_glue()
                && !el.is_auxiliary()
                && index > range.start
                && index > start
                && seq[index - 1].is_box();
            let penalty_break = el.is_penalty()
                && el.penalty_value() < INFINITE_PENALTY
                && (index >= start || el.is_forced_break());
            let legal = (glue_break || penalty_break) && self.break_allowed(el);
            if legal {
                outcome.stats.breaks_considered += 1;
                let penalty_width = if el.is_penalty() { el.width() } else { Mpt::ZERO };
                let body = pw[at(index)] - pw[at(start)] + penalty_width;
                let stretch = pst[at(index)] - pst[at(start)];
                let shrink = psh[at(index)] - psh[at(start)];
                let target = measures.measure_for_part(part);
                let diff = target - body;
                let ratio = compute_adjustment_ratio(diff, stretch, shrink);
                let feasible = ratio >= Ratio::MINUS_ONE
                    && (self.alignment != Alignment::Justify || ratio <= self.threshold);

                if el.is_forced_break() {
                    if ratio < Ratio::MINUS_ONE {
                        if let Some((bp, br, bd)) = last_feasible.take() {
                            outcome.breaks.push(BreakPoint {
                                position: bp,
                                part,
                                adjust_ratio: br,
                                difference: bd,
                                demerits: badness(clamp_badness_ratio(self, br)),
                                break_class: seq[bp].break_class(),
                            });
                            part += 1;
                            start = restart_after(bp);
                            index = bp;
                            index += 1;
                            continue;
                        }
                        outcome.fallback_used = true;
                    }
                    outcome.breaks.push(BreakPoint {
                        position: index,
                        part,
                        adjust_ratio: ratio.max(Ratio::MINUS_ONE),
                        difference: diff,
                        demerits: badness(clamp_badness_ratio(self, ratio)),
                        break_class: el.break_class(),
                    });
                    part += 1;
                    start = restart_after(index);
                    last_feasible = None;
                } else if feasible {
                    last_feasible = Some((index, ratio, diff));
                } else if ratio < Ratio::MINUS_ONE {
                    let (bp, br, bd) = match last_feasible.take() {
                        Some(found) => found,
                        None => {
                            outcome.fallback_used = true;
                            (index, ratio.max(Ratio::MINUS_ONE), diff)
                        }
                    };
                    outcome.breaks.push(BreakPoint {
                        position: bp,
                        part,
                        adjust_ratio: br,
                        difference: bd,
                        demerits: badness(clamp_badness_ratio(self, br)),
                        break_class: seq[bp].break_class(),
                    });
                    part += 1;
                    start = restart_after(bp);
                    index = bp;
                }
            }
            index += 1;
        }

        if !seq.ends_with_forced_break() {
            let last = range.end - 1;
            let body = pw[at(range.end)] - pw[at(start)];
            let stretch = pst[at(range.end)] - pst[at(start)];
            let shrink = psh[at(range.end)] - psh[at(start)];
            let target = measures.measure_for_part(part);
            let diff = target - body;
            let ratio = compute_adjustment_ratio(diff, stretch, shrink);
            if ratio < Ratio::MINUS_ONE {
                if let Some((bp, br, bd)) = last_feasible.take() {
                    outcome.breaks.push(BreakPoint {
                        position: bp,
                        part,
                        adjust_ratio: br,
                        difference: bd,
                        demerits: badness(clamp_badness_ratio(self, br)),
                        break_class: seq[bp].break_class(),
                    });
                    part += 1;
                    let new_start = restart_after(bp);
                    let body = pw[at(range.end)] - pw[at(new_start)];
                    let diff = target - body;
                    let stretch = pst[at(range.end)] - pst[at(new_start)];
                    let shrink = psh[at(range.end)] - psh[at(new_start)];
                    let ratio = compute_adjustment_ratio(diff, stretch, shrink);
                    if ratio < Ratio::MINUS_ONE {
                        outcome.fallback_used = true;
                    }
                    outcome.breaks.push(BreakPoint {
                        position: last,
                        part,
                        adjust_ratio: ratio.max(Ratio::MINUS_ONE),
                        difference: diff,
                        demerits: badness(clamp_badness_ratio(self, ratio)),
                        break_class: BreakClass::None,
                    });
                    return outcome;
                }
                outcome.fallback_used = true;
            }
            outcome.breaks.push(BreakPoint {
                position: last,
                part,
                adjust_ratio: ratio.max(Ratio::MINUS_ONE),
                difference: diff,
                demerits: badness(clamp_badness_ratio(self, ratio)),
                break_class: BreakClass::None,
            });
        }
        outcome
    }
}

fn compute_adjustment_ratio(diff: Mpt, stretch: Mpt, shrink: Mpt) -> Ratio {
    if diff > Mpt::ZERO {
        if stretch > Mpt::ZERO {
            Ratio::from_fraction(diff, stretch)
        } else {
            Ratio::INFINITE
        }
    } else if diff < Mpt::ZERO {
        if shrink > Mpt::ZERO {
            Ratio::from_fraction(diff, shrink)
        } else {
            Ratio::NEG_INFINITE
        }
    } else {
        Ratio::ZERO
    }
}

/// TeX badness: 100 * |r|^3, on milli-units with i128 intermediates.
fn badness(ratio: Ratio) -> i64 {
    let m = ratio.abs().to_milli() as i128;
    let cubed = m * m * m;
    let value = (cubed * 100) / 1_000_000_000;
    value.clamp(0, MAX_DEMERITS as i128) as i64
}

fn clamp_badness_ratio(cfg: &BreakingAlgorithm, ratio: Ratio) -> Ratio {
    if ratio < Ratio::MINUS_ONE {
        Ratio::MINUS_ONE
    } else if cfg.alignment == Alignment::Justify {
        ratio.min(cfg.threshold)
    } else {
        ratio.min(cfg.underfull_cap)
    }
}

fn square(value: i128) -> i128 {
    value * value
}

#[derive(Debug, Clone, Copy)]
struct BestSlot {
    demerits: i64,
    pred: NodeId,
    ratio: Ratio,
    difference: Mpt,
}

#[derive(Debug, Default)]
struct BestRecords {
    slots: [Option<BestSlot>; 4],
}

impl BestRecords {
    fn consider(&mut self, fitness: Fitness, slot: BestSlot) {
        let entry = &mut self.slots[fitness.index()];
        let better = match entry {
            Some(existing) => slot.demerits < existing.demerits,
            None => true,
        };
        if better {
            *entry = Some(slot);
        }
    }
}

/// Least-bad infeasible candidate kept for partial-failure recovery. Ordered
/// primarily by how far the part misses the measure, then by path demerits.
#[derive(Debug, Clone, Copy)]
struct FallbackRecord {
    miss: Mpt,
    node: KnuthNode,
}

impl FallbackRecord {
    fn better_than(&self, other: &FallbackRecord) -> bool {
        (self.miss, self.node.total_demerits) < (other.miss, other.node.total_demerits)
    }
}

struct Search<'a> {
    cfg: &'a BreakingAlgorithm,
    seq: &'a ElementSequence,
    measures: &'a dyn MeasureProvider,
    range: std::ops::Range<usize>,
    nodes: Vec<KnuthNode>,
    active: Vec<NodeId>,
    total_width: Mpt,
    total_stretch: Mpt,
    total_shrink: Mpt,
    pruned_fallback: Option<FallbackRecord>,
    fallback_used: bool,
    stats: SearchStats,
}

impl<'a> Search<'a> {
    fn new(
        cfg: &'a BreakingAlgorithm,
        seq: &'a ElementSequence,
        measures: &'a dyn MeasureProvider,
    ) -> Self {
        Self {
            cfg,
            seq,
            measures,
            range: seq.effective_range(),
            nodes: Vec::new(),
            active: Vec::new(),
            total_width: Mpt::ZERO,
            total_stretch: Mpt::ZERO,
            total_shrink: Mpt::ZERO,
            pruned_fallback: None,
            fallback_used: false,
            stats: SearchStats::default(),
        }
    }

    fn run(&mut self, hooks: &mut dyn SearchHooks) -> BreakOutcome {
        if self.range.is_empty() {
            return BreakOutcome::default();
        }

        let root = KnuthNode {
            position: self.range.start,
            part: 0,
            fitness: Fitness::Normal,
            total_width: Mpt::ZERO,
            total_stretch: Mpt::ZERO,
            total_shrink: Mpt::ZERO,
            adjust_ratio: Ratio::ZERO,
            difference: Mpt::ZERO,
            flagged: false,
            flagged_run: 0,
            break_class: BreakClass::None,
            total_demerits: 0,
            previous: None,
        };
        let root_id = self.push_node(root);
        self.active.push(root_id);
        hooks.root_created(root_id);

        for index in self.range.clone() {
            let el = self.seq[index];
            match el {
                Element::Box { width, .. } => {
                    self.total_width += width;
                }
                Element::Glue {
                    width,
                    stretch,
                    shrink,
                    auxiliary,
                    ..
                } => {
                    let legal = !auxiliary
                        && index > self.range.start
                        && self.seq[index - 1].is_box();
                    if legal && self.cfg.break_allowed(&el) {
                        self.consider_break(index, &el, false, hooks);
                    }
                    self.total_width += width;
                    self.total_stretch += stretch;
                    self.total_shrink += shrink;
                }
                Element::Penalty { value, .. } => {
                    if value < INFINITE_PENALTY && self.cfg.break_allowed(&el) {
                        self.consider_break(index, &el, el.is_forced_break(), hooks);
                    }
                }
            }
        }

        if !self.seq.ends_with_forced_break() {
            let end_penalty = Element::forced_break(BreakClass::None);
            self.consider_break(self.range.end - 1, &end_penalty, true, hooks);
        }

        self.extract()
    }

    fn push_node(&mut self, node: KnuthNode) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.stats.nodes_created += 1;
        id
    }

    /// Relaxation step at one legal break candidate.
    fn consider_break(
        &mut self,
        pos: usize,
        el: &Element,
        is_forced: bool,
        hooks: &mut dyn SearchHooks,
    ) {
        self.stats.breaks_considered += 1;
        if self.active.is_empty() {
            self.revive_pruned(hooks);
            if self.active.is_empty() {
                return;
            }
        }

        let penalty_width = if el.is_penalty() { el.width() } else { Mpt::ZERO };
        let penalty_value = el.penalty_value();
        let flagged = el.is_flagged();

        let mut best_per_part: BTreeMap<usize, BestRecords> = BTreeMap::new();
        let mut least_bad: Option<FallbackRecord> = None;
        let mut surviving: Vec<NodeId> = Vec::with_capacity(self.active.len());

        for i in 0..self.active.len() {
            let id = self.active[i];
            let node = self.nodes[id];
            let body = self.total_width - node.total_width + penalty_width;
            let stretch = self.total_stretch - node.total_stretch;
            let shrink = self.total_shrink - node.total_shrink;
            let target = self.measures.measure_for_part(node.part);
            let extra = hooks.extra_length(id, &node, pos, body, target);
            let diff = target - body - extra;
            let ratio = compute_adjustment_ratio(diff, stretch, shrink);

            let too_long = ratio < Ratio::MINUS_ONE;
            let too_short = self.cfg.alignment == Alignment::Justify
                && ratio > self.cfg.threshold;

            if !too_long && !too_short {
                let badness_ratio = clamp_badness_ratio(self.cfg, ratio);
                let fitness = Fitness::from_ratio(badness_ratio);
                let mut demerits = self.compute_demerits(
                    &node,
                    badness_ratio,
                    penalty_value,
                    flagged,
                    fitness,
                    is_forced,
                );
                demerits = demerits.saturating_add(hooks.extra_demerits(id, pos, is_forced));
                if let Some(override_d) = hooks.demerits_override(&node, diff, target) {
                    demerits = override_d.saturating_add(node.total_demerits);
                }
                best_per_part.entry(node.part).or_default().consider(
                    fitness,
                    BestSlot {
                        demerits,
                        pred: id,
                        ratio,
                        difference: diff,
                    },
                );
                surviving.push(id);
            } else {
                // Build the least-bad infeasible candidate for recovery.
                let clamped = if too_long {
                    Ratio::MINUS_ONE
                } else {
                    clamp_badness_ratio(self.cfg, self.cfg.threshold)
                };
                let fitness = Fitness::from_ratio(clamped);
                let mut demerits = self.compute_demerits(
                    &node, clamped, penalty_value, flagged, fitness, is_forced,
                );
                demerits = demerits.saturating_add(hooks.extra_demerits(id, pos, is_forced));
                let candidate = FallbackRecord {
                    miss: diff.abs(),
                    node: self.infeasible_node(pos, &node, id, el, ratio, diff, fitness, demerits),
                };
                let better = match &least_bad {
                    Some(existing) => candidate.better_than(existing),
                    None => true,
                };
                if better {
                    least_bad = Some(candidate);
                }
                if too_long {
                    // Width only grows from here; the node can never fit again.
                    self.stats.nodes_pruned += 1;
                    let better_global = match &self.pruned_fallback {
                        Some(existing) => candidate.better_than(existing),
                        None => true,
                    };
                    if better_global {
                        self.pruned_fallback = Some(candidate);
                    }
                } else {
                    // Too short: more content may still arrive.
                    surviving.push(id);
                }
            }
        }

        self.active = surviving;

        let mut created: Vec<NodeId> = Vec::new();
        let (after_w, after_st, after_sh) = self.totals_after(pos);
        for (part, records) in &best_per_part {
            for index in 0..4 {
                let Some(slot) = records.slots[index] else {
                    continue;
                };
                let fitness = Fitness::from_index(index);
                let pred_run = self.nodes[slot.pred].flagged_run;
                let node = KnuthNode {
                    position: pos,
                    part: part + 1,
                    fitness,
                    total_width: after_w,
                    total_stretch: after_st,
                    total_shrink: after_sh,
                    adjust_ratio: slot.ratio,
                    difference: slot.difference,
                    flagged,
                    flagged_run: if flagged { pred_run + 1 } else { 0 },
                    break_class: el.break_class(),
                    total_demerits: slot.demerits,
                    previous: Some(slot.pred),
                };
                let id = self.push_node(node);
                hooks.node_created(id, slot.pred, pos);
                created.push(id);
            }
        }

        if is_forced {
            // A break is guaranteed here: only the best survivor continues.
            let winner = created
                .iter()
                .copied()
                .min_by_key(|id| (self.nodes[*id].total_demerits, *id));
            match winner {
                Some(id) => {
                    self.stats.nodes_pruned += (self.active.len() + created.len() - 1) as u64;
                    self.active = vec![id];
                }
                None => {
                    if let Some(record) = least_bad {
                        let id = self.push_node(record.node);
                        if let Some(pred) = record.node.previous {
                            hooks.node_created(id, pred, record.node.position);
                        }
                        self.stats.nodes_pruned += self.active.len() as u64;
                        self.active = vec![id];
                        self.fallback_used = true;
                    }
                }
            }
        } else {
            self.active.extend(created);
        }
    }

    /// Node totals after a break: the break element itself (when glue) and
    /// any discardable run up to the next box stay out of the next part's
    /// demand.
    fn totals_after(&self, pos: usize) -> (Mpt, Mpt, Mpt) {
        let mut w = self.total_width;
        let mut st = self.total_stretch;
        let mut sh = self.total_shrink;
        let mut j = pos;
        while j < self.range.end {
            match &self.seq[j] {
                Element::Box { .. } => break,
                Element::Glue {
                    width,
                    stretch,
                    shrink,
                    ..
                } => {
                    w += *width;
                    st += *stretch;
                    sh += *shrink;
                }
                Element::Penalty { .. } => {}
            }
            j += 1;
        }
        (w, st, sh)
    }

    #[allow(clippy::too_many_arguments)]
    fn infeasible_node(
        &self,
        pos: usize,
        pred: &KnuthNode,
        pred_id: NodeId,
        el: &Element,
        ratio: Ratio,
        diff: Mpt,
        fitness: Fitness,
        demerits: i64,
    ) -> KnuthNode {
        let (w, st, sh) = self.totals_after(pos);
        KnuthNode {
            position: pos,
            part: pred.part + 1,
            fitness,
            total_width: w,
            total_stretch: st,
            total_shrink: sh,
            adjust_ratio: ratio.max(Ratio::MINUS_ONE).min(Ratio::INFINITE),
            difference: diff,
            flagged: el.is_flagged(),
            flagged_run: if el.is_flagged() {
                pred.flagged_run + 1
            } else {
                0
            },
            break_class: el.break_class(),
            total_demerits: demerits,
            previous: Some(pred_id),
        }
    }

    fn revive_pruned(&mut self, hooks: &mut dyn SearchHooks) {
        if let Some(record) = self.pruned_fallback.take() {
            let id = self.push_node(record.node);
            if let Some(pred) = record.node.previous {
                hooks.node_created(id, pred, record.node.position);
            }
            self.active.push(id);
            self.fallback_used = true;
        }
    }

    fn compute_demerits(
        &self,
        node: &KnuthNode,
        badness_ratio: Ratio,
        penalty: i32,
        flagged: bool,
        fitness: Fitness,
        is_forced: bool,
    ) -> i64 {
        let b = badness(badness_ratio) as i128;
        let one_plus = 1 + b;
        let mut d = if is_forced || penalty <= -INFINITE_PENALTY {
            square(one_plus)
        } else if penalty >= 0 {
            square(one_plus + penalty as i128)
        } else {
            square(one_plus) - square(penalty as i128)
        };
        if d < 0 {
            d = 0;
        }
        if flagged && node.flagged {
            d += self.cfg.flagged_demerits as i128;
        }
        let run = if flagged { node.flagged_run + 1 } else { 0 };
        if run > self.cfg.max_flagged_run {
            d += self.cfg.flagged_run_demerits as i128;
        }
        if fitness.jump(node.fitness) > 1 {
            d += self.cfg.fitness_demerits as i128;
        }
        let d = d.clamp(0, MAX_DEMERITS as i128) as i64;
        d.saturating_add(node.total_demerits).min(MAX_DEMERITS)
    }

    fn extract(&mut self) -> BreakOutcome {
        let terminal = self
            .active
            .iter()
            .copied()
            .min_by_key(|id| (self.nodes[*id].total_demerits, *id));
        let Some(terminal) = terminal else {
            return BreakOutcome {
                breaks: Vec::new(),
                fallback_used: self.fallback_used,
                stats: self.stats,
                chosen_nodes: Vec::new(),
            };
        };

        let mut chain = Vec::new();
        let mut cursor = Some(terminal);
        while let Some(id) = cursor {
            let node = self.nodes[id];
            if node.previous.is_none() {
                break;
            }
            chain.push(id);
            cursor = node.previous;
        }
        chain.reverse();

        let breaks = chain
            .iter()
            .map(|id| {
                let node = self.nodes[*id];
                BreakPoint {
                    position: node.position,
                    part: node.part - 1,
                    adjust_ratio: node.adjust_ratio,
                    difference: node.difference,
                    demerits: node.total_demerits,
                    break_class: node.break_class,
                }
            })
            .collect();

        BreakOutcome {
            breaks,
            fallback_used: self.fallback_used,
            stats: self.stats,
            chosen_nodes: chain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpt(v: i64) -> Mpt {
        Mpt::from_milli(v)
    }

    fn seq_of(elements: Vec<Element>) -> ElementSequence {
        ElementSequence::from(elements)
    }

    fn fill_and_force() -> [Element; 2] {
        [
            Element::glue(Mpt::ZERO, mpt(1_000_000), Mpt::ZERO),
            Element::forced_break(BreakClass::None),
        ]
    }

    #[test]
    fn infinite_penalty_forces_break_after_glue() {
        let seq = seq_of(vec![
            Element::new_box(mpt(100)),
            Element::glue(Mpt::ZERO, Mpt::ZERO, Mpt::ZERO),
            Element::new_box(mpt(100)),
            Element::penalty(INFINITE_PENALTY, false),
            Element::new_box(mpt(100)),
        ]);
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(150));
        assert_eq!(outcome.positions(), vec![1, 4]);
        assert!(outcome.fallback_used);
        // The trailing part carries the overflow.
        assert!(outcome.breaks[1].difference.is_negative());
    }

    #[test]
    fn justified_paragraph_breaks_at_the_exact_fit() {
        let mut elements = vec![
            Element::new_box(mpt(60)),
            Element::glue(mpt(10), mpt(20), mpt(5)),
            Element::new_box(mpt(60)),
            Element::glue(mpt(10), mpt(20), mpt(5)),
            Element::new_box(mpt(60)),
            Element::glue(mpt(10), mpt(20), mpt(5)),
            Element::new_box(mpt(60)),
        ];
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let algo = BreakingAlgorithm::new(Alignment::Justify);
        let outcome = algo.find_break_points(&seq, &mpt(200));
        assert_eq!(outcome.positions(), vec![5, 8]);
        assert!(!outcome.fallback_used);
        assert_eq!(outcome.breaks[0].adjust_ratio, Ratio::ZERO);
    }

    #[test]
    fn varying_measures_are_queried_per_part() {
        let mut elements = vec![
            Element::new_box(mpt(100)),
            Element::glue(Mpt::ZERO, Mpt::ZERO, Mpt::ZERO),
            Element::new_box(mpt(100)),
            Element::glue(Mpt::ZERO, Mpt::ZERO, Mpt::ZERO),
            Element::new_box(mpt(100)),
        ];
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let measures = vec![mpt(100), mpt(210)];
        let outcome = algo.find_break_points(&seq, &measures);
        assert_eq!(outcome.positions(), vec![1, 6]);
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn only_forced_mode_ignores_optional_breaks() {
        let mut elements = vec![
            Element::new_box(mpt(100)),
            Element::glue(Mpt::ZERO, Mpt::ZERO, Mpt::ZERO),
            Element::new_box(mpt(100)),
        ];
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let algo =
            BreakingAlgorithm::new(Alignment::Start).with_allowed_breaks(AllowedBreaks::OnlyForced);
        let outcome = algo.find_break_points(&seq, &mpt(150));
        assert_eq!(outcome.positions(), vec![4]);
    }

    #[test]
    fn trailing_forced_break_emits_no_empty_part() {
        let seq = seq_of(vec![
            Element::new_box(mpt(100)),
            Element::forced_break(BreakClass::Page),
        ]);
        assert!(seq.ends_with_forced_break());
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(150));
        assert_eq!(outcome.positions(), vec![1]);
        assert_eq!(outcome.breaks.len(), 1);
    }

    #[test]
    fn empty_sequence_emits_no_parts() {
        let seq = ElementSequence::new();
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(150));
        assert!(outcome.breaks.is_empty());
    }

    #[test]
    fn part_ranges_partition_the_sequence() {
        let mut elements = vec![
            Element::new_box(mpt(80)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(80)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(80)),
        ];
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(100));
        let ranges = outcome.part_ranges(&seq);
        assert!(!ranges.is_empty());
        let mut expected_start = seq.effective_range().start;
        for (start, end) in &ranges {
            assert_eq!(*start, expected_start);
            assert!(end >= start);
            expected_start = end + 1;
        }
        assert_eq!(expected_start, seq.effective_range().end);
    }

    #[test]
    fn identical_inputs_break_identically() {
        let mut elements = Vec::new();
        for i in 0..40 {
            elements.push(Element::new_box(mpt(40 + (i % 7) * 5)));
            elements.push(Element::glue(mpt(10), mpt(6), mpt(4)));
        }
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let algo = BreakingAlgorithm::new(Alignment::Justify);
        let a = algo.find_break_points(&seq, &mpt(200));
        let b = algo.find_break_points(&seq, &mpt(200));
        assert_eq!(a.positions(), b.positions());
        let ratios_a: Vec<i64> = a.breaks.iter().map(|bp| bp.adjust_ratio.to_milli()).collect();
        let ratios_b: Vec<i64> = b.breaks.iter().map(|bp| bp.adjust_ratio.to_milli()).collect();
        assert_eq!(ratios_a, ratios_b);
    }

    #[test]
    fn always_keep_region_is_never_split() {
        // Breaks between the boxes are forbidden outright; the region
        // overflows as one part instead of splitting.
        let seq = seq_of(vec![
            Element::new_box(mpt(50)),
            Element::penalty(INFINITE_PENALTY, false),
            Element::new_box(mpt(50)),
            Element::penalty(INFINITE_PENALTY, false),
            Element::new_box(mpt(50)),
        ]);
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(60));
        assert_eq!(outcome.positions(), vec![4]);
        assert!(outcome.fallback_used);
    }

    #[test]
    fn strong_keep_breaks_only_without_alternative() {
        // INFINITE - 1 allows a break when nothing else fits.
        let seq = seq_of(vec![
            Element::new_box(mpt(50)),
            Element::penalty(INFINITE_PENALTY - 1, false),
            Element::new_box(mpt(50)),
            Element::penalty(INFINITE_PENALTY - 1, false),
            Element::new_box(mpt(50)),
        ]);
        let algo = BreakingAlgorithm::new(Alignment::Start);
        let outcome = algo.find_break_points(&seq, &mpt(60));
        assert_eq!(outcome.positions(), vec![1, 3, 4]);
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn first_fit_breaks_at_the_latest_feasible_candidate() {
        let seq = seq_of(vec![
            Element::new_box(mpt(150)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(150)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(150)),
            Element::forced_break(BreakClass::None),
        ]);
        let algo = BreakingAlgorithm::new(Alignment::Start).with_mode(SearchMode::FirstFit);
        let outcome = algo.find_break_points(&seq, &mpt(200));
        assert_eq!(outcome.positions(), vec![1, 3, 5]);
        assert!(!outcome.fallback_used);
    }

    #[test]
    fn flagged_run_surcharge_raises_the_cost_of_long_runs() {
        // The flagged penalties are the only legal interior breaks and each
        // part fits exactly, so the run of flagged breaks is unavoidable;
        // raising the run surcharge must raise the path cost without
        // changing the break positions.
        let mut elements = Vec::new();
        for i in 0..6 {
            if i > 0 {
                elements.push(Element::penalty(10, true));
            }
            elements.push(Element::new_box(mpt(100)));
        }
        elements.extend(fill_and_force());
        let seq = seq_of(elements);
        let cheap = BreakingAlgorithm::new(Alignment::Justify);
        let mut dear = BreakingAlgorithm::new(Alignment::Justify);
        dear.flagged_run_demerits = 1_000_000;
        let a = cheap.find_break_points(&seq, &mpt(100));
        let b = dear.find_break_points(&seq, &mpt(100));
        assert_eq!(a.positions(), b.positions());
        let flagged_breaks = a
            .breaks
            .iter()
            .filter(|bp| seq.get(bp.position).is_some_and(Element::is_flagged))
            .count() as u32;
        assert!(flagged_breaks > DEFAULT_MAX_FLAGGED_RUN);
        let last_a = a.breaks.last().map(|bp| bp.demerits).unwrap_or(0);
        let last_b = b.breaks.last().map(|bp| bp.demerits).unwrap_or(0);
        assert!(last_b > last_a);
    }
}
