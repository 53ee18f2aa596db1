use crate::debug::DebugLogger;
use crate::error::FlowBreakError;
use crate::metrics::{FlowMetrics, PartMetrics};
use crate::page_breaking::{
    BalancingColumnBreakingAlgorithm, FloatMode, FootnoteBody, PageBreakOutcome,
    PageBreakPosition, PageBreakingAlgorithm, footnotes_are_ordered,
};
use crate::provider::{
    AreaSink, FloatRequest, FootnoteRange, OverflowPolicy, PartDims, PartProvider, PartRequest,
    RestartResolver,
};
use crate::sequence::ElementSequence;
use crate::types::{Mpt, Ratio};
use std::time::Instant;

/// A float citation: when breaking reaches `citation_pos`, normal part
/// emission is suspended, the float geometry is recorded, and the float
/// content's own layout manager materializes it through the sink.
#[derive(Debug, Clone, Copy)]
pub struct FloatItem {
    pub citation_pos: usize,
    pub height: Mpt,
}

/// One unit of breakable flow content plus its side inputs.
#[derive(Debug, Clone)]
pub struct Flow {
    pub sequence: ElementSequence,
    pub footnotes: Vec<FootnoteBody>,
    pub floats: Vec<FloatItem>,
    pub columns: usize,
    pub balance_columns: bool,
    pub overflow_policy: OverflowPolicy,
}

impl Flow {
    pub fn new(sequence: ElementSequence) -> Self {
        Self {
            sequence,
            footnotes: Vec::new(),
            floats: Vec::new(),
            columns: 1,
            balance_columns: false,
            overflow_policy: OverflowPolicy::Auto,
        }
    }

    pub fn with_footnotes(mut self, footnotes: Vec<FootnoteBody>) -> Self {
        self.footnotes = footnotes;
        self
    }

    pub fn with_floats(mut self, floats: Vec<FloatItem>) -> Self {
        self.floats = floats;
        self
    }

    pub fn with_columns(mut self, columns: usize, balance: bool) -> Self {
        self.columns = columns;
        self.balance_columns = balance;
        self
    }

    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }
}

/// Orchestration state. Each variant carries exactly the payload its phase
/// needs, so stale flag combinations cannot be represented.
enum BreakerPhase {
    Normal,
    HandlingStartOfFloat { item: FloatItem },
    HandlingEndOfFloat { float_height: Mpt },
    NeedsColumnBalancing { from_part: usize },
    NeedsLastPageRedo { final_part: usize },
    Done,
}

/// Substitutes the distinguished last-page geometry during a redo pass.
struct LastPageProvider<'a> {
    inner: &'a dyn PartProvider,
}

impl PartProvider for LastPageProvider<'_> {
    fn part_dims(&self, part_index: usize) -> PartDims {
        self.inner
            .last_part_dims(part_index)
            .unwrap_or_else(|| self.inner.part_dims(part_index))
    }
}

/// Drives repeated invocations of the page breaking algorithm across a
/// flow: float edges, last-page redo, column balancing, page parity and
/// overflow reporting, then instructs the area collaborator to materialize
/// each span.
pub struct FlowBreaker<'a> {
    algorithm: PageBreakingAlgorithm,
    provider: &'a dyn PartProvider,
    restart: Option<&'a dyn RestartResolver>,
    debug: Option<DebugLogger>,
    flow_id: Option<usize>,
}

impl<'a> FlowBreaker<'a> {
    pub fn new(algorithm: PageBreakingAlgorithm, provider: &'a dyn PartProvider) -> Self {
        Self {
            algorithm,
            provider,
            restart: None,
            debug: None,
            flow_id: None,
        }
    }

    pub fn with_restart_resolver(mut self, resolver: &'a dyn RestartResolver) -> Self {
        self.restart = Some(resolver);
        self
    }

    pub(crate) fn with_debug(mut self, debug: DebugLogger, flow_id: Option<usize>) -> Self {
        self.debug = Some(debug);
        self.flow_id = flow_id;
        self
    }

    pub fn run(
        &mut self,
        flow: &Flow,
        sink: &mut dyn AreaSink,
    ) -> Result<FlowMetrics, FlowBreakError> {
        let started = Instant::now();
        let mut metrics = FlowMetrics::default();

        if flow.columns == 0 {
            return Err(FlowBreakError::InvalidConfiguration(
                "columns must be at least 1".to_string(),
            ));
        }
        let seq_len = flow.sequence.len();
        if !footnotes_are_ordered(&flow.footnotes, seq_len.max(1)) {
            return Err(FlowBreakError::InconsistentBreakRequest(
                "footnote citations must be ordered and inside the sequence".to_string(),
            ));
        }
        let mut previous_citation = 0;
        for item in &flow.floats {
            if item.citation_pos < previous_citation || item.citation_pos >= seq_len.max(1) {
                return Err(FlowBreakError::InconsistentBreakRequest(
                    "float citations must be ordered and inside the sequence".to_string(),
                ));
            }
            previous_citation = item.citation_pos;
        }

        let range = flow.sequence.effective_range();
        if range.is_empty() {
            metrics.total_ms = started.elapsed().as_secs_f64() * 1000.0;
            return Ok(metrics);
        }

        let mut cursor = range.start;
        let mut part_index = 0usize;
        let mut float_queue = flow.floats.iter().copied().collect::<Vec<_>>();
        let mut float_offset: Option<Mpt> = None;
        let mut phase = BreakerPhase::Normal;

        loop {
            phase = match phase {
                BreakerPhase::Normal => {
                    if let Some(item) = float_queue.first().copied() {
                        float_queue.remove(0);
                        BreakerPhase::HandlingStartOfFloat { item }
                    } else if cursor >= range.end {
                        BreakerPhase::Done
                    } else {
                        let (segment, footnotes, footnote_offset) = self.segment_from(flow, cursor);
                        let outcome = self.algorithm.find_page_break_points(
                            &segment,
                            &footnotes,
                            self.provider,
                            part_index,
                        );
                        self.log_pass("normal", &outcome);
                        self.fold_stats(&mut metrics, &outcome);

                        let n = outcome.positions.len();
                        if flow.columns > 1 && flow.balance_columns && n > 0 {
                            let tail_parts = match n % flow.columns {
                                0 => flow.columns.min(n),
                                rem => rem,
                            };
                            let from_part = n - tail_parts;
                            let ranges = outcome.part_ranges(&segment);
                            self.commit_parts(
                                flow,
                                sink,
                                &mut metrics,
                                &outcome.positions[..from_part],
                                &ranges[..from_part],
                                cursor,
                                footnote_offset,
                                &mut part_index,
                                &mut float_offset,
                            )?;
                            cursor = if from_part == 0 {
                                cursor
                            } else {
                                ranges[from_part - 1].1 + cursor + 1
                            };
                            BreakerPhase::NeedsColumnBalancing { from_part }
                        } else if n > 0 && self.last_page_differs(part_index + n - 1) {
                            let ranges = outcome.part_ranges(&segment);
                            let final_part = n - 1;
                            self.commit_parts(
                                flow,
                                sink,
                                &mut metrics,
                                &outcome.positions[..final_part],
                                &ranges[..final_part],
                                cursor,
                                footnote_offset,
                                &mut part_index,
                                &mut float_offset,
                            )?;
                            cursor = if final_part == 0 {
                                cursor
                            } else {
                                ranges[final_part - 1].1 + cursor + 1
                            };
                            BreakerPhase::NeedsLastPageRedo {
                                final_part: part_index,
                            }
                        } else {
                            let ranges = outcome.part_ranges(&segment);
                            self.commit_parts(
                                flow,
                                sink,
                                &mut metrics,
                                &outcome.positions,
                                &ranges,
                                cursor,
                                footnote_offset,
                                &mut part_index,
                                &mut float_offset,
                            )?;
                            self.emit_deferred_footnotes(
                                flow,
                                sink,
                                &mut metrics,
                                outcome.deferred_footnotes,
                                footnote_offset,
                                &mut part_index,
                            );
                            cursor = range.end;
                            BreakerPhase::Done
                        }
                    }
                }

                BreakerPhase::HandlingStartOfFloat { item } => {
                    self.algorithm.set_float_mode(FloatMode::HandlingStartOfFloat {
                        y_offset: Mpt::ZERO,
                    });
                    let (segment, footnotes, footnote_offset) = self.segment_from(flow, cursor);
                    let relative_citation = item.citation_pos.saturating_sub(cursor);
                    let outcome = self.algorithm.find_float_edge(
                        &segment,
                        &footnotes,
                        self.provider,
                        part_index,
                        relative_citation,
                        item.height,
                    );
                    self.log_pass("float-edge", &outcome);
                    self.fold_stats(&mut metrics, &outcome);
                    let mut ranges = outcome.part_ranges(&segment);
                    if let (Some(edge), Some(last)) = (outcome.float_edge, ranges.last_mut()) {
                        // The edge pass appends a synthetic forced break; the
                        // final span must not reach past the real edge.
                        last.1 = last.1.min(edge.position);
                    }
                    self.commit_parts(
                        flow,
                        sink,
                        &mut metrics,
                        &outcome.positions,
                        &ranges,
                        cursor,
                        footnote_offset,
                        &mut part_index,
                        &mut float_offset,
                    )?;
                    self.emit_deferred_footnotes(
                        flow,
                        sink,
                        &mut metrics,
                        outcome.deferred_footnotes,
                        footnote_offset,
                        &mut part_index,
                    );
                    match outcome.float_edge {
                        Some(edge) => {
                            let absolute_edge = cursor + edge.position;
                            cursor = absolute_edge + 1;
                            sink.add_float(FloatRequest {
                                part_index,
                                edge_position: absolute_edge,
                                height: edge.height,
                                y_offset: edge.y_offset,
                            });
                        }
                        None => {
                            // No content left ahead of the citation; the
                            // float still has to be materialized.
                            sink.add_float(FloatRequest {
                                part_index,
                                edge_position: cursor.saturating_sub(1),
                                height: item.height,
                                y_offset: Mpt::ZERO,
                            });
                        }
                    }
                    BreakerPhase::HandlingEndOfFloat {
                        float_height: item.height,
                    }
                }

                BreakerPhase::HandlingEndOfFloat { float_height } => {
                    self.algorithm
                        .set_float_mode(FloatMode::HandlingEndOfFloat { float_height });
                    float_offset = Some(float_height);
                    BreakerPhase::Normal
                }

                BreakerPhase::NeedsColumnBalancing { from_part } => {
                    if let Some(debug) = &self.debug {
                        debug.log_event(
                            self.flow_id,
                            "balance",
                            &format!("rebalancing from part {from_part}"),
                        );
                    }
                    let (segment, footnotes, footnote_offset) = self.segment_from(flow, cursor);
                    let balancer = BalancingColumnBreakingAlgorithm::new(
                        self.algorithm.clone(),
                        flow.columns,
                    );
                    let column_bpd = self.provider.part_dims(part_index).bpd;
                    let outcome = balancer.find_balanced_break_points(
                        &segment,
                        &footnotes,
                        column_bpd,
                        part_index,
                    );
                    self.log_pass("balance", &outcome);
                    self.fold_stats(&mut metrics, &outcome);
                    if outcome.positions.len() > flow.columns || outcome.fallback_used {
                        self.emit_overflow_tail(
                            flow,
                            sink,
                            &mut metrics,
                            &segment,
                            cursor,
                            &mut part_index,
                        )?;
                    } else {
                        let ranges = outcome.part_ranges(&segment);
                        self.commit_parts(
                            flow,
                            sink,
                            &mut metrics,
                            &outcome.positions,
                            &ranges,
                            cursor,
                            footnote_offset,
                            &mut part_index,
                            &mut float_offset,
                        )?;
                        self.emit_deferred_footnotes(
                            flow,
                            sink,
                            &mut metrics,
                            outcome.deferred_footnotes,
                            footnote_offset,
                            &mut part_index,
                        );
                    }
                    cursor = range.end;
                    BreakerPhase::Done
                }

                BreakerPhase::NeedsLastPageRedo { final_part } => {
                    if let Some(debug) = &self.debug {
                        debug.log_event(
                            self.flow_id,
                            "last-page-redo",
                            &format!("reflowing tail into part {final_part}"),
                        );
                    }
                    let (segment, footnotes, footnote_offset) = self.segment_from(flow, cursor);
                    let last_provider = LastPageProvider {
                        inner: self.provider,
                    };
                    let outcome = self.algorithm.find_page_break_points(
                        &segment,
                        &footnotes,
                        &last_provider,
                        part_index,
                    );
                    self.log_pass("last-page-redo", &outcome);
                    self.fold_stats(&mut metrics, &outcome);
                    if outcome.positions.len() > flow.columns || outcome.fallback_used {
                        // The redone layout still does not fit: emit the
                        // overflowing content directly plus a trailing blank
                        // part.
                        self.emit_overflow_tail(
                            flow,
                            sink,
                            &mut metrics,
                            &segment,
                            cursor,
                            &mut part_index,
                        )?;
                        self.emit_blank_part(sink, &mut metrics, &mut part_index);
                    } else {
                        let ranges = outcome.part_ranges(&segment);
                        self.commit_parts(
                            flow,
                            sink,
                            &mut metrics,
                            &outcome.positions,
                            &ranges,
                            cursor,
                            footnote_offset,
                            &mut part_index,
                            &mut float_offset,
                        )?;
                        self.emit_deferred_footnotes(
                            flow,
                            sink,
                            &mut metrics,
                            outcome.deferred_footnotes,
                            footnote_offset,
                            &mut part_index,
                        );
                    }
                    cursor = range.end;
                    BreakerPhase::Done
                }

                BreakerPhase::Done => break,
            };
        }

        self.algorithm.set_float_mode(FloatMode::None);
        if let Some(debug) = &self.debug {
            debug.emit_summary("flow");
            debug.flush();
        }
        metrics.total_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(metrics)
    }

    /// Clones the uncommitted tail starting at `cursor` and filters the
    /// footnote lists down to citations inside it, remapped to the tail's
    /// indices. Returns the tail, its footnotes, and the index of the first
    /// retained footnote list (for mapping slice indices back).
    fn segment_from(
        &self,
        flow: &Flow,
        cursor: usize,
    ) -> (ElementSequence, Vec<FootnoteBody>, usize) {
        let range = flow.sequence.effective_range();
        let mut segment = ElementSequence::with_capacity(range.end - cursor);
        for index in cursor..range.end {
            segment.push(flow.sequence[index]);
        }
        let footnote_offset = flow
            .footnotes
            .partition_point(|f| f.citation_pos < cursor);
        let footnotes = flow.footnotes[footnote_offset..]
            .iter()
            .map(|f| FootnoteBody {
                citation_pos: f.citation_pos - cursor,
                elements: f.elements.clone(),
            })
            .collect();
        (segment, footnotes, footnote_offset)
    }

    fn last_page_differs(&self, part_index: usize) -> bool {
        match self.provider.last_part_dims(part_index) {
            Some(last) => last != self.provider.part_dims(part_index),
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_parts(
        &self,
        flow: &Flow,
        sink: &mut dyn AreaSink,
        metrics: &mut FlowMetrics,
        positions: &[PageBreakPosition],
        ranges: &[(usize, usize)],
        element_offset: usize,
        footnote_offset: usize,
        part_index: &mut usize,
        float_offset: &mut Option<Mpt>,
    ) -> Result<(), FlowBreakError> {
        for (position, range) in positions.iter().zip(ranges.iter()) {
            let abs_range = (range.0 + element_offset, range.1 + element_offset);

            if *part_index > 0 {
                let previous_ipd = self.provider.part_dims(*part_index - 1).ipd;
                let current_ipd = self.provider.part_dims(*part_index).ipd;
                if previous_ipd != current_ipd && metrics.restart_at.is_none() {
                    self.handle_ipd_change(flow, sink, metrics, abs_range, *part_index);
                }
            }

            if position.difference.is_negative() {
                let amount = -position.difference;
                let source = flow.sequence[abs_range.0].position();
                sink.notify_overflow(*part_index, amount, source);
                metrics.overflows += 1;
                if flow.overflow_policy == OverflowPolicy::ErrorIfOverflow {
                    return Err(FlowBreakError::ContentOverflow {
                        part: *part_index,
                        amount,
                    });
                }
            }

            let footnotes = position.footnotes.map(|slice| FootnoteRange {
                first_list: slice.first_list + footnote_offset,
                first_element: slice.first_element,
                last_list: slice.last_list + footnote_offset,
                last_element: slice.last_element,
            });
            let footnote_elements = footnotes
                .map(|slice| self.count_footnote_elements(flow, slice))
                .unwrap_or(0);

            sink.add_part(PartRequest {
                part_index: *part_index,
                range: Some(abs_range),
                adjust_ratio: position.adjust_ratio,
                difference: position.difference,
                footnotes,
                float_offset: float_offset.take(),
            });
            metrics.parts.push(PartMetrics {
                part_index: *part_index,
                element_count: abs_range.1 - abs_range.0 + 1,
                footnote_element_count: footnote_elements,
                adjust_ratio: position.adjust_ratio,
                difference: position.difference,
                blank: false,
            });
            *part_index += 1;

            if flow.columns == 1 {
                // Page parity: an even-page / odd-page break means the next
                // part must land on a page of that parity.
                let next_page_is_odd = *part_index % 2 == 0;
                let needs_blank = match position.break_class {
                    crate::element::BreakClass::EvenPage => next_page_is_odd,
                    crate::element::BreakClass::OddPage => !next_page_is_odd,
                    _ => false,
                };
                if needs_blank {
                    self.emit_blank_part(sink, metrics, part_index);
                }
            }
        }
        Ok(())
    }

    fn handle_ipd_change(
        &self,
        flow: &Flow,
        sink: &mut dyn AreaSink,
        metrics: &mut FlowMetrics,
        abs_range: (usize, usize),
        part_index: usize,
    ) {
        if let Some(debug) = &self.debug {
            debug.log_event(self.flow_id, "ipd-change", "inline measure changed");
        }
        let Some(resolver) = self.restart else {
            return;
        };
        let mut restart_at = None;
        for index in (abs_range.0..=abs_range.1).rev() {
            if let Some(position) = flow.sequence[index].position() {
                if resolver.is_restartable(position) {
                    restart_at = Some(index);
                    break;
                }
            }
        }
        match restart_at {
            Some(index) => {
                metrics.restart_at = Some(index);
            }
            None => {
                let source = flow.sequence[abs_range.0].position();
                sink.notify_non_restartable(part_index, source);
            }
        }
    }

    fn count_footnote_elements(&self, flow: &Flow, slice: FootnoteRange) -> usize {
        let mut count = 0;
        for list in slice.first_list..=slice.last_list.min(flow.footnotes.len().saturating_sub(1)) {
            let len = flow.footnotes[list].elements.len();
            let start = if list == slice.first_list {
                slice.first_element
            } else {
                0
            };
            let end = if list == slice.last_list {
                slice.last_element
            } else {
                len
            };
            count += end.saturating_sub(start);
        }
        count
    }

    /// Footnote material left over after the final break spills into
    /// footnote-only continuation parts, at least one element per part.
    fn emit_deferred_footnotes(
        &self,
        flow: &Flow,
        sink: &mut dyn AreaSink,
        metrics: &mut FlowMetrics,
        deferred: Option<FootnoteRange>,
        footnote_offset: usize,
        part_index: &mut usize,
    ) {
        let Some(slice) = deferred else {
            return;
        };
        let mut list = slice.first_list + footnote_offset;
        let mut element = slice.first_element;
        let separator = self.algorithm.footnote_separator();
        while list < flow.footnotes.len() {
            let dims = self.provider.part_dims(*part_index);
            let budget = (dims.bpd - separator).clamp_non_negative();
            let start = (list, element);
            let mut used = Mpt::ZERO;
            let mut placed = 0usize;
            while list < flow.footnotes.len() {
                let elements = &flow.footnotes[list].elements;
                if element >= elements.len() {
                    list += 1;
                    element = 0;
                    continue;
                }
                let el = &elements[element];
                let width = if el.is_box() || el.is_glue() {
                    el.width()
                } else {
                    Mpt::ZERO
                };
                if placed > 0 && used + width > budget {
                    break;
                }
                used += width;
                element += 1;
                placed += 1;
            }
            if placed == 0 {
                break;
            }
            let footnotes = Some(FootnoteRange {
                first_list: start.0,
                first_element: start.1,
                last_list: list,
                last_element: element,
            });
            sink.add_part(PartRequest {
                part_index: *part_index,
                range: None,
                adjust_ratio: Ratio::ZERO,
                difference: budget - used,
                footnotes,
                float_offset: None,
            });
            metrics.parts.push(PartMetrics {
                part_index: *part_index,
                element_count: 0,
                footnote_element_count: placed,
                adjust_ratio: Ratio::ZERO,
                difference: budget - used,
                blank: false,
            });
            *part_index += 1;
        }
    }

    fn emit_blank_part(
        &self,
        sink: &mut dyn AreaSink,
        metrics: &mut FlowMetrics,
        part_index: &mut usize,
    ) {
        let dims = self.provider.part_dims(*part_index);
        sink.add_part(PartRequest {
            part_index: *part_index,
            range: None,
            adjust_ratio: Ratio::ZERO,
            difference: dims.bpd,
            footnotes: None,
            float_offset: None,
        });
        metrics.parts.push(PartMetrics {
            part_index: *part_index,
            element_count: 0,
            footnote_element_count: 0,
            adjust_ratio: Ratio::ZERO,
            difference: dims.bpd,
            blank: true,
        });
        *part_index += 1;
    }

    /// Fallback emission when a redo still cannot fit the available column
    /// count: the whole tail goes out as one overfull part.
    fn emit_overflow_tail(
        &self,
        flow: &Flow,
        sink: &mut dyn AreaSink,
        metrics: &mut FlowMetrics,
        segment: &ElementSequence,
        element_offset: usize,
        part_index: &mut usize,
    ) -> Result<(), FlowBreakError> {
        let segment_range = segment.effective_range();
        if segment_range.is_empty() {
            return Ok(());
        }
        let abs_range = (
            segment_range.start + element_offset,
            segment_range.end - 1 + element_offset,
        );
        let demand = segment.effective_content_length();
        let dims = self
            .provider
            .last_part_dims(*part_index)
            .unwrap_or_else(|| self.provider.part_dims(*part_index));
        let difference = dims.bpd - demand;
        if difference.is_negative() {
            let amount = -difference;
            let source = flow.sequence[abs_range.0].position();
            sink.notify_overflow(*part_index, amount, source);
            metrics.overflows += 1;
            if flow.overflow_policy == OverflowPolicy::ErrorIfOverflow {
                return Err(FlowBreakError::ContentOverflow {
                    part: *part_index,
                    amount,
                });
            }
        }
        sink.add_part(PartRequest {
            part_index: *part_index,
            range: Some(abs_range),
            adjust_ratio: Ratio::MINUS_ONE,
            difference,
            footnotes: None,
            float_offset: None,
        });
        metrics.parts.push(PartMetrics {
            part_index: *part_index,
            element_count: abs_range.1 - abs_range.0 + 1,
            footnote_element_count: 0,
            adjust_ratio: Ratio::MINUS_ONE,
            difference,
            blank: false,
        });
        *part_index += 1;
        metrics.fallback_parts += 1;
        Ok(())
    }

    fn fold_stats(&self, metrics: &mut FlowMetrics, outcome: &PageBreakOutcome) {
        metrics.passes += 1;
        metrics.nodes_created += outcome.stats.nodes_created;
        metrics.nodes_pruned += outcome.stats.nodes_pruned;
        if outcome.fallback_used {
            metrics.fallback_parts += 1;
        }
    }

    fn log_pass(&self, kind: &str, outcome: &PageBreakOutcome) {
        if let Some(debug) = &self.debug {
            debug.log_pass(
                self.flow_id,
                kind,
                outcome.positions.len(),
                outcome.stats.nodes_created,
                outcome.stats.nodes_pruned,
                outcome.fallback_used,
            );
            debug.increment("parts", outcome.positions.len() as u64);
            debug.increment("nodes", outcome.stats.nodes_created);
        }
    }
}
