mod breaker;
mod breaking;
mod debug;
mod element;
mod error;
mod keep;
mod metrics;
mod page_breaking;
mod provider;
mod sequence;
mod types;

pub use breaker::{FloatItem, Flow, FlowBreaker};
pub use breaking::{
    Alignment, AllowedBreaks, BreakOutcome, BreakPoint, BreakingAlgorithm, MeasureProvider,
    SearchMode, SearchStats,
};
use debug::DebugLogger;
pub use element::{BreakClass, Element, INFINITE_PENALTY, SourcePosition};
pub use error::FlowBreakError;
pub use keep::{Keep, KeepContext, KeepStrength};
pub use metrics::{FlowMetrics, PartMetrics};
pub use page_breaking::{
    BalancingColumnBreakingAlgorithm, FloatEdge, FloatMode, FootnoteBody, PageBreakOutcome,
    PageBreakPosition, PageBreakingAlgorithm,
};
pub use provider::{
    AreaSink, CallbackSink, CollectingSink, FloatRequest, FootnoteRange, KeepResolver,
    OverflowPolicy, PartDims, PartProvider, PartRequest, RestartResolver, UniformPartProvider,
};
use rayon::prelude::*;
pub use sequence::ElementSequence;
pub use types::{Mpt, Ratio};

/// The breaking engine: validated configuration shared by every breaker it
/// spawns. Construct through [`FlowBreak::builder`].
pub struct FlowBreak {
    alignment: Alignment,
    threshold: Ratio,
    underfull_cap: Ratio,
    flagged_demerits: i64,
    flagged_run_demerits: i64,
    max_flagged_run: u32,
    fitness_demerits: i64,
    footnote_separator: Mpt,
    deferred_footnote_demerits: i64,
    debug: Option<DebugLogger>,
}

/// The result of breaking one flow through the buffering entry points.
#[derive(Clone, Debug)]
pub struct BrokenFlow {
    pub metrics: FlowMetrics,
    pub parts: Vec<PartRequest>,
    pub floats: Vec<FloatRequest>,
    pub overflows: Vec<(usize, Mpt)>,
}

impl FlowBreak {
    pub fn builder() -> FlowBreakBuilder {
        FlowBreakBuilder::new()
    }

    /// The configured core line/block breaking algorithm.
    pub fn line_algorithm(&self) -> BreakingAlgorithm {
        let mut algorithm = BreakingAlgorithm::new(self.alignment);
        algorithm.threshold = self.threshold;
        algorithm.underfull_cap = self.underfull_cap;
        algorithm.flagged_demerits = self.flagged_demerits;
        algorithm.flagged_run_demerits = self.flagged_run_demerits;
        algorithm.max_flagged_run = self.max_flagged_run;
        algorithm.fitness_demerits = self.fitness_demerits;
        algorithm
    }

    /// The configured page-level specialization.
    pub fn page_algorithm(&self) -> PageBreakingAlgorithm {
        PageBreakingAlgorithm::new(self.line_algorithm())
            .with_footnote_separator(self.footnote_separator)
            .with_deferred_footnote_demerits(self.deferred_footnote_demerits)
    }

    /// A breaker wired to this engine's configuration and debug trace.
    /// Callers that need a restart resolver attach it before running.
    pub fn breaker<'a>(&self, provider: &'a dyn PartProvider) -> FlowBreaker<'a> {
        let mut breaker = FlowBreaker::new(self.page_algorithm(), provider);
        if let Some(debug) = &self.debug {
            breaker = breaker.with_debug(debug.clone(), None);
        }
        breaker
    }

    /// Breaks one element sequence against per-part measures, returning the
    /// ordered break points.
    pub fn break_lines(
        &self,
        seq: &ElementSequence,
        measures: &dyn MeasureProvider,
    ) -> Result<BreakOutcome, FlowBreakError> {
        if !seq.is_empty() && measures.measure_for_part(0) <= Mpt::ZERO {
            return Err(FlowBreakError::InvalidConfiguration(
                "target measure must be positive".to_string(),
            ));
        }
        Ok(self.line_algorithm().find_break_points(seq, measures))
    }

    /// Breaks a flow into pages/columns, handing each part to the sink.
    pub fn break_pages(
        &self,
        flow: &Flow,
        provider: &dyn PartProvider,
        sink: &mut dyn AreaSink,
    ) -> Result<(), FlowBreakError> {
        self.break_pages_with_metrics(flow, provider, sink).map(|_| ())
    }

    pub fn break_pages_with_metrics(
        &self,
        flow: &Flow,
        provider: &dyn PartProvider,
        sink: &mut dyn AreaSink,
    ) -> Result<FlowMetrics, FlowBreakError> {
        if !flow.sequence.is_empty() && provider.part_dims(0).bpd <= Mpt::ZERO {
            return Err(FlowBreakError::InvalidConfiguration(
                "part block-progression dimension must be positive".to_string(),
            ));
        }
        self.breaker(provider).run(flow, sink)
    }

    /// Breaks independent flows concurrently, one breaker per flow. Flows
    /// share nothing but the read-only provider, so results are identical to
    /// breaking them one by one.
    pub fn break_flows_parallel(
        &self,
        flows: &[Flow],
        provider: &(dyn PartProvider + Sync),
    ) -> Result<Vec<BrokenFlow>, FlowBreakError> {
        if flows.is_empty() {
            return Err(FlowBreakError::EmptyFlowSet);
        }
        flows
            .par_iter()
            .enumerate()
            .map(|(flow_id, flow)| {
                let mut breaker = FlowBreaker::new(self.page_algorithm(), provider);
                if let Some(debug) = &self.debug {
                    breaker = breaker.with_debug(debug.clone(), Some(flow_id));
                }
                let mut sink = CollectingSink::default();
                let metrics = breaker.run(flow, &mut sink)?;
                Ok(BrokenFlow {
                    metrics,
                    parts: sink.parts,
                    floats: sink.floats,
                    overflows: sink.overflows,
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct FlowBreakBuilder {
    alignment: Alignment,
    threshold: f32,
    underfull_cap: f32,
    flagged_demerits: i64,
    flagged_run_demerits: i64,
    max_flagged_run: u32,
    fitness_demerits: i64,
    footnote_separator: Mpt,
    deferred_footnote_demerits: i64,
    debug_path: Option<std::path::PathBuf>,
}

impl FlowBreakBuilder {
    fn new() -> Self {
        Self {
            alignment: Alignment::Start,
            threshold: 1.0,
            underfull_cap: 1.0,
            flagged_demerits: 10_000,
            flagged_run_demerits: 10_000,
            max_flagged_run: 3,
            fitness_demerits: 10_000,
            footnote_separator: Mpt::ZERO,
            deferred_footnote_demerits: 50_000,
            debug_path: None,
        }
    }

    pub fn alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Maximum stretch ratio a justified part may take before the candidate
    /// break is considered infeasible.
    pub fn stretch_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Ratio at which underfull badness stops growing for non-justified
    /// alignments.
    pub fn underfull_badness_cap(mut self, cap: f32) -> Self {
        self.underfull_cap = cap;
        self
    }

    pub fn flagged_demerits(mut self, demerits: i64) -> Self {
        self.flagged_demerits = demerits;
        self
    }

    pub fn flagged_run(mut self, max_run: u32, demerits: i64) -> Self {
        self.max_flagged_run = max_run;
        self.flagged_run_demerits = demerits;
        self
    }

    pub fn fitness_demerits(mut self, demerits: i64) -> Self {
        self.fitness_demerits = demerits;
        self
    }

    pub fn footnote_separator(mut self, separator: Mpt) -> Self {
        self.footnote_separator = separator;
        self
    }

    pub fn deferred_footnote_demerits(mut self, demerits: i64) -> Self {
        self.deferred_footnote_demerits = demerits;
        self
    }

    pub fn debug_log(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<FlowBreak, FlowBreakError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(FlowBreakError::InvalidConfiguration(
                "stretch_threshold must be a positive finite ratio".to_string(),
            ));
        }
        if !self.underfull_cap.is_finite() || self.underfull_cap <= 0.0 {
            return Err(FlowBreakError::InvalidConfiguration(
                "underfull_badness_cap must be a positive finite ratio".to_string(),
            ));
        }
        if self.max_flagged_run == 0 {
            return Err(FlowBreakError::InvalidConfiguration(
                "flagged_run cap must be at least 1".to_string(),
            ));
        }
        if self.flagged_demerits < 0
            || self.flagged_run_demerits < 0
            || self.fitness_demerits < 0
            || self.deferred_footnote_demerits < 0
        {
            return Err(FlowBreakError::InvalidConfiguration(
                "demerit surcharges must not be negative".to_string(),
            ));
        }
        if self.footnote_separator.is_negative() {
            return Err(FlowBreakError::InvalidConfiguration(
                "footnote_separator must not be negative".to_string(),
            ));
        }
        let debug = match &self.debug_path {
            Some(path) => Some(DebugLogger::new(path)?),
            None => None,
        };
        Ok(FlowBreak {
            alignment: self.alignment,
            threshold: Ratio::from_f32(self.threshold),
            underfull_cap: Ratio::from_f32(self.underfull_cap),
            flagged_demerits: self.flagged_demerits,
            flagged_run_demerits: self.flagged_run_demerits,
            max_flagged_run: self.max_flagged_run,
            fitness_demerits: self.fitness_demerits,
            footnote_separator: self.footnote_separator,
            deferred_footnote_demerits: self.deferred_footnote_demerits,
            debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn mpt(v: i64) -> Mpt {
        Mpt::from_milli(v)
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

    fn temp_log_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!(
            "flowbreak_{tag}_{}_{}.jsonl",
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn builder_rejects_non_positive_threshold() {
        let err = match FlowBreak::builder().stretch_threshold(0.0).build() {
            Ok(_) => panic!("zero threshold should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, FlowBreakError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("stretch_threshold"));
    }

    #[test]
    fn builder_rejects_zero_flagged_run_cap() {
        let err = match FlowBreak::builder().flagged_run(0, 10_000).build() {
            Ok(_) => panic!("zero run cap should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, FlowBreakError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("flagged_run"));
    }

    #[test]
    fn builder_rejects_negative_surcharges() {
        let err = match FlowBreak::builder().fitness_demerits(-1).build() {
            Ok(_) => panic!("negative surcharge should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, FlowBreakError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("demerit"));
    }

    #[test]
    fn default_configuration_builds() {
        FlowBreak::builder().build().expect("defaults are valid");
    }

    #[test]
    fn break_lines_rejects_non_positive_measure() {
        let engine = FlowBreak::builder().build().expect("build");
        let seq = lines(3, 10_000);
        let err = engine
            .break_lines(&seq, &Mpt::ZERO)
            .expect_err("zero measure must fail");
        assert!(matches!(err, FlowBreakError::InvalidConfiguration(_)));
    }

    #[test]
    fn break_lines_produces_ordered_breaks() {
        let engine = FlowBreak::builder().build().expect("build");
        let seq = lines(6, 30_000);
        let outcome = engine
            .break_lines(&seq, &mpt(70_000))
            .expect("lines break");
        assert!(!outcome.breaks.is_empty());
        let positions = outcome.positions();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted);
        assert_eq!(positions.last().copied(), Some(seq.len() - 1));
    }

    #[test]
    fn break_pages_feeds_the_sink() {
        let engine = FlowBreak::builder().build().expect("build");
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let mut sink = CollectingSink::default();
        let flow = Flow::new(lines(6, 30_000));
        let metrics = engine
            .break_pages_with_metrics(&flow, &provider, &mut sink)
            .expect("flow breaks");
        assert_eq!(metrics.parts.len(), sink.parts.len());
        assert!(!sink.parts.is_empty());
    }

    #[test]
    fn parallel_breaking_matches_serial_results() {
        let engine = FlowBreak::builder().build().expect("build");
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let flows: Vec<Flow> = (4..7).map(|n| Flow::new(lines(n, 30_000))).collect();
        let parallel = engine
            .break_flows_parallel(&flows, &provider)
            .expect("parallel breaks");
        assert_eq!(parallel.len(), flows.len());
        for (flow, broken) in flows.iter().zip(parallel.iter()) {
            let mut sink = CollectingSink::default();
            engine
                .break_pages(flow, &provider, &mut sink)
                .expect("serial breaks");
            let serial_ranges: Vec<Option<(usize, usize)>> =
                sink.parts.iter().map(|p| p.range).collect();
            let parallel_ranges: Vec<Option<(usize, usize)>> =
                broken.parts.iter().map(|p| p.range).collect();
            assert_eq!(serial_ranges, parallel_ranges);
        }
    }

    #[test]
    fn parallel_breaking_requires_at_least_one_flow() {
        let engine = FlowBreak::builder().build().expect("build");
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let err = engine
            .break_flows_parallel(&[], &provider)
            .expect_err("empty set must fail");
        assert!(matches!(err, FlowBreakError::EmptyFlowSet));
    }

    #[test]
    fn debug_log_records_breaking_passes() {
        let path = temp_log_path("engine");
        let engine = FlowBreak::builder()
            .debug_log(&path)
            .build()
            .expect("build");
        let provider = UniformPartProvider::new(mpt(70_000), mpt(400_000));
        let mut sink = CollectingSink::default();
        engine
            .break_pages(&Flow::new(lines(6, 30_000)), &provider, &mut sink)
            .expect("flow breaks");
        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("\"type\":\"break.pass\""));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn justified_engine_round_trips_spans() {
        let engine = FlowBreak::builder()
            .alignment(Alignment::Justify)
            .stretch_threshold(2.0)
            .build()
            .expect("build");
        let mut seq = ElementSequence::new();
        for _ in 0..12 {
            seq.push(Element::new_box(mpt(50_000)));
            seq.push(Element::glue(mpt(10_000), mpt(20_000), mpt(4_000)));
        }
        seq.push(Element::glue(Mpt::ZERO, mpt(1_000_000), Mpt::ZERO));
        seq.push(Element::forced_break(BreakClass::None));
        let outcome = engine
            .break_lines(&seq, &mpt(200_000))
            .expect("lines break");
        let ranges = outcome.part_ranges(&seq);
        let mut expected_start = 0;
        for (start, end) in &ranges {
            assert_eq!(*start, expected_start);
            expected_start = end + 1;
        }
        assert_eq!(expected_start, seq.len());
    }
}
