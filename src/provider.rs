use crate::element::SourcePosition;
use crate::keep::Keep;
use crate::types::{Mpt, Ratio};
use std::sync::Arc;

/// Geometry one part (page or column) offers: available block-progression
/// and inline-progression dimensions, plus whether a distinguished last-page
/// geometry applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDims {
    pub bpd: Mpt,
    pub ipd: Mpt,
    pub is_last: bool,
}

/// Supplies per-part geometry. Page 1, following pages and a distinguished
/// last page may all differ. Queried synchronously; must be reentrant-safe
/// across redo passes of the same breaker.
pub trait PartProvider {
    fn part_dims(&self, part_index: usize) -> PartDims;

    /// Geometry the part would get if it turned out to be the flow's last.
    /// None when no distinguished last-page geometry exists.
    fn last_part_dims(&self, _part_index: usize) -> Option<PartDims> {
        None
    }
}

/// Every part gets the same geometry.
#[derive(Debug, Clone, Copy)]
pub struct UniformPartProvider {
    bpd: Mpt,
    ipd: Mpt,
}

impl UniformPartProvider {
    pub fn new(bpd: Mpt, ipd: Mpt) -> Self {
        Self { bpd, ipd }
    }
}

impl PartProvider for UniformPartProvider {
    fn part_dims(&self, _part_index: usize) -> PartDims {
        PartDims {
            bpd: self.bpd,
            ipd: self.ipd,
            is_last: false,
        }
    }
}

/// Per-content-node keep constraints, resolved by the property side of the
/// producing layout context.
pub trait KeepResolver {
    fn keep_together(&self, position: SourcePosition) -> Keep;
    fn keep_with_next(&self, position: SourcePosition) -> Keep;
    fn keep_with_previous(&self, position: SourcePosition) -> Keep;
}

/// Asked, when the inline measure changes across a part boundary, whether
/// the producer owning a position can re-flow its content at a new measure.
pub trait RestartResolver {
    fn is_restartable(&self, position: SourcePosition) -> bool;
}

/// What to do when a part cannot hold its assigned content even after
/// best-effort fitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    #[default]
    Auto,
    Hidden,
    Scroll,
    ErrorIfOverflow,
}

/// Slice of the footnote side lists that goes onto one part. `first_*` is
/// the cursor of the first inserted element (list index, element index);
/// `last_*` is the cursor one past the final inserted element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FootnoteRange {
    pub first_list: usize,
    pub first_element: usize,
    pub last_list: usize,
    pub last_element: usize,
}

/// One materialization request handed to the area collaborator: an element
/// span of the original sequence plus its fitting metadata. `range` is None
/// for blank filler parts (page parity, trailing blank page).
#[derive(Debug, Clone)]
pub struct PartRequest {
    pub part_index: usize,
    pub range: Option<(usize, usize)>,
    pub adjust_ratio: Ratio,
    pub difference: Mpt,
    pub footnotes: Option<FootnoteRange>,
    pub float_offset: Option<Mpt>,
}

impl PartRequest {
    pub fn is_blank(&self) -> bool {
        self.range.is_none()
    }
}

/// Geometry handed back when a float edge is reached; the float content's
/// own layout manager materializes the float itself.
#[derive(Debug, Clone, Copy)]
pub struct FloatRequest {
    pub part_index: usize,
    pub edge_position: usize,
    pub height: Mpt,
    pub y_offset: Mpt,
}

/// The area-materialization collaborator. Parts arrive in order; events are
/// notifications, not questions — recovery decisions were already taken.
pub trait AreaSink {
    fn add_part(&mut self, part: PartRequest);

    fn add_float(&mut self, float: FloatRequest) {
        let _ = float;
    }

    fn notify_overflow(&mut self, part_index: usize, amount: Mpt, source: Option<SourcePosition>) {
        let _ = (part_index, amount, source);
    }

    fn notify_non_restartable(&mut self, part_index: usize, position: Option<SourcePosition>) {
        let _ = (part_index, position);
    }
}

/// Buffers everything it is handed. Used by the parallel entry points and
/// convenient in tests.
#[derive(Default, Clone)]
pub struct CollectingSink {
    pub parts: Vec<PartRequest>,
    pub floats: Vec<FloatRequest>,
    pub overflows: Vec<(usize, Mpt)>,
    pub non_restartable: Vec<usize>,
}

impl AreaSink for CollectingSink {
    fn add_part(&mut self, part: PartRequest) {
        self.parts.push(part);
    }

    fn add_float(&mut self, float: FloatRequest) {
        self.floats.push(float);
    }

    fn notify_overflow(&mut self, part_index: usize, amount: Mpt, _source: Option<SourcePosition>) {
        self.overflows.push((part_index, amount));
    }

    fn notify_non_restartable(&mut self, part_index: usize, _position: Option<SourcePosition>) {
        self.non_restartable.push(part_index);
    }
}

pub type OnPartCallback = Arc<dyn Fn(&PartRequest) + Send + Sync>;

/// Closure-backed sink for callers that do not want a trait impl.
#[derive(Clone)]
pub struct CallbackSink {
    on_part: OnPartCallback,
}

impl CallbackSink {
    pub fn new<F>(on_part: F) -> Self
    where
        F: Fn(&PartRequest) + Send + Sync + 'static,
    {
        Self {
            on_part: Arc::new(on_part),
        }
    }
}

impl AreaSink for CallbackSink {
    fn add_part(&mut self, part: PartRequest) {
        (self.on_part)(&part);
    }
}
