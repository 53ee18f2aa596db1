use crate::types::Mpt;

/// Penalty value at or above which a break is forbidden; a value at or below
/// the negation forces a break.
pub const INFINITE_PENALTY: i32 = 1000;

/// Opaque back-reference into the producing layout context. Minted by the
/// sequence producer, carried through unchanged, never interpreted here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourcePosition(pub u64);

/// Lexical scope a penalty's break targets. Only page-level callers look at
/// anything beyond `Line`; the parity classes request the following part to
/// start on an even or odd page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakClass {
    None,
    Line,
    Column,
    Page,
    EvenPage,
    OddPage,
    All,
}

/// The atomic unit of a breakable sequence.
///
/// A break is legal only (a) at a non-auxiliary `Glue` immediately preceded
/// by a `Box`, (b) at a `Penalty` whose value is below [`INFINITE_PENALTY`],
/// or (c) implicitly at the end of the sequence. Auxiliary glue still
/// contributes its width but is excluded from the legality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Box {
        width: Mpt,
        position: Option<SourcePosition>,
        auxiliary: bool,
    },
    Glue {
        width: Mpt,
        stretch: Mpt,
        shrink: Mpt,
        position: Option<SourcePosition>,
        auxiliary: bool,
    },
    Penalty {
        width: Mpt,
        value: i32,
        flagged: bool,
        break_class: BreakClass,
        position: Option<SourcePosition>,
        auxiliary: bool,
    },
}

impl Element {
    pub fn new_box(width: Mpt) -> Element {
        Element::Box {
            width,
            position: None,
            auxiliary: false,
        }
    }

    pub fn box_at(width: Mpt, position: SourcePosition) -> Element {
        Element::Box {
            width,
            position: Some(position),
            auxiliary: false,
        }
    }

    pub fn glue(width: Mpt, stretch: Mpt, shrink: Mpt) -> Element {
        Element::Glue {
            width,
            stretch,
            shrink,
            position: None,
            auxiliary: false,
        }
    }

    pub fn auxiliary_glue(width: Mpt, stretch: Mpt, shrink: Mpt) -> Element {
        Element::Glue {
            width,
            stretch,
            shrink,
            position: None,
            auxiliary: true,
        }
    }

    pub fn penalty(value: i32, flagged: bool) -> Element {
        Element::Penalty {
            width: Mpt::ZERO,
            value,
            flagged,
            break_class: BreakClass::None,
            position: None,
            auxiliary: false,
        }
    }

    pub fn penalty_with_width(width: Mpt, value: i32, flagged: bool) -> Element {
        Element::Penalty {
            width,
            value,
            flagged,
            break_class: BreakClass::None,
            position: None,
            auxiliary: false,
        }
    }

    pub fn penalty_with_class(value: i32, break_class: BreakClass) -> Element {
        Element::Penalty {
            width: Mpt::ZERO,
            value,
            flagged: false,
            break_class,
            position: None,
            auxiliary: false,
        }
    }

    pub fn forced_break(break_class: BreakClass) -> Element {
        Element::penalty_with_class(-INFINITE_PENALTY, break_class)
    }

    /// An infinite penalty, i.e. a point where breaking is forbidden.
    pub fn inhibited_break() -> Element {
        Element::penalty(INFINITE_PENALTY, false)
    }

    pub fn with_position(mut self, source: SourcePosition) -> Element {
        match &mut self {
            Element::Box { position, .. }
            | Element::Glue { position, .. }
            | Element::Penalty { position, .. } => *position = Some(source),
        }
        self
    }

    pub fn is_box(&self) -> bool {
        matches!(self, Element::Box { .. })
    }

    pub fn is_glue(&self) -> bool {
        matches!(self, Element::Glue { .. })
    }

    pub fn is_penalty(&self) -> bool {
        matches!(self, Element::Penalty { .. })
    }

    pub fn is_forced_break(&self) -> bool {
        matches!(self, Element::Penalty { value, .. } if *value <= -INFINITE_PENALTY)
    }

    pub fn is_auxiliary(&self) -> bool {
        match self {
            Element::Box { auxiliary, .. }
            | Element::Glue { auxiliary, .. }
            | Element::Penalty { auxiliary, .. } => *auxiliary,
        }
    }

    pub fn width(&self) -> Mpt {
        match self {
            Element::Box { width, .. }
            | Element::Glue { width, .. }
            | Element::Penalty { width, .. } => *width,
        }
    }

    pub fn stretch(&self) -> Mpt {
        match self {
            Element::Glue { stretch, .. } => *stretch,
            _ => Mpt::ZERO,
        }
    }

    pub fn shrink(&self) -> Mpt {
        match self {
            Element::Glue { shrink, .. } => *shrink,
            _ => Mpt::ZERO,
        }
    }

    pub fn penalty_value(&self) -> i32 {
        match self {
            Element::Penalty { value, .. } => *value,
            _ => 0,
        }
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self, Element::Penalty { flagged: true, .. })
    }

    pub fn break_class(&self) -> BreakClass {
        match self {
            Element::Penalty { break_class, .. } => *break_class,
            _ => BreakClass::None,
        }
    }

    pub fn position(&self) -> Option<SourcePosition> {
        match self {
            Element::Box { position, .. }
            | Element::Glue { position, .. }
            | Element::Penalty { position, .. } => *position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpt(v: i64) -> Mpt {
        Mpt::from_milli(v)
    }

    #[test]
    fn classification_predicates() {
        let b = Element::new_box(mpt(100));
        let g = Element::glue(mpt(10), mpt(5), mpt(3));
        let p = Element::penalty(50, true);
        assert!(b.is_box() && !b.is_glue() && !b.is_penalty());
        assert!(g.is_glue() && !g.is_box());
        assert!(p.is_penalty() && p.is_flagged());
        assert!(!p.is_forced_break());
        assert!(Element::forced_break(BreakClass::Page).is_forced_break());
        assert!(!Element::inhibited_break().is_forced_break());
    }

    #[test]
    fn elasticity_accessors_are_zero_for_non_glue() {
        let b = Element::new_box(mpt(100));
        assert_eq!(b.stretch(), Mpt::ZERO);
        assert_eq!(b.shrink(), Mpt::ZERO);
        let g = Element::glue(mpt(10), mpt(5), mpt(3));
        assert_eq!(g.stretch(), mpt(5));
        assert_eq!(g.shrink(), mpt(3));
    }

    #[test]
    fn position_is_carried_untouched() {
        let e = Element::glue(mpt(1), Mpt::ZERO, Mpt::ZERO).with_position(SourcePosition(42));
        assert_eq!(e.position(), Some(SourcePosition(42)));
        assert_eq!(Element::new_box(mpt(1)).position(), None);
    }

    #[test]
    fn forced_break_threshold_is_the_negated_sentinel() {
        assert!(Element::penalty(-INFINITE_PENALTY, false).is_forced_break());
        assert!(!Element::penalty(-INFINITE_PENALTY + 1, false).is_forced_break());
    }
}
