use crate::element::{Element, INFINITE_PENALTY};
use crate::types::Mpt;

/// An ordered run of elements representing one unit of breakable content: a
/// paragraph's line sequence or a flow's block sequence. Producers build it
/// by appending; the breaking algorithms treat it as read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementSequence {
    elements: Vec<Element>,
    ignore_at_start: usize,
    ignore_at_end: usize,
}

impl ElementSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            elements: Vec::with_capacity(capacity),
            ignore_at_start: 0,
            ignore_at_end: 0,
        }
    }

    pub fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    /// Merges another sequence onto the end of this one. The merged
    /// sequence keeps this sequence's leading ignore count and adopts the
    /// other's trailing one; the interior boundary counts dissolve.
    pub fn append(&mut self, other: ElementSequence) {
        self.elements.extend(other.elements);
        self.ignore_at_end = other.ignore_at_end;
    }

    /// Drops trailing glue and unforced penalties. Returns how many
    /// elements were removed.
    pub fn trim_trailing_glue(&mut self) -> usize {
        let mut removed = 0;
        while let Some(last) = self.elements.last() {
            let droppable = last.is_glue() || (last.is_penalty() && !last.is_forced_break());
            if !droppable {
                break;
            }
            self.elements.pop();
            removed += 1;
        }
        self.ignore_at_end = self.ignore_at_end.min(self.elements.len());
        removed
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Element> {
        self.elements.iter()
    }

    pub fn as_slice(&self) -> &[Element] {
        &self.elements
    }

    pub fn set_ignore_at_start(&mut self, count: usize) {
        self.ignore_at_start = count.min(self.elements.len());
    }

    pub fn set_ignore_at_end(&mut self, count: usize) {
        self.ignore_at_end = count.min(self.elements.len());
    }

    pub fn ignore_at_start(&self) -> usize {
        self.ignore_at_start
    }

    pub fn ignore_at_end(&self) -> usize {
        self.ignore_at_end
    }

    /// Index range of the elements that take part in breaking and length
    /// accounting, i.e. everything outside the ignored boundary runs.
    pub fn effective_range(&self) -> std::ops::Range<usize> {
        let start = self.ignore_at_start.min(self.elements.len());
        let end = self.elements.len() - self.ignore_at_end.min(self.elements.len() - start);
        start..end
    }

    /// Sums box and glue natural widths over the inclusive index range,
    /// ignoring penalties. Stretch and shrink are intentionally not
    /// consulted, so the result is an unadjusted size estimate.
    pub fn calc_content_length(&self, start: usize, end: usize) -> Mpt {
        let mut total = Mpt::ZERO;
        for element in self
            .elements
            .iter()
            .take(end.saturating_add(1).min(self.elements.len()))
            .skip(start)
        {
            if element.is_box() || element.is_glue() {
                total += element.width();
            }
        }
        total
    }

    /// Content length of the whole underlying element run.
    pub fn calc_content_length_all(&self) -> Mpt {
        if self.elements.is_empty() {
            return Mpt::ZERO;
        }
        self.calc_content_length(0, self.elements.len() - 1)
    }

    /// Content length of the non-ignored elements.
    pub fn effective_content_length(&self) -> Mpt {
        let range = self.effective_range();
        if range.is_empty() {
            return Mpt::ZERO;
        }
        self.calc_content_length(range.start, range.end - 1)
    }

    pub fn starts_with_forced_break(&self) -> bool {
        let range = self.effective_range();
        self.elements
            .get(range.start)
            .filter(|_| !range.is_empty())
            .is_some_and(Element::is_forced_break)
    }

    /// An empty sequence reports true: callers rely on this to avoid
    /// emitting a break ahead of content that does not exist.
    pub fn ends_with_forced_break(&self) -> bool {
        let range = self.effective_range();
        if range.is_empty() {
            return true;
        }
        self.elements[range.end - 1].is_forced_break()
    }

    /// Inhibits every legal break in the leading region of the sequence
    /// until the accumulated box and glue width reaches `constraint`.
    /// Penalties below INFINITE are raised to INFINITE in place; a glue that
    /// immediately follows a box is marked auxiliary, which removes it from
    /// the break-legality check without disturbing its width accounting.
    /// Returns true when the whole sequence was exhausted before the
    /// constraint was covered (not enough content to absorb the protected
    /// region). Idempotent; never changes the number of elements.
    pub fn remove_legal_breaks(&mut self, constraint: Mpt) -> bool {
        let mut accumulated = Mpt::ZERO;
        for index in 0..self.elements.len() {
            if accumulated >= constraint {
                return false;
            }
            let follows_box = index > 0 && self.elements[index - 1].is_box();
            match &mut self.elements[index] {
                Element::Penalty { value, .. } => {
                    if *value < INFINITE_PENALTY {
                        *value = INFINITE_PENALTY;
                    }
                }
                Element::Glue {
                    width, auxiliary, ..
                } => {
                    if follows_box {
                        *auxiliary = true;
                    }
                    accumulated += *width;
                }
                Element::Box { width, .. } => {
                    accumulated += *width;
                }
            }
        }
        accumulated < constraint
    }

    /// Mirror of [`remove_legal_breaks`] protecting the trailing region:
    /// walks from the end until the accumulated width reaches `constraint`.
    /// The box lookback is applied the same way in both directions.
    pub fn remove_legal_breaks_from_end(&mut self, constraint: Mpt) -> bool {
        let mut accumulated = Mpt::ZERO;
        for index in (0..self.elements.len()).rev() {
            if accumulated >= constraint {
                return false;
            }
            let follows_box = index > 0 && self.elements[index - 1].is_box();
            match &mut self.elements[index] {
                Element::Penalty { value, .. } => {
                    if *value < INFINITE_PENALTY {
                        *value = INFINITE_PENALTY;
                    }
                }
                Element::Glue {
                    width, auxiliary, ..
                } => {
                    if follows_box {
                        *auxiliary = true;
                    }
                    accumulated += *width;
                }
                Element::Box { width, .. } => {
                    accumulated += *width;
                }
            }
        }
        accumulated < constraint
    }
}

impl std::ops::Index<usize> for ElementSequence {
    type Output = Element;
    fn index(&self, index: usize) -> &Element {
        &self.elements[index]
    }
}

impl From<Vec<Element>> for ElementSequence {
    fn from(elements: Vec<Element>) -> Self {
        Self {
            elements,
            ignore_at_start: 0,
            ignore_at_end: 0,
        }
    }
}

impl<'a> IntoIterator for &'a ElementSequence {
    type Item = &'a Element;
    type IntoIter = std::slice::Iter<'a, Element>;
    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::BreakClass;

    fn mpt(v: i64) -> Mpt {
        Mpt::from_milli(v)
    }

    fn boxes_and_glue() -> ElementSequence {
        ElementSequence::from(vec![
            Element::new_box(mpt(100)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(200)),
            Element::penalty(0, false),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(50)),
        ])
    }

    #[test]
    fn content_length_over_full_range_matches_all() {
        let seq = boxes_and_glue();
        assert_eq!(
            seq.calc_content_length(0, seq.len() - 1),
            seq.calc_content_length_all()
        );
        assert_eq!(seq.calc_content_length_all(), mpt(370));
    }

    #[test]
    fn content_length_ignores_zero_width_auxiliary_penalties() {
        let mut seq = boxes_and_glue();
        let base = seq.calc_content_length_all();
        seq.push(Element::Penalty {
            width: Mpt::ZERO,
            value: 80,
            flagged: false,
            break_class: BreakClass::None,
            position: None,
            auxiliary: true,
        });
        assert_eq!(seq.calc_content_length_all(), base);
    }

    #[test]
    fn content_length_skips_penalty_widths() {
        let seq = ElementSequence::from(vec![
            Element::new_box(mpt(100)),
            Element::penalty_with_width(mpt(20), 50, true),
            Element::new_box(mpt(100)),
        ]);
        assert_eq!(seq.calc_content_length_all(), mpt(200));
    }

    #[test]
    fn remove_legal_breaks_inhibits_leading_region_in_place() {
        let mut seq = boxes_and_glue();
        let before = seq.len();
        let exhausted = seq.remove_legal_breaks(mpt(150));
        assert!(!exhausted);
        assert_eq!(seq.len(), before);
        // The glue after the first box falls inside the protected region.
        assert!(seq[1].is_auxiliary());
        // The penalty sits past 150mpt of accumulated width and is kept.
        assert_eq!(seq[3].penalty_value(), 0);
        assert!(!seq[4].is_auxiliary());
    }

    #[test]
    fn remove_legal_breaks_is_idempotent() {
        let mut seq = boxes_and_glue();
        seq.remove_legal_breaks(mpt(320));
        let once = seq.clone();
        seq.remove_legal_breaks(mpt(320));
        assert_eq!(seq, once);
    }

    #[test]
    fn remove_legal_breaks_reports_short_sequences() {
        let mut seq = boxes_and_glue();
        assert!(seq.remove_legal_breaks(mpt(10_000)));
        assert_eq!(seq[3].penalty_value(), INFINITE_PENALTY);
    }

    #[test]
    fn remove_legal_breaks_from_end_protects_trailing_region() {
        let mut seq = ElementSequence::from(vec![
            Element::new_box(mpt(100)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(200)),
            Element::glue(mpt(10), mpt(5), mpt(3)),
            Element::new_box(mpt(50)),
        ]);
        let exhausted = seq.remove_legal_breaks_from_end(mpt(100));
        assert!(!exhausted);
        // Trailing region covers the last box and the glue before it.
        assert!(seq[3].is_auxiliary());
        // The leading glue is untouched.
        assert!(!seq[1].is_auxiliary());
    }

    #[test]
    fn remove_legal_breaks_from_end_raises_trailing_penalties() {
        let mut seq = boxes_and_glue();
        let exhausted = seq.remove_legal_breaks_from_end(mpt(100));
        assert!(!exhausted);
        assert_eq!(seq[3].penalty_value(), INFINITE_PENALTY);
        // The glue after the penalty was never a legal break; it is left as is.
        assert!(!seq[4].is_auxiliary());
        assert!(!seq[1].is_auxiliary());
    }

    #[test]
    fn forced_break_boundary_predicates() {
        let mut seq = ElementSequence::new();
        assert!(seq.ends_with_forced_break());
        assert!(!seq.starts_with_forced_break());
        seq.push(Element::new_box(mpt(10)));
        assert!(!seq.ends_with_forced_break());
        seq.push(Element::forced_break(BreakClass::Page));
        assert!(seq.ends_with_forced_break());
        let forced_first = ElementSequence::from(vec![
            Element::forced_break(BreakClass::Page),
            Element::new_box(mpt(10)),
        ]);
        assert!(forced_first.starts_with_forced_break());
    }

    #[test]
    fn ignore_counts_shrink_the_effective_range() {
        let mut seq = boxes_and_glue();
        seq.set_ignore_at_start(1);
        seq.set_ignore_at_end(2);
        assert_eq!(seq.effective_range(), 1..4);
        assert_eq!(seq.effective_content_length(), mpt(210));
    }

    #[test]
    fn append_merges_and_adopts_trailing_ignores() {
        let mut a = boxes_and_glue();
        let mut b = ElementSequence::from(vec![
            Element::glue(mpt(10), Mpt::ZERO, Mpt::ZERO),
            Element::new_box(mpt(30)),
        ]);
        b.set_ignore_at_end(1);
        let total = a.len() + b.len();
        a.append(b);
        assert_eq!(a.len(), total);
        assert_eq!(a.ignore_at_end(), 1);
    }

    #[test]
    fn trim_trailing_glue_stops_at_content() {
        let mut seq = boxes_and_glue();
        seq.push(Element::penalty(100, false));
        seq.push(Element::glue(mpt(10), Mpt::ZERO, Mpt::ZERO));
        assert_eq!(seq.trim_trailing_glue(), 2);
        assert!(seq.as_slice().last().unwrap().is_box());
        let mut forced = ElementSequence::from(vec![
            Element::new_box(mpt(10)),
            Element::forced_break(BreakClass::Page),
        ]);
        assert_eq!(forced.trim_trailing_glue(), 0);
    }
}
