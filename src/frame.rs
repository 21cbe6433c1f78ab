use crate::content::{BreakPolicy, SectionId};
use crate::plan::PageSlice;
use crate::types::Mm;

/// Part of a section that still has to be placed. `offset` is how much of
/// the section earlier pages already hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingSection {
    pub id: SectionId,
    pub policy: BreakPolicy,
    pub offset: Mm,
    pub remaining: Mm,
}

pub(crate) enum AddResult {
    Placed,
    Split(PendingSection),
    Overflow(PendingSection),
}

/// Height accounting for one logical page.
pub(crate) struct Frame {
    capacity: Mm,
    cursor_y: Mm,
    slices: Vec<PageSlice>,
}

impl Frame {
    pub fn new(capacity: Mm) -> Self {
        Self {
            capacity,
            cursor_y: Mm::ZERO,
            slices: Vec::new(),
        }
    }

    pub fn remaining_height(&self) -> Mm {
        (self.capacity - self.cursor_y).max(Mm::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn into_slices(self) -> Vec<PageSlice> {
        self.slices
    }

    pub fn add(&mut self, pending: PendingSection) -> AddResult {
        let avail = self.remaining_height();

        if pending.remaining <= avail {
            self.place(&pending, pending.remaining, false);
            return AddResult::Placed;
        }

        if pending.policy.is_atomic() {
            if !self.is_empty() {
                return AddResult::Overflow(pending);
            }
            // Taller than a whole page: it gets the page to itself and the
            // rasterizer shrinks it to fit.
            self.place(&pending, pending.remaining, true);
            self.cursor_y = self.capacity;
            return AddResult::Placed;
        }

        if avail <= Mm::ZERO {
            return AddResult::Overflow(pending);
        }

        self.place(&pending, avail, false);
        AddResult::Split(PendingSection {
            id: pending.id,
            policy: pending.policy,
            offset: pending.offset + avail,
            remaining: pending.remaining - avail,
        })
    }

    fn place(&mut self, pending: &PendingSection, height: Mm, overflow: bool) {
        self.slices.push(PageSlice {
            section_id: pending.id.clone(),
            offset: pending.offset,
            height,
            overflow,
        });
        self.cursor_y += height;
    }
}
