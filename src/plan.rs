use crate::content::{BreakPolicy, ContentTree, SectionId};
use crate::debug::DebugLogger;
use crate::error::ExportError;
use crate::frame::{AddResult, Frame, PendingSection};
use crate::snapshot::ContentTreeSnapshot;
use crate::types::{Mm, PageGeometry};
use std::sync::Arc;

/// The part of one section that lands on a page. A `Flow` section that
/// crosses a page boundary yields one slice per page; atomic sections always
/// yield a single slice at offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSlice {
    pub section_id: SectionId,
    pub offset: Mm,
    pub height: Mm,
    pub overflow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPage {
    pub index: usize,
    pub slices: Vec<PageSlice>,
}

impl LogicalPage {
    pub fn section_ids(&self) -> Vec<&SectionId> {
        let mut ids: Vec<&SectionId> = Vec::with_capacity(self.slices.len());
        for slice in &self.slices {
            if ids.last() != Some(&&slice.section_id) {
                ids.push(&slice.section_id);
            }
        }
        ids
    }

    pub fn contains(&self, id: &SectionId) -> bool {
        self.slices.iter().any(|slice| &slice.section_id == id)
    }

    pub fn content_height(&self) -> Mm {
        self.slices.iter().map(|slice| slice.height).sum()
    }

    pub fn overflows(&self) -> bool {
        self.slices.iter().any(|slice| slice.overflow)
    }
}

#[derive(Clone)]
pub struct Planner {
    page_capacity: Mm,
    content_width: Mm,
    debug: Option<Arc<DebugLogger>>,
}

impl Planner {
    pub fn new(page_capacity: Mm, content_width: Mm) -> Self {
        Self {
            page_capacity,
            content_width,
            debug: None,
        }
    }

    pub fn for_geometry(geometry: &PageGeometry) -> Self {
        Self::new(geometry.usable_height(), geometry.usable_width())
    }

    pub(crate) fn with_debug(mut self, debug: Option<Arc<DebugLogger>>) -> Self {
        self.debug = debug;
        self
    }

    pub fn page_capacity(&self) -> Mm {
        self.page_capacity
    }

    /// Validates the tree, measures every section through the snapshot and
    /// partitions the sections into pages.
    pub fn plan(
        &self,
        tree: &ContentTree,
        snapshot: &dyn ContentTreeSnapshot,
    ) -> Result<Vec<LogicalPage>, ExportError> {
        self.check_capacity()?;
        tree.validate()?;
        let mut heights = Vec::with_capacity(tree.len());
        for section in tree.sections() {
            let height = snapshot.measure(section, self.content_width)?;
            heights.push(height.max(Mm::ZERO));
        }
        self.plan_measured(tree, &heights)
    }

    /// Same as `plan` for callers that already know each section's height,
    /// given in tree order.
    pub fn plan_measured(
        &self,
        tree: &ContentTree,
        heights: &[Mm],
    ) -> Result<Vec<LogicalPage>, ExportError> {
        self.check_capacity()?;
        tree.validate()?;
        if heights.len() != tree.len() {
            return Err(ExportError::Structural(format!(
                "{} heights supplied for {} sections",
                heights.len(),
                tree.len()
            )));
        }

        let mut pages: Vec<LogicalPage> = Vec::new();
        let mut frame = Frame::new(self.page_capacity);

        for (section, height) in tree.sections().iter().zip(heights.iter().copied()) {
            if section.break_policy == BreakPolicy::ForcePageBreak && !frame.is_empty() {
                self.log_page_break(pages.len() + 1, "force_page_break", &section.id);
                close_page(&mut pages, &mut frame, self.page_capacity);
            }

            let mut pending = PendingSection {
                id: section.id.clone(),
                policy: section.break_policy,
                offset: Mm::ZERO,
                remaining: height.max(Mm::ZERO),
            };
            loop {
                match frame.add(pending) {
                    AddResult::Placed => break,
                    AddResult::Split(rest) => {
                        self.log_page_break(pages.len() + 1, "flow_continuation", &rest.id);
                        close_page(&mut pages, &mut frame, self.page_capacity);
                        pending = rest;
                    }
                    AddResult::Overflow(rest) => {
                        let reason = if rest.policy.is_atomic() {
                            "avoid_break"
                        } else {
                            "page_full"
                        };
                        self.log_page_break(pages.len() + 1, reason, &rest.id);
                        close_page(&mut pages, &mut frame, self.page_capacity);
                        pending = rest;
                    }
                }
            }
        }
        if !frame.is_empty() {
            close_page(&mut pages, &mut frame, self.page_capacity);
        }

        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "export.plan",
                serde_json::json!({
                    "sections": tree.len(),
                    "pages": pages.len(),
                    "capacity_um": self.page_capacity.to_um(),
                    "overflow_pages": pages.iter().filter(|p| p.overflows()).count(),
                }),
            );
        }
        Ok(pages)
    }

    fn check_capacity(&self) -> Result<(), ExportError> {
        if !self.page_capacity.is_positive() {
            return Err(ExportError::InvalidConfiguration(
                "page capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn log_page_break(&self, from_page: usize, reason: &str, section: &SectionId) {
        let Some(logger) = self.debug.as_deref() else {
            return;
        };
        logger.log_event(
            "export.page_break",
            serde_json::json!({
                "reason": reason,
                "from_page": from_page,
                "to_page": from_page + 1,
                "section": section.as_str(),
            }),
        );
        logger.increment("export.page_break", 1);
    }
}

fn close_page(pages: &mut Vec<LogicalPage>, frame: &mut Frame, capacity: Mm) {
    let full = std::mem::replace(frame, Frame::new(capacity));
    pages.push(LogicalPage {
        index: pages.len(),
        slices: full.into_slices(),
    });
}

/// Convenience wrapper: plan `tree` for a page of `page_capacity` using
/// heights measured at `content_width`.
pub fn plan(
    tree: &ContentTree,
    page_capacity: Mm,
    content_width: Mm,
    snapshot: &dyn ContentTreeSnapshot,
) -> Result<Vec<LogicalPage>, ExportError> {
    Planner::new(page_capacity, content_width).plan(tree, snapshot)
}
