use crate::assets::AssetFetcher;
use crate::content::{ContentTree, ReportSection};
use crate::debug::DebugLogger;
use crate::error::ExportError;
use crate::plan::{LogicalPage, PageSlice};
use crate::snapshot::{AssetFailure, ContentTreeSnapshot};
use crate::types::{Mm, PageGeometry, Rect};
use std::sync::Arc;
use tiny_skia::Pixmap;

pub const DEFAULT_SCALE: f32 = 2.0;
pub const MAX_SCALE: f32 = 4.0;

/// One rasterized logical page plus where it goes on the physical page.
#[derive(Clone)]
pub struct Bitmap {
    pub page_index: usize,
    pixmap: Pixmap,
    // Millimetres from the top-left corner of the physical page.
    pub placement: Rect,
    pub shrink_factor: f32,
}

impl Bitmap {
    pub fn width(&self) -> u32 {
        self.pixmap.width()
    }

    pub fn height(&self) -> u32 {
        self.pixmap.height()
    }

    /// Packed RGB rows. Pages are painted on an opaque white background so
    /// alpha carries no information.
    pub fn rgb_bytes(&self) -> Vec<u8> {
        let data = self.pixmap.data();
        let mut rgb = Vec::with_capacity(data.len() / 4 * 3);
        for px in data.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }
        rgb
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let px = self.pixmap.pixel(x, y)?.demultiply();
        Some([px.red(), px.green(), px.blue(), px.alpha()])
    }
}

pub(crate) fn validate_scale(scale: f32) -> Result<(), ExportError> {
    if !scale.is_finite() || scale <= 0.0 || scale > MAX_SCALE {
        return Err(ExportError::InvalidConfiguration(format!(
            "raster scale must be in (0, {MAX_SCALE}], got {scale}"
        )));
    }
    Ok(())
}

/// Renders logical pages into page bitmaps, one at a time, through a single
/// offscreen surface per page. Each slice asks the snapshot for just its
/// band, so memory stays bounded by one page however long a section is.
pub struct Rasterizer<'a> {
    geometry: PageGeometry,
    tree: &'a ContentTree,
    snapshot: &'a dyn ContentTreeSnapshot,
    assets: &'a dyn AssetFetcher,
    asset_failures: Vec<AssetFailure>,
    debug: Option<Arc<DebugLogger>>,
}

impl<'a> Rasterizer<'a> {
    pub fn new(
        geometry: PageGeometry,
        tree: &'a ContentTree,
        snapshot: &'a dyn ContentTreeSnapshot,
        assets: &'a dyn AssetFetcher,
    ) -> Self {
        Self {
            geometry,
            tree,
            snapshot,
            assets,
            asset_failures: Vec::new(),
            debug: None,
        }
    }

    pub(crate) fn with_debug(mut self, debug: Option<Arc<DebugLogger>>) -> Self {
        self.debug = debug;
        self
    }

    pub fn asset_failures(&self) -> &[AssetFailure] {
        &self.asset_failures
    }

    pub fn take_asset_failures(&mut self) -> Vec<AssetFailure> {
        std::mem::take(&mut self.asset_failures)
    }

    pub fn rasterize(&mut self, page: &LogicalPage, scale: f32) -> Result<Bitmap, ExportError> {
        validate_scale(scale)?;

        // Resolve every reference before any pixels are produced.
        let tree = self.tree;
        let mut sections: Vec<&'a ReportSection> = Vec::with_capacity(page.slices.len());
        for slice in &page.slices {
            let section = tree.section(&slice.section_id).ok_or_else(|| {
                ExportError::Structural(format!(
                    "page {} references unknown section '{}'",
                    page.index + 1,
                    slice.section_id
                ))
            })?;
            sections.push(section);
        }

        let usable_width = self.geometry.usable_width();
        let usable_height = self.geometry.usable_height();
        let width_px = usable_width.to_device_px(scale).max(1);
        let slice_heights: Vec<u32> = page
            .slices
            .iter()
            .map(|slice| slice.height.to_device_px(scale))
            .collect();
        let height_px: u32 = slice_heights.iter().sum::<u32>().max(1);

        let mut canvas = Pixmap::new(width_px, height_px).ok_or_else(|| {
            ExportError::Render(format!(
                "cannot allocate {}x{} surface for page {}",
                width_px,
                height_px,
                page.index + 1
            ))
        })?;
        canvas.fill(tiny_skia::Color::WHITE);

        let mut dst_y = 0u32;
        for ((slice, section), slice_h) in page.slices.iter().zip(sections).zip(slice_heights) {
            if slice_h == 0 {
                continue;
            }
            let band = self.render_band(section, slice, usable_width, scale, page.index)?;
            copy_rows(&band, &mut canvas, dst_y, slice_h);
            dst_y += slice_h;
        }

        // Width already matches the usable box; shrink only when too tall.
        let content_height = Mm::from_px(height_px as f32 / scale);
        let (placement, shrink_factor) = if content_height > usable_height {
            let shrink = usable_height.to_um() as f32 / content_height.to_um() as f32;
            let width = Mm::from_f32(usable_width.to_f32() * shrink);
            let x = self.geometry.margins.left + (usable_width - width) / 2;
            (
                Rect {
                    x,
                    y: self.geometry.margins.top,
                    width,
                    height: usable_height,
                },
                shrink,
            )
        } else {
            (
                Rect {
                    x: self.geometry.margins.left,
                    y: self.geometry.margins.top,
                    width: usable_width,
                    height: content_height,
                },
                1.0,
            )
        };

        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "export.page_raster",
                serde_json::json!({
                    "page": page.index + 1,
                    "slices": page.slices.len(),
                    "width_px": width_px,
                    "height_px": height_px,
                    "shrink": shrink_factor,
                }),
            );
            logger.increment("export.page_raster", 1);
        }

        Ok(Bitmap {
            page_index: page.index,
            pixmap: canvas,
            placement,
            shrink_factor,
        })
    }

    fn render_band(
        &mut self,
        section: &ReportSection,
        slice: &PageSlice,
        width: Mm,
        scale: f32,
        page_index: usize,
    ) -> Result<Pixmap, ExportError> {
        let rendered = self
            .snapshot
            .render(section, width, slice.offset, slice.height, scale, self.assets)
            .map_err(|err| match err {
                ExportError::Structural(_) | ExportError::Render(_) => err,
                other => ExportError::Render(format!(
                    "page {} section '{}': {}",
                    page_index + 1,
                    section.id,
                    other
                )),
            })?;
        for failure in rendered.asset_failures {
            // An asset straddling a page break shows up in both bands.
            if self.asset_failures.contains(&failure) {
                continue;
            }
            log::warn!(
                "[fieldexport][assets] section {}: hid {} ({})",
                failure.section_id,
                failure.source,
                failure.reason
            );
            if let Some(logger) = self.debug.as_deref() {
                logger.log_event(
                    "export.asset_failure",
                    serde_json::json!({
                        "page": page_index + 1,
                        "section": failure.section_id.as_str(),
                        "source": failure.source,
                        "reason": failure.reason,
                    }),
                );
                logger.increment("export.asset_failure", 1);
            }
            self.asset_failures.push(failure);
        }
        Ok(rendered.pixmap)
    }
}

// Rows or columns the band does not cover stay white; nothing is cropped
// from the slice the planner assigned.
fn copy_rows(src: &Pixmap, dst: &mut Pixmap, dst_y: u32, rows: u32) {
    let src_stride = src.width() as usize * 4;
    let dst_stride = dst.width() as usize * 4;
    let copy_width = src_stride.min(dst_stride);
    let src_data = src.data();
    let rows = rows.min(src.height());
    let dst_height = dst.height();
    let dst_data = dst.data_mut();
    for row in 0..rows {
        let dy = dst_y + row;
        if dy >= dst_height {
            break;
        }
        let s = row as usize * src_stride;
        let d = dy as usize * dst_stride;
        dst_data[d..d + copy_width].copy_from_slice(&src_data[s..s + copy_width]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SectionId;
    use crate::assets::NoFetch;
    use crate::content::{BreakPolicy, ContentNode};
    use crate::layout::LayoutSnapshot;
    use crate::plan::{PageSlice, Planner};
    use crate::snapshot::{RenderedSection, StyleSource};
    use crate::testing::FixedSnapshot;
    use std::cell::RefCell;

    // Wraps the layout engine and records every surface it hands out.
    struct SurfaceLog {
        inner: LayoutSnapshot,
        surfaces: RefCell<Vec<(u32, u32)>>,
    }

    impl ContentTreeSnapshot for SurfaceLog {
        fn measure(&self, section: &ReportSection, width: Mm) -> Result<Mm, ExportError> {
            self.inner.measure(section, width)
        }

        fn render(
            &self,
            section: &ReportSection,
            width: Mm,
            offset: Mm,
            height: Mm,
            scale: f32,
            assets: &dyn AssetFetcher,
        ) -> Result<RenderedSection, ExportError> {
            let rendered = self.inner.render(section, width, offset, height, scale, assets)?;
            self.surfaces
                .borrow_mut()
                .push((rendered.pixmap.width(), rendered.pixmap.height()));
            Ok(rendered)
        }

        fn markup(&self, section: &ReportSection) -> String {
            self.inner.markup(section)
        }

        fn stylesheets(&self) -> Vec<StyleSource> {
            self.inner.stylesheets()
        }
    }

    fn tree(sections: Vec<ReportSection>) -> ContentTree {
        ContentTree::with_sections("Verification", sections)
    }

    #[test]
    fn scale_outside_range_is_rejected() {
        assert!(validate_scale(0.0).is_err());
        assert!(validate_scale(f32::NAN).is_err());
        assert!(validate_scale(4.5).is_err());
        assert!(validate_scale(2.0).is_ok());
    }

    #[test]
    fn unknown_section_reference_is_structural() {
        let tree = tree(vec![ReportSection::new("a", 1, BreakPolicy::Flow)]);
        let snapshot = FixedSnapshot::uniform(Mm::new(10));
        let mut rasterizer = Rasterizer::new(PageGeometry::a4(), &tree, &snapshot, &NoFetch);
        let page = LogicalPage {
            index: 0,
            slices: vec![PageSlice {
                section_id: SectionId::new("ghost"),
                offset: Mm::ZERO,
                height: Mm::new(10),
                overflow: false,
            }],
        };
        let err = rasterizer.rasterize(&page, 2.0).err().expect("missing id");
        assert!(matches!(err, ExportError::Structural(_)));
    }

    #[test]
    fn fitting_page_is_width_fit_and_not_shrunk() {
        let tree = tree(vec![ReportSection::new("a", 1, BreakPolicy::Flow)]);
        let snapshot = FixedSnapshot::uniform(Mm::new(100));
        let pages = Planner::for_geometry(&PageGeometry::a4())
            .plan(&tree, &snapshot)
            .unwrap();
        let mut rasterizer = Rasterizer::new(PageGeometry::a4(), &tree, &snapshot, &NoFetch);
        let bitmap = rasterizer.rasterize(&pages[0], 2.0).unwrap();
        assert_eq!(bitmap.shrink_factor, 1.0);
        assert_eq!(bitmap.placement.x, Mm::new(10));
        assert_eq!(bitmap.placement.width, Mm::new(190));
        assert!((bitmap.placement.height.to_f32() - 100.0).abs() < 0.2);
        // 190mm at 96dpi * 2.
        assert_eq!(bitmap.width(), 1436);
    }

    #[test]
    fn overflowing_page_is_shrunk_and_centered_never_cropped() {
        let tree = tree(vec![ReportSection::new("huge", 1, BreakPolicy::AvoidBreak)]);
        let snapshot = FixedSnapshot::uniform(Mm::new(554));
        let geometry = PageGeometry::a4();
        let pages = Planner::for_geometry(&geometry).plan(&tree, &snapshot).unwrap();
        assert_eq!(pages.len(), 1);
        let mut rasterizer = Rasterizer::new(geometry, &tree, &snapshot, &NoFetch);
        let bitmap = rasterizer.rasterize(&pages[0], 1.0).unwrap();

        assert!((bitmap.shrink_factor - 0.5).abs() < 0.01);
        assert_eq!(bitmap.placement.height, Mm::new(277));
        assert!((bitmap.placement.width.to_f32() - 95.0).abs() < 0.5);
        let left = bitmap.placement.x - geometry.margins.left;
        let right = geometry.size.width
            - geometry.margins.right
            - (bitmap.placement.x + bitmap.placement.width);
        assert!((left.to_f32() - right.to_f32()).abs() < 0.01);
        // Full content height survives in pixels.
        assert_eq!(bitmap.height(), (Mm::new(554).to_px()).round() as u32);
        let last = bitmap.pixel(10, bitmap.height() - 1).unwrap();
        assert_eq!(last[0], 128);
    }

    #[test]
    fn long_flow_section_surfaces_stay_within_one_page() {
        let section = ReportSection::new("long", 1, BreakPolicy::Flow)
            .with_node(ContentNode::body("Sprinkler heads inspected. ".repeat(4000)));
        let tree = tree(vec![section]);
        let snapshot = SurfaceLog {
            inner: LayoutSnapshot::new(None),
            surfaces: RefCell::new(Vec::new()),
        };
        let geometry = PageGeometry::a4();
        let pages = Planner::for_geometry(&geometry).plan(&tree, &snapshot).unwrap();
        assert!(pages.len() >= 5);
        assert!(pages[1].slices[0].offset.is_positive());

        let mut rasterizer = Rasterizer::new(geometry, &tree, &snapshot, &NoFetch);
        let page_px = geometry.usable_height().to_device_px(2.0);
        let width_px = geometry.usable_width().to_device_px(2.0);
        for page in &pages {
            let bitmap = rasterizer.rasterize(page, 2.0).unwrap();
            assert_eq!(bitmap.shrink_factor, 1.0);
            assert_eq!(bitmap.width(), width_px);
            assert!(bitmap.height() <= page_px);
        }
        let surfaces = snapshot.surfaces.borrow();
        assert_eq!(surfaces.len(), pages.len());
        for &(w, h) in surfaces.iter() {
            assert_eq!(w, width_px);
            assert!(h <= page_px, "band of {h}px exceeds one page ({page_px}px)");
        }
    }

    #[test]
    fn straddling_broken_image_is_reported_once() {
        let section = ReportSection::new("photos", 1, BreakPolicy::Flow)
            .with_node(ContentNode::body("Pump curve recorded. ".repeat(520)))
            .with_node(ContentNode::Image {
                source: "https://other-origin.example/curve.png".to_string(),
                alt: "Curve".to_string(),
                aspect: Some(3.0),
                max_height: None,
            });
        let tree = tree(vec![section]);
        let snapshot = LayoutSnapshot::new(None);
        let geometry = PageGeometry::a4();
        let pages = Planner::for_geometry(&geometry).plan(&tree, &snapshot).unwrap();
        assert!(pages.len() >= 2);
        let mut rasterizer = Rasterizer::new(geometry, &tree, &snapshot, &NoFetch);
        for page in &pages {
            rasterizer.rasterize(page, 1.0).unwrap();
        }
        assert_eq!(rasterizer.take_asset_failures().len(), 1);
    }

    #[test]
    fn broken_image_is_recorded_not_fatal() {
        let section = ReportSection::new("photos", 1, BreakPolicy::AvoidBreak)
            .with_node(ContentNode::image("s3://bucket/panel.jpg", "Panel"))
            .with_node(ContentNode::caption("Main control panel"));
        let tree = tree(vec![section]);
        let snapshot = LayoutSnapshot::new(None);
        let pages = Planner::for_geometry(&PageGeometry::a4())
            .plan(&tree, &snapshot)
            .unwrap();
        let mut rasterizer = Rasterizer::new(PageGeometry::a4(), &tree, &snapshot, &NoFetch);
        rasterizer.rasterize(&pages[0], 2.0).expect("page still renders");
        let failures = rasterizer.take_asset_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].section_id, SectionId::new("photos"));
        assert!(rasterizer.asset_failures().is_empty());
    }
}
