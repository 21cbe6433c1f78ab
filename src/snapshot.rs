use crate::assets::AssetFetcher;
use crate::content::{ReportSection, SectionId};
use crate::error::ExportError;
use crate::types::Mm;
use tiny_skia::Pixmap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub section_id: SectionId,
    pub source: String,
    pub reason: String,
}

/// Pixels for one horizontal band of a section.
pub struct RenderedSection {
    pub pixmap: Pixmap,
    pub asset_failures: Vec<AssetFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StyleSource {
    Inline(String),
    Linked(String),
}

/// What the export pipeline needs from whatever lays content out (a headless
/// browser, a server-side layout engine, the built-in `LayoutSnapshot`).
/// The planner only measures; the rasterizer renders; the HTML serializer
/// reads the markup and captured styles.
pub trait ContentTreeSnapshot {
    /// Rendered height of the whole section at `width`, treated as one unit.
    fn measure(&self, section: &ReportSection, width: Mm) -> Result<Mm, ExportError>;

    /// Paints the band `[offset, offset + height)` of the section into a
    /// pixmap of `width.to_device_px(scale)` by `height.to_device_px(scale)`.
    /// Only the band is ever allocated. Unreachable assets that intersect the
    /// band are left out and reported in `asset_failures`.
    fn render(
        &self,
        section: &ReportSection,
        width: Mm,
        offset: Mm,
        height: Mm,
        scale: f32,
        assets: &dyn AssetFetcher,
    ) -> Result<RenderedSection, ExportError>;

    /// The section's rendered representation as an HTML fragment.
    fn markup(&self, section: &ReportSection) -> String;

    /// Presentation rules captured with the snapshot, in cascade order.
    fn stylesheets(&self) -> Vec<StyleSource>;
}
