use crate::assets::AssetFetcher;
use crate::content::ReportSection;
use crate::error::ExportError;
use crate::snapshot::{ContentTreeSnapshot, RenderedSection, StyleSource};
use crate::types::Mm;
use std::cell::Cell;
use std::collections::HashMap;
use tiny_skia::Pixmap;

/// Snapshot with predetermined section heights; renders solid grey blocks.
pub(crate) struct FixedSnapshot {
    default_height: Mm,
    heights: HashMap<String, Mm>,
    measure_calls: Cell<usize>,
}

impl FixedSnapshot {
    pub fn uniform(height: Mm) -> Self {
        Self {
            default_height: height,
            heights: HashMap::new(),
            measure_calls: Cell::new(0),
        }
    }

    pub fn with_height(mut self, id: &str, height: Mm) -> Self {
        self.heights.insert(id.to_string(), height);
        self
    }

    pub fn measure_calls(&self) -> usize {
        self.measure_calls.get()
    }

    fn height_of(&self, section: &ReportSection) -> Mm {
        self.heights
            .get(section.id.as_str())
            .copied()
            .unwrap_or(self.default_height)
    }
}

impl ContentTreeSnapshot for FixedSnapshot {
    fn measure(&self, section: &ReportSection, _width: Mm) -> Result<Mm, ExportError> {
        self.measure_calls.set(self.measure_calls.get() + 1);
        Ok(self.height_of(section))
    }

    fn render(
        &self,
        _section: &ReportSection,
        width: Mm,
        _offset: Mm,
        height: Mm,
        scale: f32,
        _assets: &dyn AssetFetcher,
    ) -> Result<RenderedSection, ExportError> {
        let w = width.to_device_px(scale).max(1);
        let h = height.to_device_px(scale).max(1);
        let mut pixmap = Pixmap::new(w, h)
            .ok_or_else(|| ExportError::Render(format!("cannot allocate {w}x{h}")))?;
        pixmap.fill(tiny_skia::Color::from_rgba8(128, 128, 128, 255));
        Ok(RenderedSection {
            pixmap,
            asset_failures: Vec::new(),
        })
    }

    fn markup(&self, section: &ReportSection) -> String {
        format!("<div id=\"{}\"></div>", section.id)
    }

    fn stylesheets(&self) -> Vec<StyleSource> {
        Vec::new()
    }
}

pub(crate) fn png_bytes(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let mut img = image::RgbaImage::new(width, height);
    for pixel in img.pixels_mut() {
        *pixel = image::Rgba(rgba);
    }
    let mut bytes = Vec::new();
    img.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )
    .expect("encode png");
    bytes
}
