use crate::error::ExportError;
use crate::types::Color;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tiny_skia::{FillRule, Paint, PathBuilder, Pixmap, Transform};
use ttf_parser::{GlyphId, OutlineBuilder};

const SYSTEM_FONT_CANDIDATES: [&str; 8] = [
    "DejaVuSans.ttf",
    "LiberationSans-Regular.ttf",
    "NotoSans-Regular.ttf",
    "Arial.ttf",
    "arial.ttf",
    "Helvetica.ttc",
    "Roboto-Regular.ttf",
    "OpenSans-Regular.ttf",
];

// Average advance as a fraction of the font size when no face is available.
const FALLBACK_ADVANCE_EM: f32 = 0.52;

static SYSTEM_FONT: OnceLock<Option<Arc<Vec<u8>>>> = OnceLock::new();

/// A parsed-on-demand font program used for measuring and painting text.
#[derive(Debug, Clone)]
pub struct FontFace {
    data: Arc<Vec<u8>>,
    units_per_em: f32,
    ascender: f32,
}

impl FontFace {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ExportError> {
        Self::from_shared(Arc::new(data))
    }

    fn from_shared(data: Arc<Vec<u8>>) -> Result<Self, ExportError> {
        let face = ttf_parser::Face::parse(&data, 0).map_err(|err| {
            ExportError::InvalidConfiguration(format!("unreadable font program: {err}"))
        })?;
        let units_per_em = face.units_per_em().max(1) as f32;
        let ascender = face.ascender() as f32;
        Ok(Self {
            data,
            units_per_em,
            ascender,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let data = std::fs::read(path.as_ref())?;
        Self::from_bytes(data)
    }

    /// First parseable sans-serif face found in the usual system font
    /// directories. Looked up once per process.
    pub fn system_default() -> Option<Self> {
        let bytes = SYSTEM_FONT.get_or_init(load_system_font).clone()?;
        Self::from_shared(bytes).ok()
    }

    pub fn ascent_ratio(&self) -> f32 {
        self.ascender / self.units_per_em
    }

    pub fn text_width(&self, text: &str, font_size: f32) -> f32 {
        let Ok(face) = ttf_parser::Face::parse(&self.data, 0) else {
            return fallback_text_width(text, font_size);
        };
        let scale = font_size / self.units_per_em;
        text.chars()
            .map(|ch| {
                face.glyph_index(ch)
                    .and_then(|gid| face.glyph_hor_advance(gid))
                    .map(|adv| adv as f32 * scale)
                    .unwrap_or(font_size * FALLBACK_ADVANCE_EM)
            })
            .sum()
    }

    /// Paints `text` with its baseline at (`x`, `baseline_y`) in device
    /// pixels. Returns the number of glyphs that produced an outline.
    pub fn draw_text(
        &self,
        pixmap: &mut Pixmap,
        text: &str,
        x: f32,
        baseline_y: f32,
        font_size: f32,
        color: Color,
    ) -> usize {
        let Ok(face) = ttf_parser::Face::parse(&self.data, 0) else {
            return 0;
        };
        let scale = font_size / self.units_per_em;
        let paint = solid_paint(color);
        let mut pen_x = x;
        let mut drawn = 0usize;
        for ch in text.chars() {
            let gid = face.glyph_index(ch).unwrap_or(GlyphId(0));
            if gid.0 != 0 {
                let mut builder = GlyphPathBuilder::new(pen_x, baseline_y, scale);
                if face.outline_glyph(gid, &mut builder).is_some() {
                    if let Some(path) = builder.finish() {
                        pixmap.fill_path(
                            &path,
                            &paint,
                            FillRule::Winding,
                            Transform::identity(),
                            None,
                        );
                        drawn += 1;
                    }
                }
            }
            let advance = face
                .glyph_hor_advance(gid)
                .map(|adv| adv as f32 * scale)
                .unwrap_or(font_size * FALLBACK_ADVANCE_EM);
            pen_x += advance;
        }
        drawn
    }
}

pub fn fallback_text_width(text: &str, font_size: f32) -> f32 {
    text.chars().count() as f32 * font_size * FALLBACK_ADVANCE_EM
}

pub(crate) fn solid_paint(color: Color) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color));
    paint.anti_alias = true;
    paint
}

pub(crate) fn to_sk_color(color: Color) -> tiny_skia::Color {
    let r = color.r.clamp(0.0, 1.0);
    let g = color.g.clamp(0.0, 1.0);
    let b = color.b.clamp(0.0, 1.0);
    tiny_skia::Color::from_rgba(r, g, b, 1.0)
        .unwrap_or_else(|| tiny_skia::Color::from_rgba8(0, 0, 0, 255))
}

// Font units are y-up; the pixmap is y-down, so y is mirrored around the
// baseline while building.
struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<tiny_skia::Path> {
        self.builder.finish()
    }

    fn px(&self, x: f32) -> f32 {
        self.origin_x + x * self.scale
    }

    fn py(&self, y: f32) -> f32 {
        self.origin_y - y * self.scale
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = (self.px(x), self.py(y));
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = (self.px(x), self.py(y));
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1, x, y) = (self.px(x1), self.py(y1), self.px(x), self.py(y));
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = (self.px(x1), self.py(y1));
        let (x2, y2) = (self.px(x2), self.py(y2));
        let (x, y) = (self.px(x), self.py(y));
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn load_system_font() -> Option<Arc<Vec<u8>>> {
    for dir in system_font_dirs() {
        for name in SYSTEM_FONT_CANDIDATES {
            let Some(path) = find_file(&dir, name, 3) else {
                continue;
            };
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if ttf_parser::Face::parse(&bytes, 0).is_ok() {
                log::debug!("[fieldexport][font] using system font {}", path.display());
                return Some(Arc::new(bytes));
            }
        }
    }
    log::debug!("[fieldexport][font] no system font found; text renders as placeholder bars");
    None
}

fn find_file(dir: &Path, name: &str, depth: usize) -> Option<PathBuf> {
    let direct = dir.join(name);
    if direct.is_file() {
        return Some(direct);
    }
    if depth == 0 {
        return None;
    }
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subdirs.sort();
    subdirs
        .iter()
        .find_map(|subdir| find_file(subdir, name, depth - 1))
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    if let Ok(extra) = std::env::var("FIELDEXPORT_FONT_DIR") {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_rejected_as_configuration() {
        let err = FontFace::from_bytes(vec![1, 2, 3, 4]).expect_err("not a font");
        assert!(matches!(err, ExportError::InvalidConfiguration(_)));
    }

    #[test]
    fn fallback_width_scales_with_length_and_size() {
        let short = fallback_text_width("abc", 10.0);
        let long = fallback_text_width("abcdef", 10.0);
        assert!((long - 2.0 * short).abs() < 1e-4);
        assert!((fallback_text_width("abc", 20.0) - 2.0 * short).abs() < 1e-4);
    }

    #[test]
    fn system_font_when_present_measures_positive_widths() {
        let Some(face) = FontFace::system_default() else {
            return;
        };
        assert!(face.text_width("Extinguisher", 12.0) > 0.0);
        assert!(face.ascent_ratio() > 0.0);
    }
}
