use crate::assets::{AssetFetcher, AssetKind, fetch_asset};
use crate::content::{ContentNode, ReportSection, TextRole};
use crate::error::ExportError;
use crate::font::{FontFace, fallback_text_width, solid_paint};
use crate::snapshot::{AssetFailure, ContentTreeSnapshot, RenderedSection, StyleSource};
use crate::types::{Color, Mm};
use tiny_skia::{Pixmap, PixmapPaint, Rect, Stroke, Transform};

// All layout happens in CSS pixels at 1x; the raster scale is applied when
// painting.
const SECTION_PADDING: f32 = 6.0;
const NODE_GAP: f32 = 6.0;
const LINE_HEIGHT_FACTOR: f32 = 1.35;
const CELL_PADDING: f32 = 4.0;
const DEFAULT_IMAGE_ASPECT: f32 = 0.75;

const INK: Color = Color {
    r: 0.13,
    g: 0.13,
    b: 0.13,
};
const ACCENT: Color = Color {
    r: 0.69,
    g: 0.11,
    b: 0.09,
};
const MUTED: Color = Color {
    r: 0.42,
    g: 0.42,
    b: 0.42,
};
const RULE: Color = Color {
    r: 0.75,
    g: 0.75,
    b: 0.75,
};
const HEADER_FILL: Color = Color {
    r: 0.93,
    g: 0.93,
    b: 0.93,
};

const BASE_CSS: &str = "\
body { font-family: 'DejaVu Sans', 'Liberation Sans', Arial, sans-serif; color: #212121; margin: 0; }
.report-title { font-size: 18pt; color: #b01c17; margin: 0 0 8px 0; }
.report-description { color: #6b6b6b; margin: 0 0 12px 0; }
.report-section { padding: 6px 0; }
.report-section h2 { font-size: 14pt; color: #b01c17; margin: 0 0 6px 0; }
.report-section p { font-size: 10pt; line-height: 1.35; margin: 0 0 6px 0; }
.report-section p.caption { font-size: 8pt; color: #6b6b6b; }
.report-section figure { margin: 0 0 6px 0; }
.report-section img { max-width: 100%; height: auto; }
.report-section table { width: 100%; border-collapse: collapse; font-size: 10pt; }
.report-section th, .report-section td { border: 1px solid #bfbfbf; padding: 4px; text-align: left; }
.report-section th { background: #ededed; }
section[data-section-id=\"signature\"] img { max-height: 30mm; }
";

fn font_size_for(role: TextRole) -> f32 {
    // 14pt / 10pt / 8pt expressed in CSS px.
    match role {
        TextRole::Heading => 18.67,
        TextRole::Body => 13.33,
        TextRole::Caption => 10.67,
    }
}

fn color_for(role: TextRole) -> Color {
    match role {
        TextRole::Heading => ACCENT,
        TextRole::Body => INK,
        TextRole::Caption => MUTED,
    }
}

enum Laid {
    Lines {
        lines: Vec<String>,
        font_size: f32,
        color: Color,
    },
    Image {
        source: String,
        width: f32,
        height: f32,
    },
    Table {
        column_width: f32,
        rows: Vec<LaidRow>,
    },
}

struct LaidRow {
    cells: Vec<Vec<String>>,
    height: f32,
    header: bool,
}

struct NodeBox {
    y: f32,
    height: f32,
    laid: Laid,
}

/// Built-in server-side layout engine. Lays sections out in a single
/// column, measures them, paints them with tiny-skia and emits matching HTML.
#[derive(Debug, Clone, Default)]
pub struct LayoutSnapshot {
    font: Option<FontFace>,
    linked_styles: Vec<String>,
    extra_css: Vec<String>,
}

impl LayoutSnapshot {
    pub fn new(font: Option<FontFace>) -> Self {
        Self {
            font,
            linked_styles: Vec::new(),
            extra_css: Vec::new(),
        }
    }

    pub fn with_stylesheet_link(mut self, href: impl Into<String>) -> Self {
        self.linked_styles.push(href.into());
        self
    }

    pub fn with_css(mut self, css: impl Into<String>) -> Self {
        self.extra_css.push(css.into());
        self
    }

    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        match &self.font {
            Some(face) => face.text_width(text, font_size),
            None => fallback_text_width(text, font_size),
        }
    }

    fn wrap(&self, text: &str, font_size: f32, max_width: f32) -> Vec<String> {
        let mut lines = Vec::new();
        for paragraph in text.split('\n') {
            let mut line = String::new();
            for word in paragraph.split_whitespace() {
                let candidate = if line.is_empty() {
                    word.to_string()
                } else {
                    format!("{line} {word}")
                };
                if self.text_width(&candidate, font_size) <= max_width {
                    line = candidate;
                    continue;
                }
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                if self.text_width(word, font_size) <= max_width {
                    line = word.to_string();
                } else {
                    // Words wider than the column are broken by character.
                    for ch in word.chars() {
                        let mut next = line.clone();
                        next.push(ch);
                        if !line.is_empty() && self.text_width(&next, font_size) > max_width {
                            lines.push(std::mem::take(&mut line));
                            line.push(ch);
                        } else {
                            line = next;
                        }
                    }
                }
            }
            lines.push(line);
        }
        lines
    }

    fn layout(&self, section: &ReportSection, width_px: f32) -> (Vec<NodeBox>, f32) {
        let mut boxes = Vec::with_capacity(section.content.len());
        let mut y = SECTION_PADDING;
        for (idx, node) in section.content.iter().enumerate() {
            if idx > 0 {
                y += NODE_GAP;
            }
            let (laid, height) = match node {
                ContentNode::Text { role, text } => {
                    let font_size = font_size_for(*role);
                    let lines = self.wrap(text, font_size, width_px);
                    let height = lines.len() as f32 * font_size * LINE_HEIGHT_FACTOR;
                    (
                        Laid::Lines {
                            lines,
                            font_size,
                            color: color_for(*role),
                        },
                        height,
                    )
                }
                ContentNode::Image {
                    source,
                    aspect,
                    max_height,
                    ..
                } => {
                    let aspect = aspect
                        .filter(|a| a.is_finite() && *a > 0.0)
                        .unwrap_or(DEFAULT_IMAGE_ASPECT);
                    let mut height = width_px * aspect;
                    if let Some(max) = max_height {
                        height = height.min(max.to_px());
                    }
                    (
                        Laid::Image {
                            source: source.clone(),
                            width: width_px,
                            height,
                        },
                        height,
                    )
                }
                ContentNode::Table { header, rows } => {
                    let columns = header
                        .len()
                        .max(rows.iter().map(|row| row.len()).max().unwrap_or(0))
                        .max(1);
                    let column_width = width_px / columns as f32;
                    let font_size = font_size_for(TextRole::Body);
                    let inner = (column_width - 2.0 * CELL_PADDING).max(1.0);
                    let mut laid_rows = Vec::with_capacity(rows.len() + 1);
                    let all_rows = std::iter::once((header, true))
                        .filter(|(cells, _)| !cells.is_empty())
                        .chain(rows.iter().map(|row| (row, false)));
                    for (cells, is_header) in all_rows {
                        let wrapped: Vec<Vec<String>> = cells
                            .iter()
                            .map(|cell| self.wrap(cell, font_size, inner))
                            .collect();
                        let max_lines = wrapped.iter().map(|w| w.len()).max().unwrap_or(1).max(1);
                        let height =
                            max_lines as f32 * font_size * LINE_HEIGHT_FACTOR + 2.0 * CELL_PADDING;
                        laid_rows.push(LaidRow {
                            cells: wrapped,
                            height,
                            header: is_header,
                        });
                    }
                    let height: f32 = laid_rows.iter().map(|row| row.height).sum();
                    (
                        Laid::Table {
                            column_width,
                            rows: laid_rows,
                        },
                        height,
                    )
                }
            };
            boxes.push(NodeBox { y, height, laid });
            y += height;
        }
        (boxes, y + SECTION_PADDING)
    }

    fn paint_lines(
        &self,
        pixmap: &mut Pixmap,
        lines: &[String],
        x: f32,
        top: f32,
        font_size: f32,
        color: Color,
        scale: f32,
    ) {
        let line_height = font_size * LINE_HEIGHT_FACTOR;
        let band_bottom = pixmap.height() as f32 / scale;
        for (idx, line) in lines.iter().enumerate() {
            let line_top = top + idx as f32 * line_height;
            if line.is_empty() || line_top + line_height <= 0.0 || line_top >= band_bottom {
                continue;
            }
            match &self.font {
                Some(face) => {
                    let leading = (line_height - font_size) / 2.0;
                    let baseline = line_top + leading + font_size * face.ascent_ratio().min(1.0);
                    face.draw_text(
                        pixmap,
                        line,
                        x * scale,
                        baseline * scale,
                        font_size * scale,
                        color,
                    );
                }
                None => {
                    // Placeholder bar where the glyphs would be.
                    let width = fallback_text_width(line, font_size);
                    let bar_h = font_size * 0.45;
                    let bar_top = line_top + (line_height - bar_h) / 2.0;
                    if let Some(rect) =
                        Rect::from_xywh(x * scale, bar_top * scale, width * scale, bar_h * scale)
                    {
                        pixmap.fill_rect(rect, &solid_paint(color), Transform::identity(), None);
                    }
                }
            }
        }
    }

    fn paint_image(
        &self,
        pixmap: &mut Pixmap,
        source: &str,
        top: f32,
        box_w: f32,
        box_h: f32,
        scale: f32,
        assets: &dyn AssetFetcher,
    ) -> Result<(), String> {
        let asset = fetch_asset(assets, source, AssetKind::Image).map_err(|err| err.to_string())?;
        let image = decode_image_to_pixmap(&asset.data)
            .ok_or_else(|| format!("undecodable image ({} bytes)", asset.bytes_len()))?;
        let (iw, ih) = (image.width() as f32, image.height() as f32);
        let fit = (box_w * scale / iw).min(box_h * scale / ih);
        let draw_w = iw * fit;
        let draw_h = ih * fit;
        let dx = (box_w * scale - draw_w) / 2.0;
        let dy = top * scale + (box_h * scale - draw_h) / 2.0;
        let transform = Transform::from_row(fit, 0.0, 0.0, fit, dx, dy);
        pixmap.draw_pixmap(0, 0, image.as_ref(), &PixmapPaint::default(), transform, None);
        Ok(())
    }

    fn paint_table(
        &self,
        pixmap: &mut Pixmap,
        rows: &[LaidRow],
        column_width: f32,
        top: f32,
        scale: f32,
    ) {
        let font_size = font_size_for(TextRole::Body);
        let mut stroke = Stroke::default();
        stroke.width = scale.max(1.0);
        let rule = solid_paint(RULE);
        let band_bottom = pixmap.height() as f32 / scale;
        let mut y = top;
        for row in rows {
            if y + row.height <= 0.0 || y >= band_bottom {
                y += row.height;
                continue;
            }
            for (col, cell) in row.cells.iter().enumerate() {
                let x = col as f32 * column_width;
                if let Some(rect) =
                    Rect::from_xywh(x * scale, y * scale, column_width * scale, row.height * scale)
                {
                    if row.header {
                        pixmap.fill_rect(rect, &solid_paint(HEADER_FILL), Transform::identity(), None);
                    }
                    let path = tiny_skia::PathBuilder::from_rect(rect);
                    pixmap.stroke_path(&path, &rule, &stroke, Transform::identity(), None);
                }
                self.paint_lines(
                    pixmap,
                    cell,
                    x + CELL_PADDING,
                    y + CELL_PADDING,
                    font_size,
                    INK,
                    scale,
                );
            }
            y += row.height;
        }
    }
}

impl ContentTreeSnapshot for LayoutSnapshot {
    fn measure(&self, section: &ReportSection, width: Mm) -> Result<Mm, ExportError> {
        let (_, height) = self.layout(section, width.to_px());
        Ok(Mm::from_px(height))
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
        let (boxes, _) = self.layout(section, width.to_px());
        let w = width.to_device_px(scale).max(1);
        let h = height.to_device_px(scale).max(1);
        let mut pixmap = Pixmap::new(w, h).ok_or_else(|| {
            ExportError::Render(format!(
                "cannot allocate {}x{} surface for section '{}'",
                w, h, section.id
            ))
        })?;
        pixmap.fill(tiny_skia::Color::WHITE);

        // Node positions are shifted so the band top lands on row 0.
        let band_top = offset.to_px();
        let band_bottom = band_top + height.to_px();
        let mut asset_failures = Vec::new();
        for node in &boxes {
            if node.y + node.height <= band_top || node.y >= band_bottom {
                continue;
            }
            let top = node.y - band_top;
            match &node.laid {
                Laid::Lines {
                    lines,
                    font_size,
                    color,
                } => self.paint_lines(&mut pixmap, lines, 0.0, top, *font_size, *color, scale),
                Laid::Image {
                    source,
                    width,
                    height,
                } => {
                    if let Err(reason) = self.paint_image(
                        &mut pixmap,
                        source,
                        top,
                        *width,
                        *height,
                        scale,
                        assets,
                    ) {
                        asset_failures.push(AssetFailure {
                            section_id: section.id.clone(),
                            source: source.clone(),
                            reason,
                        });
                    }
                }
                Laid::Table { column_width, rows } => {
                    self.paint_table(&mut pixmap, rows, *column_width, top, scale)
                }
            }
        }

        Ok(RenderedSection {
            pixmap,
            asset_failures,
        })
    }

    fn markup(&self, section: &ReportSection) -> String {
        let mut out = String::from("<div class=\"section-body\">");
        for node in &section.content {
            match node {
                ContentNode::Text { role, text } => {
                    let body = escape_html_text(text).replace('\n', "<br>");
                    match role {
                        TextRole::Heading => out.push_str(&format!("<h2>{body}</h2>")),
                        TextRole::Body => out.push_str(&format!("<p>{body}</p>")),
                        TextRole::Caption => out.push_str(&format!("<p class=\"caption\">{body}</p>")),
                    }
                }
                ContentNode::Image { source, alt, .. } => {
                    out.push_str(&format!(
                        "<figure><img src=\"{}\" alt=\"{}\"></figure>",
                        escape_html_attr(source),
                        escape_html_attr(alt)
                    ));
                }
                ContentNode::Table { header, rows } => {
                    out.push_str("<table>");
                    if !header.is_empty() {
                        out.push_str("<thead><tr>");
                        for cell in header {
                            out.push_str(&format!("<th>{}</th>", escape_html_text(cell)));
                        }
                        out.push_str("</tr></thead>");
                    }
                    out.push_str("<tbody>");
                    for row in rows {
                        out.push_str("<tr>");
                        for cell in row {
                            out.push_str(&format!("<td>{}</td>", escape_html_text(cell)));
                        }
                        out.push_str("</tr>");
                    }
                    out.push_str("</tbody></table>");
                }
            }
        }
        out.push_str("</div>");
        out
    }

    fn stylesheets(&self) -> Vec<StyleSource> {
        let mut sources = vec![StyleSource::Inline(BASE_CSS.to_string())];
        sources.extend(self.linked_styles.iter().cloned().map(StyleSource::Linked));
        sources.extend(self.extra_css.iter().cloned().map(StyleSource::Inline));
        sources
    }
}

pub(crate) fn decode_image_to_pixmap(data: &[u8]) -> Option<Pixmap> {
    let decoded = image::load_from_memory(data).ok()?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)?;
    let src = rgba.as_raw();
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

pub(crate) fn escape_html_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

pub(crate) fn escape_html_attr(input: &str) -> String {
    escape_html_text(input).replace('"', "&quot;")
}
