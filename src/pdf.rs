use crate::error::ExportError;
use crate::raster::Bitmap;
use crate::types::Size;
use fixed::types::I32F32;
use std::io::Write;

const PDF_HEADER: &[u8] = b"%PDF-1.7\n";
const PRODUCER: &str = "fieldexport";

/// Document information dictionary entries. Nothing time- or host-dependent
/// is written, so identical pages always produce identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub subject: Option<String>,
}

/// Accumulates rasterized pages one at a time; each bitmap is compressed as
/// it is added so the caller can drop its pixels before rendering the next
/// page.
pub struct PdfWriter {
    page_size: Size,
    // Object bodies by id - 1. Ids 1 and 2 are the catalog and the page tree,
    // written at `finish`.
    objects: Vec<String>,
    page_ids: Vec<usize>,
}

impl PdfWriter {
    pub fn new(page_size: Size) -> Self {
        Self {
            page_size,
            objects: vec![String::new(), String::new()],
            page_ids: Vec::new(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    pub fn add_page(&mut self, bitmap: &Bitmap) -> Result<(), ExportError> {
        if bitmap.width() == 0 || bitmap.height() == 0 {
            return Err(ExportError::Render(format!(
                "page {} has an empty bitmap",
                bitmap.page_index + 1
            )));
        }
        let image_name = format!("Im{}", self.page_ids.len() + 1);
        let image_id = self.push(image_object(
            bitmap.width(),
            bitmap.height(),
            &bitmap.rgb_bytes(),
        )?);

        let page_height_pt = self.page_size.height.to_pt();
        let placement = bitmap.placement;
        let bottom = page_height_pt - (placement.y + placement.height).to_pt();
        let content = format!(
            "q\n{} 0 0 {} {} {} cm\n/{} Do\nQ",
            fmt(placement.width.to_pt()),
            fmt(placement.height.to_pt()),
            fmt(placement.x.to_pt()),
            fmt(bottom),
            image_name
        );
        let content_id = self.push(content_stream_object(&content));

        let page_id = self.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Resources << /XObject << /{} {} 0 R >> >> /Contents {} 0 R >>",
            fmt(self.page_size.width.to_pt()),
            fmt(page_height_pt),
            image_name,
            image_id,
            content_id
        ));
        self.page_ids.push(page_id);
        Ok(())
    }

    pub fn finish(mut self, metadata: &PdfMetadata) -> Result<Vec<u8>, ExportError> {
        if self.page_ids.is_empty() {
            return Err(ExportError::NoContent);
        }
        let kids = self
            .page_ids
            .iter()
            .map(|id| format!("{} 0 R", id))
            .collect::<Vec<_>>()
            .join(" ");
        self.objects[0] = "<< /Type /Catalog /Pages 2 0 R >>".to_string();
        self.objects[1] = format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids,
            self.page_ids.len()
        );
        let info_id = self.push(info_object(metadata));
        Ok(build_pdf(&self.objects, 1, info_id))
    }

    fn push(&mut self, body: String) -> usize {
        self.objects.push(body);
        self.objects.len()
    }
}

/// One-shot form of `PdfWriter`.
pub fn bitmaps_to_pdf(
    bitmaps: &[Bitmap],
    page_size: Size,
    metadata: &PdfMetadata,
) -> Result<Vec<u8>, ExportError> {
    let mut writer = PdfWriter::new(page_size);
    for bitmap in bitmaps {
        writer.add_page(bitmap)?;
    }
    writer.finish(metadata)
}

fn build_pdf(objects: &[String], catalog_id: usize, info_id: usize) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(PDF_HEADER);
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (index, obj) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", index + 1).as_bytes());
        out.extend_from_slice(obj.as_bytes());
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {} 0 R /Info {} 0 R >>\nstartxref\n{}\n%%EOF",
            objects.len() + 1,
            catalog_id,
            info_id,
            xref_start
        )
        .as_bytes(),
    );
    out
}

fn image_object(width: u32, height: u32, rgb: &[u8]) -> Result<String, ExportError> {
    let stream_data = encode_stream_data(&flate_compress(rgb)?);
    Ok(format!(
        "<< /Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceRGB /BitsPerComponent 8 /Length {} /Filter [/ASCIIHexDecode /FlateDecode] >>\nstream\n{}\nendstream",
        width,
        height,
        stream_data.len(),
        stream_data
    ))
}

fn content_stream_object(content: &str) -> String {
    format!(
        "<< /Length {} >>\nstream\n{}\nendstream",
        content.len(),
        content
    )
}

fn info_object(metadata: &PdfMetadata) -> String {
    let mut dict = String::from("<<");
    if let Some(title) = metadata.title.as_deref().filter(|t| !t.trim().is_empty()) {
        dict.push_str(" /Title ");
        dict.push_str(&pdf_text_string(title));
    }
    if let Some(subject) = metadata.subject.as_deref().filter(|s| !s.trim().is_empty()) {
        dict.push_str(" /Subject ");
        dict.push_str(&pdf_text_string(subject));
    }
    dict.push_str(" /Producer ");
    dict.push_str(&pdf_text_string(PRODUCER));
    dict.push_str(" >>");
    dict
}

fn flate_compress(data: &[u8]) -> Result<Vec<u8>, ExportError> {
    compress_into(Vec::new(), data)
        .map_err(|err| ExportError::Render(format!("image stream compression failed: {err}")))
}

fn compress_into<W: Write>(sink: W, data: &[u8]) -> std::io::Result<W> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    let mut encoder = ZlibEncoder::new(sink, Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn encode_stream_data(data: &[u8]) -> String {
    let mut hex = ascii_hex_encode(data);
    hex.push('>');
    hex
}

fn ascii_hex_encode(data: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0F) as usize] as char);
    }
    out
}

// ASCII text goes out as a literal string; anything else as UTF-16BE hex
// with a byte order mark.
fn pdf_text_string(input: &str) -> String {
    if input.is_ascii() {
        return format!("({})", escape_pdf_string(input));
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in input.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    format!("<{}>", ascii_hex_encode(&bytes))
}

fn escape_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn fmt(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let fixed = I32F32::from_num(value);
    let scaled = (fixed * I32F32::from_num(1000)).round();
    let milli: i64 = scaled.to_num();
    format_milli(milli)
}

fn format_milli(milli: i64) -> String {
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.abs();
    let int_part = abs / 1000;
    let frac_part = abs % 1000;
    if frac_part == 0 {
        return format!("{}{}", sign, int_part);
    }
    let frac = format!("{:03}", frac_part);
    format!("{}{}.{}", sign, int_part, frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::NoFetch;
    use crate::content::{BreakPolicy, ContentTree, ReportSection};
    use crate::inspect::inspect_pdf_bytes;
    use crate::plan::Planner;
    use crate::raster::Rasterizer;
    use crate::testing::FixedSnapshot;
    use crate::types::{Mm, PageGeometry};

    fn render_bitmaps(sections: usize, height_mm: i32) -> Vec<Bitmap> {
        let tree = ContentTree::with_sections(
            "Inspection",
            (0..sections)
                .map(|i| ReportSection::new(format!("s{i}"), i as u32, BreakPolicy::Flow))
                .collect(),
        );
        let snapshot = FixedSnapshot::uniform(Mm::new(height_mm));
        let geometry = PageGeometry::a4();
        let pages = Planner::for_geometry(&geometry).plan(&tree, &snapshot).unwrap();
        let mut rasterizer = Rasterizer::new(geometry, &tree, &snapshot, &NoFetch);
        pages
            .iter()
            .map(|page| rasterizer.rasterize(page, 0.5).unwrap())
            .collect()
    }

    #[test]
    fn one_pdf_page_per_bitmap_with_metadata() {
        let bitmaps = render_bitmaps(25, 40);
        assert_eq!(bitmaps.len(), 4);
        let metadata = PdfMetadata {
            title: Some("Quarterly Inspection (Site 4)".to_string()),
            subject: Some("Wet pipe system".to_string()),
        };
        let bytes = bitmaps_to_pdf(&bitmaps, Size::a4(), &metadata).unwrap();
        let report = inspect_pdf_bytes(&bytes).expect("lopdf parses output");
        assert_eq!(report.page_count, 4);
        assert_eq!(report.image_count, 4);
        assert_eq!(report.title.as_deref(), Some("Quarterly Inspection (Site 4)"));
        assert_eq!(report.subject.as_deref(), Some("Wet pipe system"));
        let media = report.media_box.expect("media box");
        assert!((media[2] - 595.276).abs() < 0.01);
        assert!((media[3] - 841.89).abs() < 0.01);
    }

    #[test]
    fn output_is_byte_identical_for_identical_input() {
        let metadata = PdfMetadata {
            title: Some("Report".to_string()),
            subject: None,
        };
        let first = bitmaps_to_pdf(&render_bitmaps(3, 120), Size::a4(), &metadata).unwrap();
        let second = bitmaps_to_pdf(&render_bitmaps(3, 120), Size::a4(), &metadata).unwrap();
        assert_eq!(first, second);
        assert!(!String::from_utf8_lossy(&first).contains("CreationDate"));
    }

    #[test]
    fn no_pages_is_no_content() {
        let err = PdfWriter::new(Size::a4())
            .finish(&PdfMetadata::default())
            .err()
            .expect("empty");
        assert!(matches!(err, ExportError::NoContent));
    }

    #[test]
    fn non_ascii_title_is_utf16() {
        assert_eq!(pdf_text_string("Caf\u{e9}"), "<FEFF00430061006600E9>");
        assert_eq!(pdf_text_string("a(b)"), "(a\\(b\\))");
        let report = inspect_pdf_bytes(
            &bitmaps_to_pdf(
                &render_bitmaps(1, 10),
                Size::a4(),
                &PdfMetadata {
                    title: Some("Caf\u{e9}".to_string()),
                    subject: None,
                },
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(report.title.as_deref(), Some("Caf\u{e9}"));
    }

    #[test]
    fn numbers_are_trimmed() {
        assert_eq!(fmt(595.2756), "595.276");
        assert_eq!(fmt(10.0), "10");
        assert_eq!(fmt(-0.5), "-0.5");
        assert_eq!(format_milli(0), "0");
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn compression_failure_is_an_error_not_an_empty_stream() {
        let rgb = vec![200u8; 4096];
        assert!(compress_into(BrokenSink, &rgb).is_err());

        let compressed = flate_compress(&rgb).unwrap();
        assert!(!compressed.is_empty());
        let mut restored = Vec::new();
        std::io::Read::read_to_end(
            &mut flate2::read::ZlibDecoder::new(compressed.as_slice()),
            &mut restored,
        )
        .unwrap();
        assert_eq!(restored, rgb);
    }
}
