use lopdf::{Document as LoDocument, Object as LoObject};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdfInspectErrorCode {
    PdfParseFailed,
    PdfEncryptedUnsupported,
    PdfEmptyOrNoPages,
    PdfIoError,
}

impl PdfInspectErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfInspectErrorCode::PdfParseFailed => "PDF_PARSE_FAILED",
            PdfInspectErrorCode::PdfEncryptedUnsupported => "PDF_ENCRYPTED_UNSUPPORTED",
            PdfInspectErrorCode::PdfEmptyOrNoPages => "PDF_EMPTY_OR_NO_PAGES",
            PdfInspectErrorCode::PdfIoError => "PDF_IO_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdfInspectError {
    pub code: PdfInspectErrorCode,
    pub message: String,
}

impl std::fmt::Display for PdfInspectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for PdfInspectError {}

/// What a reader sees when it opens an exported report.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfInspectReport {
    pub pdf_version: String,
    pub page_count: usize,
    pub encrypted: bool,
    pub file_size_bytes: usize,
    pub title: Option<String>,
    pub subject: Option<String>,
    pub image_count: usize,
    // Points, first page only.
    pub media_box: Option<[f32; 4]>,
}

pub fn inspect_pdf_bytes(bytes: &[u8]) -> Result<PdfInspectReport, PdfInspectError> {
    let pdf = LoDocument::load_mem(bytes).map_err(|err| PdfInspectError {
        code: PdfInspectErrorCode::PdfParseFailed,
        message: err.to_string(),
    })?;

    let pages = pdf.get_pages();
    let media_box = pages
        .values()
        .next()
        .and_then(|id| pdf.get_dictionary(*id).ok())
        .and_then(|page| page.get(b"MediaBox").ok())
        .and_then(|obj| obj.as_array().ok())
        .and_then(|values| {
            let nums: Vec<f32> = values.iter().filter_map(object_number).collect();
            (nums.len() == 4).then(|| [nums[0], nums[1], nums[2], nums[3]])
        });

    let info = pdf
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| obj.as_reference().ok())
        .and_then(|id| pdf.get_dictionary(id).ok());
    let info_text = |key: &[u8]| {
        info.and_then(|dict| dict.get(key).ok())
            .and_then(|obj| match obj {
                LoObject::String(raw, _) => Some(decode_text_string(raw)),
                _ => None,
            })
    };

    let image_count = pdf
        .objects
        .values()
        .filter(|obj| match obj {
            LoObject::Stream(stream) => matches!(
                stream.dict.get(b"Subtype"),
                Ok(LoObject::Name(name)) if name.as_slice() == b"Image"
            ),
            _ => false,
        })
        .count();

    Ok(PdfInspectReport {
        pdf_version: pdf.version.clone(),
        page_count: pages.len(),
        encrypted: pdf.is_encrypted(),
        file_size_bytes: bytes.len(),
        title: info_text(b"Title"),
        subject: info_text(b"Subject"),
        image_count,
        media_box,
    })
}

pub fn inspect_pdf_path(path: &Path) -> Result<PdfInspectReport, PdfInspectError> {
    let data = std::fs::read(path).map_err(|err| PdfInspectError {
        code: PdfInspectErrorCode::PdfIoError,
        message: err.to_string(),
    })?;
    inspect_pdf_bytes(&data)
}

/// Checks an artifact is fit to hand to a user: readable and non-empty.
pub fn require_shareable(report: &PdfInspectReport) -> Result<(), PdfInspectError> {
    if report.encrypted {
        return Err(PdfInspectError {
            code: PdfInspectErrorCode::PdfEncryptedUnsupported,
            message: "encrypted pdf artifacts are not supported".to_string(),
        });
    }
    if report.page_count == 0 {
        return Err(PdfInspectError {
            code: PdfInspectErrorCode::PdfEmptyOrNoPages,
            message: "pdf has no pages".to_string(),
        });
    }
    Ok(())
}

fn object_number(obj: &LoObject) -> Option<f32> {
    match obj {
        LoObject::Integer(value) => Some(*value as f32),
        LoObject::Real(value) => Some(*value as f32),
        _ => None,
    }
}

fn decode_text_string(raw: &[u8]) -> String {
    if raw.len() >= 2 && raw[0] == 0xFE && raw[1] == 0xFF {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    raw.iter().map(|&b| b as char).collect()
}
