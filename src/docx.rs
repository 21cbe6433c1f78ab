use base64::Engine;
use sha2::{Digest, Sha256};

pub const DOCX_MIME: &str = "application/vnd.ms-word";

const WORD_NAMESPACES: &str = " xmlns:o=\"urn:schemas-microsoft-com:office:office\" xmlns:w=\"urn:schemas-microsoft-com:office:word\"";
const WORD_META: &str = "<meta name=\"ProgId\" content=\"Word.Document\"><meta name=\"Generator\" content=\"fieldexport\">";
const WORD_VIEW: &str = "<!--[if gte mso 9]><xml><w:WordDocument><w:View>Print</w:View><w:Zoom>100</w:Zoom></w:WordDocument></xml><![endif]-->";
const BASE64_LINE: usize = 76;

/// Wraps a self-contained HTML document in a single-part MHTML envelope that
/// word processors open as an editable web-layout document. The result is not
/// OOXML; structure beyond what HTML carries is lost.
///
/// The boundary comes from a digest of the body, so identical HTML always
/// yields identical bytes.
pub fn wrap_html(html: &str, file_name: &str) -> Vec<u8> {
    let body = word_compatible(html);
    let digest = Sha256::digest(body.as_bytes());
    let boundary = format!("----=_NextPart_{}", hex_prefix(&digest, 12));
    let location = format!("file:///C:/{}.htm", sanitize_location(file_name));

    let mut out = String::with_capacity(body.len() * 4 / 3 + 512);
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!(
        "Content-Type: multipart/related; boundary=\"{}\"; type=\"text/html\"\r\n",
        boundary
    ));
    out.push_str("X-MimeOLE: fieldexport\r\n\r\n");
    out.push_str("This is a multi-part message in MIME format.\r\n\r\n");
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: text/html; charset=\"utf-8\"\r\n");
    out.push_str("Content-Transfer-Encoding: base64\r\n");
    out.push_str(&format!("Content-Location: {}\r\n\r\n", location));

    let encoded = base64::engine::general_purpose::STANDARD.encode(body.as_bytes());
    for chunk in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out.push_str(&format!("\r\n--{}--\r\n", boundary));
    out.into_bytes()
}

// Word only switches to print layout when it sees its namespaces and the
// WordDocument block in the head.
fn word_compatible(html: &str) -> String {
    let mut out = html.to_string();
    if let Some(pos) = find_ascii_ci(&out, "<html") {
        let insert_at = pos + "<html".len();
        out.insert_str(insert_at, WORD_NAMESPACES);
    }
    if let Some(pos) = find_ascii_ci(&out, "<head>") {
        let insert_at = pos + "<head>".len();
        out.insert_str(insert_at, &format!("{WORD_META}{WORD_VIEW}"));
    }
    out
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(needle)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{:02X}", b))
        .collect()
}

fn sanitize_location(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "report".to_string()
    } else {
        cleaned
    }
}
