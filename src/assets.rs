use crate::error::ExportError;
use base64::Engine;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Css,
    Font,
    Image,
    Other,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Css => "css",
            AssetKind::Font => "font",
            AssetKind::Image => "image",
            AssetKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub source: String,
    pub kind: AssetKind,
    pub mime: String,
    pub data: Vec<u8>,
}

impl Asset {
    pub fn bytes_len(&self) -> usize {
        self.data.len()
    }

    pub fn to_data_uri(&self) -> String {
        encode_data_uri(&self.mime, &self.data)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Boundary to whatever can resolve an asset reference (object storage,
/// HTTP, local disk). Failures are per asset and never abort an export.
pub trait AssetFetcher {
    fn fetch(&self, source: &str, kind: AssetKind) -> Result<Asset, ExportError>;
}

/// Resolves `data:` URIs inline and delegates everything else.
pub fn fetch_asset(
    fetcher: &dyn AssetFetcher,
    source: &str,
    kind: AssetKind,
) -> Result<Asset, ExportError> {
    if source.starts_with("data:") {
        let (mime, data) = parse_data_uri(source)
            .ok_or_else(|| ExportError::Asset(format!("malformed data uri for {}", kind.as_str())))?;
        return Ok(Asset {
            source: source.to_string(),
            kind,
            mime,
            data,
        });
    }
    fetcher.fetch(source, kind)
}

/// Fetcher that knows nothing; every non-inline reference fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFetch;

impl AssetFetcher for NoFetch {
    fn fetch(&self, source: &str, _kind: AssetKind) -> Result<Asset, ExportError> {
        Err(ExportError::Asset(format!("unreachable asset: {}", source)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    entries: HashMap<String, (String, Vec<u8>)>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) {
        self.entries.insert(source.into(), (mime.into(), data));
    }

    pub fn with(mut self, source: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        self.insert(source, mime, data);
        self
    }
}

impl AssetFetcher for MemoryFetcher {
    fn fetch(&self, source: &str, kind: AssetKind) -> Result<Asset, ExportError> {
        let (mime, data) = self
            .entries
            .get(source)
            .ok_or_else(|| ExportError::Asset(format!("unreachable asset: {}", source)))?;
        Ok(Asset {
            source: source.to_string(),
            kind,
            mime: mime.clone(),
            data: data.clone(),
        })
    }
}

/// Reads assets from under a root directory. `file://` prefixes are
/// accepted; anything with another scheme is treated as cross-origin, and so
/// is any path (absolute, relative or via symlink) that leaves the root.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, source: &str) -> Result<PathBuf, ExportError> {
        let refused = || ExportError::Asset(format!("cross-origin asset refused: {}", source));
        let raw = source.strip_prefix("file://").unwrap_or(source);
        if raw.contains("://") {
            return Err(refused());
        }
        let path = Path::new(raw);
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(refused());
        }
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let root = std::fs::canonicalize(&self.root).map_err(|err| {
            ExportError::Asset(format!("asset root {} unavailable: {}", self.root.display(), err))
        })?;
        let resolved = std::fs::canonicalize(&candidate)
            .map_err(|err| ExportError::Asset(format!("unreachable asset {}: {}", source, err)))?;
        if !resolved.starts_with(&root) {
            return Err(refused());
        }
        Ok(resolved)
    }
}

impl AssetFetcher for DirectoryFetcher {
    fn fetch(&self, source: &str, kind: AssetKind) -> Result<Asset, ExportError> {
        let path = self.resolve(source)?;
        let data = std::fs::read(&path)?;
        let mime = sniff_mime(&data, kind, path.extension().and_then(|v| v.to_str()));
        Ok(Asset {
            source: source.to_string(),
            kind,
            mime,
            data,
        })
    }
}

/// Memoizes fetch results (including failures) for the duration of one
/// export so the rasterizer and the HTML serializer see the same bytes.
pub struct CachingFetcher<'a> {
    inner: &'a dyn AssetFetcher,
    cache: RefCell<HashMap<(String, AssetKind), Result<Asset, String>>>,
}

impl<'a> CachingFetcher<'a> {
    pub fn new(inner: &'a dyn AssetFetcher) -> Self {
        Self {
            inner,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }
}

impl AssetFetcher for CachingFetcher<'_> {
    fn fetch(&self, source: &str, kind: AssetKind) -> Result<Asset, ExportError> {
        let key = (source.to_string(), kind);
        if let Some(hit) = self.cache.borrow().get(&key) {
            return hit.clone().map_err(ExportError::Asset);
        }
        let result = self.inner.fetch(source, kind).map_err(|err| err.to_string());
        self.cache.borrow_mut().insert(key, result.clone());
        result.map_err(ExportError::Asset)
    }
}

pub fn sniff_mime(data: &[u8], kind: AssetKind, extension: Option<&str>) -> String {
    if kind == AssetKind::Css {
        return "text/css".to_string();
    }
    if let Ok(format) = image::guess_format(data) {
        return format.to_mime_type().to_string();
    }
    let ext = extension.unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "svg" => "image/svg+xml",
        "css" => "text/css",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
    .to_string()
}

pub fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    if !uri.starts_with("data:") {
        return None;
    }
    let (header, payload) = uri.split_once(',')?;
    let mime = header
        .trim_start_matches("data:")
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .ok()?
    } else {
        urlencoding::decode_binary(payload.as_bytes()).into_owned()
    };
    Some((mime, data))
}

pub fn encode_data_uri(mime: &str, data: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingFetcher {
        calls: Cell<usize>,
    }

    impl AssetFetcher for CountingFetcher {
        fn fetch(&self, source: &str, _kind: AssetKind) -> Result<Asset, ExportError> {
            self.calls.set(self.calls.get() + 1);
            Err(ExportError::Asset(format!("offline: {}", source)))
        }
    }

    #[test]
    fn parse_data_uri_base64_decodes_payload() {
        let uri = "data:text/plain;base64,SGVsbG8=";
        let (mime, data) = parse_data_uri(uri).unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(data, b"Hello");
    }

    #[test]
    fn parse_data_uri_percent_decodes_plain_payload() {
        let (mime, data) = parse_data_uri("data:text/css,a%20%7B%7D").unwrap();
        assert_eq!(mime, "text/css");
        assert_eq!(data, b"a {}");
    }

    #[test]
    fn data_uris_bypass_the_fetcher() {
        let asset = fetch_asset(&NoFetch, "data:image/png;base64,AAAA", AssetKind::Image)
            .expect("inline data is always available");
        assert_eq!(asset.mime, "image/png");
        assert_eq!(asset.data, vec![0, 0, 0]);
    }

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fieldexport_assets_{}_{}_{}",
            label,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    #[test]
    fn directory_fetcher_refuses_other_origins_and_parent_escapes() {
        let base = temp_dir("escape");
        let root = base.join("site");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(base.join("secret.txt"), b"do not share").unwrap();
        std::fs::write(root.join("logo.css"), b"body{}").unwrap();
        let fetcher = DirectoryFetcher::new(&root);

        let remote = fetcher.fetch("https://cdn.example.com/logo.png", AssetKind::Image);
        assert!(matches!(remote, Err(ExportError::Asset(_))));
        let escape = fetcher.fetch("../secret.txt", AssetKind::Other);
        assert!(matches!(escape, Err(ExportError::Asset(_))));

        let outside = base.join("secret.txt");
        let absolute = fetcher.fetch(outside.to_str().unwrap(), AssetKind::Other);
        assert!(matches!(absolute, Err(ExportError::Asset(_))));
        let file_url = fetcher.fetch(&format!("file://{}", outside.display()), AssetKind::Other);
        assert!(matches!(file_url, Err(ExportError::Asset(_))));
        let system = fetcher.fetch("/etc/passwd", AssetKind::Image);
        assert!(matches!(system, Err(ExportError::Asset(_))));
    }

    #[test]
    fn directory_fetcher_reads_inside_its_root() {
        let root = temp_dir("inside");
        std::fs::create_dir_all(root.join("css")).unwrap();
        std::fs::write(root.join("css").join("site.css"), b"p{}").unwrap();
        let fetcher = DirectoryFetcher::new(&root);

        let relative = fetcher.fetch("css/site.css", AssetKind::Css).unwrap();
        assert_eq!(relative.data, b"p{}");
        assert_eq!(relative.mime, "text/css");

        let inside = root.join("css").join("site.css");
        let absolute = fetcher.fetch(inside.to_str().unwrap(), AssetKind::Css).unwrap();
        assert_eq!(absolute.data, b"p{}");

        let missing = fetcher.fetch("css/none.css", AssetKind::Css);
        assert!(matches!(missing, Err(ExportError::Asset(_))));
    }

    #[test]
    fn caching_fetcher_remembers_failures() {
        let inner = CountingFetcher {
            calls: Cell::new(0),
        };
        let cache = CachingFetcher::new(&inner);
        assert!(cache.fetch("photo.jpg", AssetKind::Image).is_err());
        assert!(cache.fetch("photo.jpg", AssetKind::Image).is_err());
        assert_eq!(inner.calls.get(), 1);
        assert_eq!(cache.cached_len(), 1);
    }

    #[test]
    fn sniff_mime_prefers_magic_bytes() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(sniff_mime(&png_magic, AssetKind::Image, Some("jpg")), "image/png");
        assert_eq!(sniff_mime(b"body{}", AssetKind::Css, None), "text/css");
        assert_eq!(sniff_mime(b"<svg/>", AssetKind::Image, Some("SVG")), "image/svg+xml");
    }
}
