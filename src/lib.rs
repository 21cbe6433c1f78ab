mod assets;
mod content;
mod debug;
mod distribute;
mod docx;
mod error;
mod font;
mod frame;
mod html;
mod inspect;
mod layout;
mod metrics;
mod pdf;
mod plan;
mod raster;
mod session;
mod snapshot;
#[cfg(test)]
mod testing;
mod types;

pub use assets::{
    Asset, AssetFetcher, AssetKind, CachingFetcher, DirectoryFetcher, MemoryFetcher, NoFetch,
    encode_data_uri, fetch_asset, parse_data_uri,
};
pub use content::{BreakPolicy, ContentNode, ContentTree, ReportSection, SectionId, TextRole};
use debug::DebugLogger;
pub use distribute::{
    DirectorySurface, DistributionSurface, ShareChannel, compose_intent, download_file, share_file,
};
pub use docx::DOCX_MIME;
pub use error::ExportError;
pub use font::FontFace;
pub use html::{HtmlOptions, HtmlOutput, inline_css_urls, serialize_html};
pub use inspect::{
    PdfInspectError, PdfInspectErrorCode, PdfInspectReport, inspect_pdf_bytes, inspect_pdf_path,
    require_shareable,
};
pub use layout::LayoutSnapshot;
pub use metrics::{ExportMetrics, PageMetrics};
pub use pdf::{PdfMetadata, PdfWriter, bitmaps_to_pdf};
pub use plan::{LogicalPage, PageSlice, Planner, plan};
pub use raster::{Bitmap, DEFAULT_SCALE, MAX_SCALE, Rasterizer};
pub use session::{
    Clock, MemoryStore, RecordId, ResolvedSignature, SessionId, SessionStatus, Signature,
    SignatureError, SignatureSession, SignatureSessionManager, SignatureStore, SignatureTarget,
    SigningGate, SystemClock, TargetKind,
};
pub use snapshot::{AssetFailure, ContentTreeSnapshot, RenderedSection, StyleSource};
pub use types::{Color, Margins, Mm, PageGeometry, Rect, Size};

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Section id reserved for the signature block appended to signed exports.
pub const SIGNATURE_SECTION_ID: &str = "signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Pdf,
    Html,
    Docx,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Html => "html",
            ExportFormat::Docx => "docx",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Html => "text/html",
            ExportFormat::Docx => DOCX_MIME,
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_ascii_uppercase())
    }
}

/// A finished export, ready for `download_file` or `share_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
    pub file_name: String,
}

impl ExportArtifact {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Signature rendered as the last section of an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureBlock {
    pub label: String,
    // Image reference or data URI.
    pub image: String,
    pub signer_name: Option<String>,
    pub signed_at: Option<DateTime<Utc>>,
}

impl SignatureBlock {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            label: "Signature".to_string(),
            image: image.into(),
            signer_name: None,
            signed_at: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn caption(&self) -> Option<String> {
        let when = self
            .signed_at
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string());
        match (self.signer_name.as_deref(), when) {
            (Some(name), Some(when)) => Some(format!("Signed by {} on {}", name, when)),
            (Some(name), None) => Some(format!("Signed by {}", name)),
            (None, Some(when)) => Some(format!("Signed on {}", when)),
            (None, None) => None,
        }
    }

    fn to_section(&self, order: u32) -> ReportSection {
        let mut section = ReportSection::new(SIGNATURE_SECTION_ID, order, BreakPolicy::AvoidBreak)
            .with_node(ContentNode::heading(self.label.clone()))
            .with_node(ContentNode::Image {
                source: self.image.clone(),
                alt: self.label.clone(),
                aspect: None,
                max_height: Some(Mm::new(30)),
            });
        if let Some(caption) = self.caption() {
            section = section.with_node(ContentNode::caption(caption));
        }
        section
    }
}

impl From<&Signature> for SignatureBlock {
    fn from(signature: &Signature) -> Self {
        Self {
            label: "Signature".to_string(),
            image: signature.image_data.clone(),
            signer_name: signature.signer_name.clone(),
            signed_at: Some(signature.signed_at),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub file_name: String,
    pub title: String,
    pub description: Option<String>,
    pub signature: Option<SignatureBlock>,
}

impl ExportOptions {
    pub fn new(file_name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            title: title.into(),
            description: None,
            signature: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_signature(mut self, signature: SignatureBlock) -> Self {
        self.signature = Some(signature);
        self
    }
}

/// Receives every failure `export_document` swallows.
pub trait ExportReporter {
    fn report(&self, format: ExportFormat, error: &ExportError, message: &str);
}

/// Default reporter: one `log::error!` line per failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ExportReporter for LogReporter {
    fn report(&self, format: ExportFormat, error: &ExportError, message: &str) {
        log::error!("[fieldexport][export] {} ({}): {}", format.as_str(), error.code(), message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Idle,
    Busy,
}

// Resets the exporter to idle however the export ends.
struct BusyGuard<'a>(&'a Cell<ExportState>);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(ExportState::Idle);
    }
}

pub struct Exporter {
    geometry: PageGeometry,
    scale: f32,
    fetcher: Box<dyn AssetFetcher>,
    snapshot: Box<dyn ContentTreeSnapshot>,
    reporter: Box<dyn ExportReporter>,
    debug: Option<Arc<DebugLogger>>,
    state: Cell<ExportState>,
    last_metrics: RefCell<Option<ExportMetrics>>,
}

impl Exporter {
    pub fn builder() -> ExporterBuilder {
        ExporterBuilder::new()
    }

    pub fn geometry(&self) -> PageGeometry {
        self.geometry
    }

    pub fn state(&self) -> ExportState {
        self.state.get()
    }

    /// Metrics of the most recent successful export.
    pub fn last_metrics(&self) -> Option<ExportMetrics> {
        self.last_metrics.borrow().clone()
    }

    /// Exports `tree` as `format`. Never panics and never returns an error:
    /// any fatal failure is logged, handed to the reporter, and turned into
    /// `None`.
    pub fn export_document(
        &self,
        tree: &ContentTree,
        format: ExportFormat,
        options: &ExportOptions,
    ) -> Option<ExportArtifact> {
        match self.try_export_document(tree, format, options) {
            Ok(artifact) => Some(artifact),
            Err(err) => {
                let message = failure_message(format, &err);
                self.reporter.report(format, &err, &message);
                None
            }
        }
    }

    pub fn try_export_document(
        &self,
        tree: &ContentTree,
        format: ExportFormat,
        options: &ExportOptions,
    ) -> Result<ExportArtifact, ExportError> {
        if self.state.get() == ExportState::Busy {
            return Err(ExportError::Busy);
        }
        self.state.set(ExportState::Busy);
        let _guard = BusyGuard(&self.state);

        tree.validate()?;
        let tree = with_signature(tree, options.signature.as_ref());
        tree.validate()?;
        let file_name = artifact_file_name(&options.file_name, &options.title, format);
        let assets = CachingFetcher::new(self.fetcher.as_ref());

        let mut metrics = ExportMetrics::default();
        let bytes = match format {
            ExportFormat::Pdf => self.render_pdf(&tree, options, &assets, &mut metrics)?,
            ExportFormat::Html => {
                let started = Instant::now();
                let html = self.render_html(&tree, options, &assets, &mut metrics)?;
                metrics.serialize_ms = elapsed_ms(started);
                html.into_bytes()
            }
            ExportFormat::Docx => {
                let started = Instant::now();
                let html = self.render_html(&tree, options, &assets, &mut metrics)?;
                let wrapped = docx::wrap_html(&html, &file_name);
                metrics.serialize_ms = elapsed_ms(started);
                wrapped
            }
        };
        metrics.total_bytes = bytes.len();

        if let Some(logger) = self.debug.as_deref() {
            logger.log_event(
                "export.finished",
                serde_json::json!({
                    "format": format.as_str(),
                    "file_name": file_name,
                    "pages": metrics.page_count(),
                    "bytes": metrics.total_bytes,
                    "asset_failures": metrics.asset_failures.len(),
                }),
            );
            logger.emit_summary(format.as_str());
            logger.flush();
        }
        *self.last_metrics.borrow_mut() = Some(metrics);

        Ok(ExportArtifact {
            format,
            bytes,
            file_name,
        })
    }

    fn render_pdf(
        &self,
        tree: &ContentTree,
        options: &ExportOptions,
        assets: &dyn AssetFetcher,
        metrics: &mut ExportMetrics,
    ) -> Result<Vec<u8>, ExportError> {
        let started = Instant::now();
        let pages = Planner::for_geometry(&self.geometry)
            .with_debug(self.debug.clone())
            .plan(tree, self.snapshot.as_ref())?;
        metrics.plan_ms = elapsed_ms(started);

        let mut rasterizer = Rasterizer::new(self.geometry, tree, self.snapshot.as_ref(), assets)
            .with_debug(self.debug.clone());
        let mut writer = PdfWriter::new(self.geometry.size);
        // Strictly one page at a time; each bitmap is dropped once written.
        for page in &pages {
            let page_started = Instant::now();
            let bitmap = rasterizer.rasterize(page, self.scale)?;
            let raster_ms = elapsed_ms(page_started);
            writer.add_page(&bitmap)?;
            metrics.total_raster_ms += raster_ms;
            metrics.pages.push(PageMetrics {
                page_number: page.index + 1,
                raster_ms,
                slice_count: page.slices.len(),
                bitmap_width: bitmap.width(),
                bitmap_height: bitmap.height(),
                shrink_factor: bitmap.shrink_factor,
            });
        }
        metrics.asset_failures = rasterizer.take_asset_failures();

        let started = Instant::now();
        let bytes = writer.finish(&PdfMetadata {
            title: non_blank(&options.title),
            subject: options.description.as_deref().and_then(non_blank),
        })?;
        metrics.serialize_ms = elapsed_ms(started);
        Ok(bytes)
    }

    fn render_html(
        &self,
        tree: &ContentTree,
        options: &ExportOptions,
        assets: &dyn AssetFetcher,
        metrics: &mut ExportMetrics,
    ) -> Result<String, ExportError> {
        let title = non_blank(&options.title).unwrap_or_else(|| tree.title.clone());
        let output = serialize_html(
            tree,
            self.snapshot.as_ref(),
            assets,
            &HtmlOptions {
                title,
                description: options.description.clone(),
                geometry: self.geometry,
            },
        )?;
        if let Some(logger) = self.debug.as_deref() {
            for failure in &output.asset_failures {
                logger.log_event(
                    "export.asset_failure",
                    serde_json::json!({
                        "section": failure.section_id.as_str(),
                        "source": failure.source,
                        "reason": failure.reason,
                    }),
                );
                logger.increment("export.asset_failure", 1);
            }
        }
        metrics.asset_failures = output.asset_failures;
        Ok(output.html)
    }
}

fn with_signature<'a>(tree: &'a ContentTree, signature: Option<&SignatureBlock>) -> Cow<'a, ContentTree> {
    let Some(signature) = signature else {
        return Cow::Borrowed(tree);
    };
    let order = tree
        .sections()
        .iter()
        .map(|section| section.order)
        .max()
        .map(|order| order.saturating_add(1))
        .unwrap_or(0);
    let mut signed = tree.clone();
    signed.push(signature.to_section(order));
    Cow::Owned(signed)
}

fn failure_message(format: ExportFormat, err: &ExportError) -> String {
    match err {
        ExportError::Busy => format!("{} export skipped: {}", format, err),
        ExportError::NoContent => format!("{} export failed: the report has no sections", format),
        _ => format!("{} export failed: {}", format, err),
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// `file_name` with the format's extension, or a name derived from `title`
/// when none was given.
fn artifact_file_name(file_name: &str, title: &str, format: ExportFormat) -> String {
    let base = if file_name.trim().is_empty() {
        let derived: String = title
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if derived.trim_matches('_').is_empty() {
            "report".to_string()
        } else {
            derived
        }
    } else {
        file_name.trim().to_string()
    };
    let suffix = format!(".{}", format.extension());
    if base.to_ascii_lowercase().ends_with(&suffix) {
        base
    } else {
        format!("{}{}", base, suffix)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

pub struct ExporterBuilder {
    page_size: Size,
    margins: Margins,
    scale: f32,
    fetcher: Option<Box<dyn AssetFetcher>>,
    asset_root: Option<PathBuf>,
    snapshot: Option<Box<dyn ContentTreeSnapshot>>,
    font: Option<FontFace>,
    font_file: Option<PathBuf>,
    system_font: bool,
    stylesheet_links: Vec<String>,
    extra_css: Vec<String>,
    reporter: Option<Box<dyn ExportReporter>>,
    debug_path: Option<PathBuf>,
}

impl Default for ExporterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterBuilder {
    pub fn new() -> Self {
        Self {
            page_size: Size::a4(),
            margins: Margins::all(Mm::new(10)),
            scale: DEFAULT_SCALE,
            fetcher: None,
            asset_root: None,
            snapshot: None,
            font: None,
            font_file: None,
            system_font: true,
            stylesheet_links: Vec::new(),
            extra_css: Vec::new(),
            reporter: None,
            debug_path: None,
        }
    }

    pub fn page_size(mut self, size: Size) -> Self {
        self.page_size = size;
        self
    }

    pub fn margins(mut self, margins: Margins) -> Self {
        self.margins = margins;
        self
    }

    pub fn margin_all(mut self, value: Mm) -> Self {
        self.margins = Margins::all(value);
        self
    }

    pub fn geometry(self, geometry: PageGeometry) -> Self {
        self.page_size(geometry.size).margins(geometry.margins)
    }

    /// Device pixels per CSS pixel. Accepted range is (0, 4].
    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn fetcher(mut self, fetcher: Box<dyn AssetFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    // Shorthand for a `DirectoryFetcher`; ignored when `fetcher` is set.
    pub fn asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = Some(root.into());
        self
    }

    /// Replaces the built-in `LayoutSnapshot`.
    pub fn snapshot(mut self, snapshot: Box<dyn ContentTreeSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn font(mut self, font: FontFace) -> Self {
        self.font = Some(font);
        self
    }

    pub fn font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_file = Some(path.into());
        self
    }

    pub fn system_font(mut self, enabled: bool) -> Self {
        self.system_font = enabled;
        self
    }

    pub fn stylesheet_link(mut self, href: impl Into<String>) -> Self {
        self.stylesheet_links.push(href.into());
        self
    }

    pub fn css(mut self, css: impl Into<String>) -> Self {
        self.extra_css.push(css.into());
        self
    }

    pub fn reporter(mut self, reporter: Box<dyn ExportReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn debug_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.debug_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Exporter, ExportError> {
        raster::validate_scale(self.scale)?;
        let geometry = PageGeometry::new(self.page_size, self.margins);
        if !geometry.usable_width().is_positive() || !geometry.usable_height().is_positive() {
            return Err(ExportError::InvalidConfiguration(
                "margins leave no usable page area".to_string(),
            ));
        }

        let snapshot: Box<dyn ContentTreeSnapshot> = match self.snapshot {
            Some(snapshot) => snapshot,
            None => {
                let font = match (self.font, self.font_file) {
                    (Some(font), _) => Some(font),
                    (None, Some(path)) => Some(FontFace::from_file(path)?),
                    (None, None) if self.system_font => FontFace::system_default(),
                    (None, None) => None,
                };
                if font.is_none() {
                    log::warn!(
                        "[fieldexport][font] no font available; text renders as placeholder bars"
                    );
                }
                let mut layout = LayoutSnapshot::new(font);
                for href in self.stylesheet_links {
                    layout = layout.with_stylesheet_link(href);
                }
                for css in self.extra_css {
                    layout = layout.with_css(css);
                }
                Box::new(layout)
            }
        };

        let fetcher: Box<dyn AssetFetcher> = match (self.fetcher, self.asset_root) {
            (Some(fetcher), _) => fetcher,
            (None, Some(root)) => Box::new(DirectoryFetcher::new(root)),
            (None, None) => Box::new(NoFetch),
        };

        let debug = if let Some(path) = self.debug_path {
            Some(Arc::new(DebugLogger::new(path)?))
        } else {
            None
        };

        Ok(Exporter {
            geometry,
            scale: self.scale,
            fetcher,
            snapshot,
            reporter: self.reporter.unwrap_or_else(|| Box::new(LogReporter)),
            debug,
            state: Cell::new(ExportState::Idle),
            last_metrics: RefCell::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedSnapshot, png_bytes};
    use base64::Engine;
    use std::rc::{Rc, Weak};

    #[derive(Clone, Default)]
    struct RecordingReporter(Rc<RefCell<Vec<(ExportFormat, &'static str, String)>>>);

    impl ExportReporter for RecordingReporter {
        fn report(&self, format: ExportFormat, error: &ExportError, message: &str) {
            self.0
                .borrow_mut()
                .push((format, error.code(), message.to_string()));
        }
    }

    fn flow_tree(count: usize) -> ContentTree {
        ContentTree::with_sections(
            "Fire Pump Inspection",
            (0..count)
                .map(|i| {
                    ReportSection::new(format!("item-{i}"), i as u32, BreakPolicy::Flow)
                        .with_node(ContentNode::body(format!("Item {i} checked")))
                })
                .collect(),
        )
    }

    fn fixed_exporter(height: Mm) -> Exporter {
        Exporter::builder()
            .snapshot(Box::new(FixedSnapshot::uniform(height)))
            .scale(0.5)
            .build()
            .unwrap()
    }

    fn temp_log_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "fieldexport_{}_{}_{}.jsonl",
            label,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ))
    }

    fn count_token(haystack: &str, needle: &str) -> usize {
        haystack.match_indices(needle).count()
    }

    #[test]
    fn twenty_five_forty_mm_flow_sections_make_four_pages() {
        let exporter = fixed_exporter(Mm::new(40));
        let artifact = exporter
            .export_document(&flow_tree(25), ExportFormat::Pdf, &ExportOptions::new("r", "R"))
            .expect("pdf");
        let report = inspect_pdf_bytes(&artifact.bytes).unwrap();
        assert_eq!(report.page_count, 4);
        let metrics = exporter.last_metrics().unwrap();
        assert_eq!(metrics.page_count(), 4);
        assert_eq!(metrics.total_bytes, artifact.bytes.len());
        assert_eq!(metrics.shrunk_pages(), 0);
        assert_eq!(artifact.file_name, "r.pdf");
        assert_eq!(artifact.mime_type(), "application/pdf");
    }

    #[test]
    fn identical_input_gives_identical_pdf() {
        let exporter = Exporter::builder().system_font(false).scale(1.0).build().unwrap();
        let options = ExportOptions::new("same.pdf", "Same").with_description("Twice");
        let first = exporter
            .export_document(&flow_tree(6), ExportFormat::Pdf, &options)
            .unwrap();
        let second = exporter
            .export_document(&flow_tree(6), ExportFormat::Pdf, &options)
            .unwrap();
        assert_eq!(first.bytes.len(), second.bytes.len());
        assert_eq!(first.bytes, second.bytes);
        let report = inspect_pdf_bytes(&first.bytes).unwrap();
        assert_eq!(report.title.as_deref(), Some("Same"));
        assert_eq!(report.subject.as_deref(), Some("Twice"));
    }

    #[test]
    fn empty_tree_returns_none_and_reports() {
        let reporter = RecordingReporter::default();
        let exporter = Exporter::builder()
            .system_font(false)
            .reporter(Box::new(reporter.clone()))
            .build()
            .unwrap();
        let result = exporter.export_document(
            &ContentTree::new("Nothing"),
            ExportFormat::Html,
            &ExportOptions::new("x", "X"),
        );
        assert!(result.is_none());
        let reports = reporter.0.borrow();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, ExportFormat::Html);
        assert_eq!(reports[0].1, "NO_CONTENT");
        assert_eq!(reports[0].2, "HTML export failed: the report has no sections");
        assert_eq!(exporter.state(), ExportState::Idle);
        assert!(exporter.last_metrics().is_none());
    }

    #[test]
    fn malformed_tree_fails_before_rendering() {
        let exporter = fixed_exporter(Mm::new(10));
        let tree = ContentTree::with_sections(
            "Dup",
            vec![
                ReportSection::new("a", 1, BreakPolicy::Flow),
                ReportSection::new("a", 2, BreakPolicy::Flow),
            ],
        );
        let err = exporter
            .try_export_document(&tree, ExportFormat::Pdf, &ExportOptions::default())
            .unwrap_err();
        assert!(matches!(err, ExportError::Structural(_)));
    }

    #[test]
    fn html_export_with_signature_is_self_contained() {
        let signature_png = encode_data_uri("image/png", &png_bytes(8, 4, [0, 0, 0, 255]));
        let exporter = Exporter::builder()
            .system_font(false)
            .fetcher(Box::new(MemoryFetcher::new().with(
                "photos/riser.png",
                "image/png",
                png_bytes(4, 4, [200, 0, 0, 255]),
            )))
            .build()
            .unwrap();
        let mut tree = flow_tree(2);
        tree.push(
            ReportSection::new("photos", 10, BreakPolicy::AvoidBreak)
                .with_node(ContentNode::image("photos/riser.png", "Riser"))
                .with_node(ContentNode::image("https://elsewhere.example/x.jpg", "Gone")),
        );
        let mut block = SignatureBlock::new(signature_png);
        block.signer_name = Some("R. Okafor".to_string());
        let options = ExportOptions::new("", "Riser Check").with_signature(block);

        let artifact = exporter
            .export_document(&tree, ExportFormat::Html, &options)
            .unwrap();
        let html = String::from_utf8(artifact.bytes).unwrap();
        assert_eq!(artifact.file_name, "Riser_Check.html");
        assert!(html.contains("data-section-id=\"signature\""));
        assert!(html.contains("Signed by R. Okafor"));
        assert!(!html.contains("elsewhere.example"));
        assert!(!html.contains("photos/riser.png"));
        assert_eq!(count_token(&html, "<style"), 1);
        let metrics = exporter.last_metrics().unwrap();
        assert_eq!(metrics.asset_failures.len(), 1);
        assert_eq!(metrics.asset_failures[0].section_id, SectionId::new("photos"));
    }

    #[test]
    fn html_export_never_captures_files_outside_the_asset_root() {
        let base = temp_log_path("asset_root").with_extension("");
        let root = base.join("site");
        std::fs::create_dir_all(&root).unwrap();
        let secret = png_bytes(3, 3, [10, 20, 30, 255]);
        std::fs::write(base.join("private.png"), &secret).unwrap();
        std::fs::write(root.join("riser.png"), png_bytes(2, 2, [0, 200, 0, 255])).unwrap();
        let exporter = Exporter::builder()
            .system_font(false)
            .asset_root(&root)
            .build()
            .unwrap();
        let outside = base.join("private.png");
        let tree = ContentTree::with_sections(
            "Riser",
            vec![
                ReportSection::new("photos", 1, BreakPolicy::Flow)
                    .with_node(ContentNode::image(outside.display().to_string(), "Private"))
                    .with_node(ContentNode::image("/etc/passwd", "System"))
                    .with_node(ContentNode::image("riser.png", "Riser")),
            ],
        );

        let artifact = exporter
            .export_document(&tree, ExportFormat::Html, &ExportOptions::new("r", "R"))
            .unwrap();
        let html = String::from_utf8(artifact.bytes).unwrap();
        let leaked = base64::engine::general_purpose::STANDARD.encode(&secret);
        assert!(!html.contains(&leaked));
        assert!(!html.contains("private.png"));
        assert!(!html.contains("/etc/passwd"));
        assert_eq!(count_token(&html, "src=\"data:image/png;base64,"), 1);
        let metrics = exporter.last_metrics().unwrap();
        assert_eq!(metrics.asset_failures.len(), 2);
    }

    #[test]
    fn signature_is_the_last_section_of_the_pdf() {
        let exporter = Exporter::builder()
            .snapshot(Box::new(
                FixedSnapshot::uniform(Mm::new(100)).with_height(SIGNATURE_SECTION_ID, Mm::new(60)),
            ))
            .scale(0.5)
            .build()
            .unwrap();
        let options = ExportOptions::new("signed.pdf", "Signed")
            .with_signature(SignatureBlock::new("data:image/png;base64,AAAA"));
        let artifact = exporter
            .export_document(&flow_tree(2), ExportFormat::Pdf, &options)
            .unwrap();
        assert_eq!(inspect_pdf_bytes(&artifact.bytes).unwrap().page_count, 1);
        let metrics = exporter.last_metrics().unwrap();
        assert_eq!(metrics.pages[0].slice_count, 3);

        // A reserved id in the caller's tree cannot be silently shadowed.
        let mut clash = flow_tree(1);
        clash.push(ReportSection::new(SIGNATURE_SECTION_ID, 5, BreakPolicy::Flow));
        assert!(matches!(
            exporter.try_export_document(&clash, ExportFormat::Pdf, &options),
            Err(ExportError::Structural(_))
        ));
    }

    #[test]
    fn docx_is_a_word_tagged_web_snapshot() {
        let exporter = Exporter::builder().system_font(false).build().unwrap();
        let artifact = exporter
            .export_document(&flow_tree(1), ExportFormat::Docx, &ExportOptions::new("w.docx", "W"))
            .unwrap();
        assert_eq!(artifact.file_name, "w.docx");
        assert_eq!(artifact.mime_type(), "application/vnd.ms-word");
        assert!(artifact.bytes.starts_with(b"MIME-Version: 1.0\r\n"));
    }

    struct ReentrantFetcher {
        exporter: Rc<RefCell<Weak<Exporter>>>,
        nested: Rc<RefCell<Vec<Option<ExportError>>>>,
    }

    impl AssetFetcher for ReentrantFetcher {
        fn fetch(&self, source: &str, _kind: AssetKind) -> Result<Asset, ExportError> {
            if let Some(exporter) = self.exporter.borrow().upgrade() {
                let nested = exporter.try_export_document(
                    &flow_tree(1),
                    ExportFormat::Html,
                    &ExportOptions::default(),
                );
                self.nested.borrow_mut().push(nested.err());
            }
            Err(ExportError::Asset(format!("unreachable asset: {}", source)))
        }
    }

    #[test]
    fn export_while_busy_is_rejected() {
        let slot: Rc<RefCell<Weak<Exporter>>> = Rc::new(RefCell::new(Weak::new()));
        let nested = Rc::new(RefCell::new(Vec::new()));
        let exporter = Rc::new(
            Exporter::builder()
                .system_font(false)
                .fetcher(Box::new(ReentrantFetcher {
                    exporter: Rc::clone(&slot),
                    nested: Rc::clone(&nested),
                }))
                .build()
                .unwrap(),
        );
        *slot.borrow_mut() = Rc::downgrade(&exporter);

        let mut tree = flow_tree(1);
        tree.push(
            ReportSection::new("photo", 9, BreakPolicy::AvoidBreak)
                .with_node(ContentNode::image("remote.png", "Remote")),
        );
        let outer = exporter.export_document(&tree, ExportFormat::Html, &ExportOptions::new("o", "O"));
        assert!(outer.is_some());
        let nested = nested.borrow();
        assert!(!nested.is_empty());
        assert!(nested.iter().all(|err| matches!(err, Some(ExportError::Busy))));
        assert_eq!(exporter.state(), ExportState::Idle);
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        assert!(matches!(
            Exporter::builder().scale(5.0).build(),
            Err(ExportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Exporter::builder().scale(0.0).build(),
            Err(ExportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Exporter::builder().margin_all(Mm::new(105)).build(),
            Err(ExportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn file_names_get_the_format_extension() {
        assert_eq!(artifact_file_name("report", "", ExportFormat::Pdf), "report.pdf");
        assert_eq!(artifact_file_name("report.PDF", "", ExportFormat::Pdf), "report.PDF");
        assert_eq!(artifact_file_name("  ", "Site 4 / North", ExportFormat::Html), "Site_4___North.html");
        assert_eq!(artifact_file_name("", "///", ExportFormat::Docx), "report.docx");
    }

    #[test]
    fn debug_log_records_page_breaks_and_summary() {
        let path = temp_log_path("export_debug");
        let exporter = Exporter::builder()
            .snapshot(Box::new(FixedSnapshot::uniform(Mm::new(40))))
            .scale(0.25)
            .debug_log(&path)
            .build()
            .unwrap();
        exporter
            .export_document(&flow_tree(25), ExportFormat::Pdf, &ExportOptions::new("d", "D"))
            .unwrap();
        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(count_token(&log, "\"type\":\"export.page_raster\""), 4);
        assert!(count_token(&log, "\"type\":\"export.page_break\"") >= 3);
        assert_eq!(count_token(&log, "\"type\":\"export.plan\""), 1);
        assert_eq!(count_token(&log, "\"type\":\"export.summary\""), 1);
    }
}
