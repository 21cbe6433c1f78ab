use crate::assets::{AssetFetcher, AssetKind, fetch_asset};
use crate::content::{BreakPolicy, ContentTree, SectionId};
use crate::error::ExportError;
use crate::layout::{escape_html_attr, escape_html_text};
use crate::snapshot::{AssetFailure, ContentTreeSnapshot, StyleSource};
use crate::types::{Margins, Mm, PageGeometry, Size};
use kuchiki::traits::TendrilSink;
use kuchiki::NodeRef;

const STYLE_SLOT_ID: &str = "fieldexport-style";
const DOCUMENT_OWNER: &str = "document";

#[derive(Debug, Clone)]
pub struct HtmlOptions {
    pub title: String,
    pub description: Option<String>,
    pub geometry: PageGeometry,
}

#[derive(Debug, Clone)]
pub struct HtmlOutput {
    pub html: String,
    pub asset_failures: Vec<AssetFailure>,
}

/// Builds one self-contained HTML document from the snapshot: every image and
/// stylesheet reference is resolved through `assets` and inlined, and all CSS
/// ends up in a single `<style>` element in the head.
pub fn serialize_html(
    tree: &ContentTree,
    snapshot: &dyn ContentTreeSnapshot,
    assets: &dyn AssetFetcher,
    options: &HtmlOptions,
) -> Result<HtmlOutput, ExportError> {
    tree.validate()?;
    let mut failures: Vec<AssetFailure> = Vec::new();
    let document_owner = SectionId::new(DOCUMENT_OWNER);

    let mut css_parts: Vec<String> = Vec::new();
    for source in snapshot.stylesheets() {
        match source {
            StyleSource::Inline(css) => css_parts.push(css),
            StyleSource::Linked(href) => {
                if let Some(css) = fetch_stylesheet(assets, &href, &document_owner, &mut failures) {
                    css_parts.push(css);
                }
            }
        }
    }

    let document = kuchiki::parse_html().one(assemble_skeleton(tree, snapshot, options));

    // Styles carried inside section markup join the merged sheet in
    // document order.
    let links: Vec<NodeRef> = document
        .select("link[href]")
        .map(|found| found.map(|el| el.as_node().clone()).collect())
        .unwrap_or_default();
    for link in links {
        let (rel, href) = {
            let Some(el) = link.as_element() else {
                continue;
            };
            let attrs = el.attributes.borrow();
            (
                attrs.get("rel").unwrap_or("").to_ascii_lowercase(),
                attrs.get("href").unwrap_or("").to_string(),
            )
        };
        if rel.split_whitespace().any(|token| token == "stylesheet") {
            let owner = owning_section(&link).unwrap_or_else(|| document_owner.clone());
            if let Some(css) = fetch_stylesheet(assets, &href, &owner, &mut failures) {
                css_parts.push(css);
            }
        }
        link.detach();
    }

    let styles: Vec<NodeRef> = document
        .select("style")
        .map(|found| found.map(|el| el.as_node().clone()).collect())
        .unwrap_or_default();
    for style in styles {
        if is_style_slot(&style) {
            continue;
        }
        css_parts.push(style.text_contents());
        style.detach();
    }

    let scripts: Vec<NodeRef> = document
        .select("script[src]")
        .map(|found| found.map(|el| el.as_node().clone()).collect())
        .unwrap_or_default();
    for script in scripts {
        script.detach();
    }

    let images: Vec<NodeRef> = document
        .select("img")
        .map(|found| found.map(|el| el.as_node().clone()).collect())
        .unwrap_or_default();
    for img in images {
        let Some(el) = img.as_element() else {
            continue;
        };
        let src = {
            let mut attrs = el.attributes.borrow_mut();
            attrs.remove("srcset");
            attrs.get("src").map(str::to_string)
        };
        let Some(src) = src.filter(|s| !s.trim().is_empty()) else {
            img.detach();
            continue;
        };
        if src.starts_with("data:") {
            continue;
        }
        match fetch_asset(assets, &src, AssetKind::Image) {
            Ok(asset) => {
                el.attributes.borrow_mut().insert("src", asset.to_data_uri());
            }
            Err(err) => {
                let owner = owning_section(&img).unwrap_or_else(|| document_owner.clone());
                record_failure(&mut failures, owner, &src, &err);
                // The broken image is dropped, never left pointing elsewhere.
                img.detach();
            }
        }
    }

    let inline_styled: Vec<NodeRef> = document
        .select("[style]")
        .map(|found| found.map(|el| el.as_node().clone()).collect())
        .unwrap_or_default();
    for node in inline_styled {
        let Some(el) = node.as_element() else {
            continue;
        };
        let declared = el.attributes.borrow().get("style").map(str::to_string);
        let Some(declared) = declared.filter(|value| value.to_ascii_lowercase().contains("url(")) else {
            continue;
        };
        let owner = owning_section(&node).unwrap_or_else(|| document_owner.clone());
        let inlined = inline_css_urls(&declared, assets, &owner, &mut failures);
        el.attributes.borrow_mut().insert("style", inlined);
    }

    let mut merged = String::new();
    for part in css_parts {
        merged.push_str(&inline_css_urls(&part, assets, &document_owner, &mut failures));
        merged.push('\n');
    }
    merged.push_str(&break_rules());
    merged.push_str(&page_rule(&options.geometry));

    if let Ok(mut slots) = document.select(&format!("style#{STYLE_SLOT_ID}")) {
        if let Some(slot) = slots.next() {
            let node = slot.as_node();
            node.append(NodeRef::new_text(merged));
            if let Some(el) = node.as_element() {
                el.attributes.borrow_mut().remove("id");
            }
        }
    }

    for failure in &failures {
        log::warn!(
            "[fieldexport][html] section {}: dropped {} ({})",
            failure.section_id,
            failure.source,
            failure.reason
        );
    }

    let mut html = document.to_string();
    if !html.trim_start().to_ascii_lowercase().starts_with("<!doctype") {
        html.insert_str(0, "<!DOCTYPE html>");
    }
    Ok(HtmlOutput {
        html,
        asset_failures: failures,
    })
}

fn assemble_skeleton(
    tree: &ContentTree,
    snapshot: &dyn ContentTreeSnapshot,
    options: &HtmlOptions,
) -> String {
    let mut out = String::from("<!DOCTYPE html><html><head><meta charset=\"utf-8\">");
    out.push_str(&format!(
        "<title>{}</title><style id=\"{}\"></style></head><body><header class=\"report-header\"><h1 class=\"report-title\">{}</h1>",
        escape_html_text(&options.title),
        STYLE_SLOT_ID,
        escape_html_text(&options.title)
    ));
    if let Some(description) = options.description.as_deref().filter(|d| !d.trim().is_empty()) {
        out.push_str(&format!(
            "<p class=\"report-description\">{}</p>",
            escape_html_text(description)
        ));
    }
    out.push_str("</header><main>");
    for section in tree.sections() {
        out.push_str(&format!(
            "<section class=\"report-section\" id=\"section-{}\" data-section-id=\"{}\" data-break=\"{}\">",
            escape_html_attr(section.id.as_str()),
            escape_html_attr(section.id.as_str()),
            section.break_policy.as_str()
        ));
        out.push_str(&snapshot.markup(section));
        out.push_str("</section>");
    }
    out.push_str("</main></body></html>");
    out
}

fn is_style_slot(node: &NodeRef) -> bool {
    node.as_element()
        .map(|el| el.attributes.borrow().get("id") == Some(STYLE_SLOT_ID))
        .unwrap_or(false)
}

fn owning_section(node: &NodeRef) -> Option<SectionId> {
    node.ancestors().find_map(|ancestor| {
        let el = ancestor.as_element()?;
        let attrs = el.attributes.borrow();
        attrs.get("data-section-id").map(SectionId::new)
    })
}

fn record_failure(
    failures: &mut Vec<AssetFailure>,
    owner: SectionId,
    source: &str,
    err: &ExportError,
) {
    failures.push(AssetFailure {
        section_id: owner,
        source: source.to_string(),
        reason: err.to_string(),
    });
}

fn fetch_stylesheet(
    assets: &dyn AssetFetcher,
    href: &str,
    owner: &SectionId,
    failures: &mut Vec<AssetFailure>,
) -> Option<String> {
    match fetch_asset(assets, href, AssetKind::Css) {
        Ok(asset) => Some(asset.text()),
        Err(err) => {
            record_failure(failures, owner.clone(), href, &err);
            None
        }
    }
}

fn kind_for_url(target: &str) -> AssetKind {
    let path = target.split(['?', '#']).next().unwrap_or(target);
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "ttf" | "otf" | "woff" | "woff2" => AssetKind::Font,
        "css" => AssetKind::Css,
        _ => AssetKind::Image,
    }
}

// `@import "x.css"` carries its target without `url(`; normalize it so the
// url pass below sees every reference.
fn normalize_imports(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(pos) = rest.find("@import") {
        let head_end = pos + "@import".len();
        out.push_str(&rest[..head_end]);
        let after = &rest[head_end..];
        let trimmed = after.trim_start();
        let skipped = after.len() - trimmed.len();
        let quote = trimmed.chars().next().filter(|c| *c == '"' || *c == '\'');
        let Some(quote) = quote else {
            rest = after;
            continue;
        };
        let Some(close) = trimmed[1..].find(quote) else {
            rest = after;
            continue;
        };
        out.push_str(&after[..skipped]);
        out.push_str(&format!("url(\"{}\")", &trimmed[1..1 + close]));
        rest = &trimmed[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Replaces every `url(...)` reference with a `data:` URI. References that
/// cannot be fetched become `none`.
pub fn inline_css_urls(
    css: &str,
    assets: &dyn AssetFetcher,
    owner: &SectionId,
    failures: &mut Vec<AssetFailure>,
) -> String {
    let css = normalize_imports(css);
    let mut out = String::with_capacity(css.len());
    let mut rest = css.as_str();
    loop {
        let Some(pos) = rest.to_ascii_lowercase().find("url(") else {
            break;
        };
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 4..];
        let Some(close) = after.find(')') else {
            out.push_str(&rest[pos..]);
            rest = "";
            break;
        };
        let target = after[..close]
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        if target.is_empty() || target.starts_with('#') || target.starts_with("data:") {
            out.push_str(&rest[pos..pos + 4 + close + 1]);
        } else {
            match fetch_asset(assets, target, kind_for_url(target)) {
                Ok(asset) => {
                    out.push_str("url(\"");
                    out.push_str(&asset.to_data_uri());
                    out.push_str("\")");
                }
                Err(err) => {
                    record_failure(failures, owner.clone(), target, &err);
                    out.push_str("none");
                }
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

fn break_rules() -> String {
    format!(
        "section[data-break=\"{}\"] {{ break-inside: avoid; page-break-inside: avoid; }}\n\
         section[data-break=\"{}\"] {{ break-before: page; page-break-before: always; break-inside: avoid; page-break-inside: avoid; }}\n\
         section[data-break=\"{}\"]:first-of-type {{ break-before: auto; page-break-before: auto; }}\n",
        BreakPolicy::AvoidBreak.as_str(),
        BreakPolicy::ForcePageBreak.as_str(),
        BreakPolicy::ForcePageBreak.as_str(),
    )
}

fn page_rule(geometry: &PageGeometry) -> String {
    let size = if geometry.size == Size::a4() {
        "A4".to_string()
    } else if geometry.size == Size::letter() {
        "letter".to_string()
    } else {
        format!("{} {}", css_mm(geometry.size.width), css_mm(geometry.size.height))
    };
    format!("@page {{ size: {}; margin: {}; }}\n", size, css_margins(&geometry.margins))
}

fn css_margins(margins: &Margins) -> String {
    if margins.top == margins.right && margins.top == margins.bottom && margins.top == margins.left {
        return css_mm(margins.top);
    }
    format!(
        "{} {} {} {}",
        css_mm(margins.top),
        css_mm(margins.right),
        css_mm(margins.bottom),
        css_mm(margins.left)
    )
}

fn css_mm(value: Mm) -> String {
    let um = value.to_um();
    if um % 1000 == 0 {
        format!("{}mm", um / 1000)
    } else {
        format!("{}mm", value.to_f32())
    }
}
