//! Document normalization: uploaded bytes → canonical markdown-ish text.
//!
//! A [`NormalizerRegistry`] maps lower-cased file extensions to
//! [`Normalizer`] implementations. Built-ins:
//!
//! | Normalizer | Extensions | Output |
//! |------------|------------|--------|
//! | `text` | `txt`, `md`, `markdown`, `csv`, `log` | UTF-8, BOM stripped, LF line endings |
//! | `html` | `html`, `htm` | `#` headings, `- ` list items, blank-line paragraphs |
//! | `pdf` | `pdf` | extracted text |
//! | `docx` | `docx` | headings from `HeadingN`/`Title` styles, `- ` for numbered paragraphs |
//! | `pptx` | `pptx` | one `## Slide N` section per slide |
//! | `xlsx` | `xlsx` | one `## Sheet N` section per sheet, cells joined by ` \| ` |
//!
//! Normalizers never panic on bad input. The PDF parser is known to panic
//! on some malformed files, so it runs under `catch_unwind`.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scraper::{ElementRef, Html, Node};

use oraculum_core::models::Document;
use oraculum_core::{RagError, RagResult};

pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_CSV: &str = "text/csv";
pub const MIME_HTML: &str = "text/html";
pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_ZIP_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;

/// Converts one family of file formats to text.
pub trait Normalizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `(extension, content type)` pairs this normalizer claims.
    /// Extensions are lower-case and without the dot.
    fn formats(&self) -> &'static [(&'static str, &'static str)];

    fn convert(&self, bytes: &[u8]) -> Result<String>;
}

struct Registration {
    content_type: &'static str,
    normalizer: Arc<dyn Normalizer>,
}

/// Extension-keyed dispatch table of normalizers.
pub struct NormalizerRegistry {
    by_extension: HashMap<&'static str, Registration>,
}

impl NormalizerRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// Registry with every built-in normalizer.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TextNormalizer));
        registry.register(Arc::new(HtmlNormalizer));
        registry.register(Arc::new(PdfNormalizer));
        registry.register(Arc::new(DocxNormalizer));
        registry.register(Arc::new(PptxNormalizer));
        registry.register(Arc::new(XlsxNormalizer));
        registry
    }

    /// Register a normalizer. Later registrations win for shared extensions.
    pub fn register(&mut self, normalizer: Arc<dyn Normalizer>) {
        for &(ext, content_type) in normalizer.formats() {
            self.by_extension.insert(
                ext,
                Registration {
                    content_type,
                    normalizer: Arc::clone(&normalizer),
                },
            );
        }
    }

    pub fn supports(&self, file_name: &str) -> bool {
        extension_of(file_name)
            .map(|ext| self.by_extension.contains_key(ext.as_str()))
            .unwrap_or(false)
    }

    /// Sorted list of supported extensions.
    pub fn extensions(&self) -> Vec<&'static str> {
        let mut exts: Vec<&'static str> = self.by_extension.keys().copied().collect();
        exts.sort_unstable();
        exts
    }

    /// Convert `bytes` into a [`Document`] whose source is `file_name`.
    ///
    /// `file_name` may carry directories (`guias/catedral.md`); it is kept
    /// as-is for attribution, with `\` separators turned into `/`.
    ///
    /// The buffer is consumed and released before this returns, on every path.
    ///
    /// # Errors
    ///
    /// - [`RagError::UnsupportedFormat`] if no normalizer claims the extension.
    /// - [`RagError::Conversion`] if the content is malformed or yields no text.
    pub fn normalize(&self, bytes: Vec<u8>, file_name: &str) -> RagResult<Document> {
        let source = source_name(file_name);
        let ext = extension_of(&source)
            .ok_or_else(|| RagError::UnsupportedFormat(format!("{} has no extension", source)))?;
        let registration = self
            .by_extension
            .get(ext.as_str())
            .ok_or_else(|| RagError::UnsupportedFormat(format!(".{}", ext)))?;

        let converted = registration.normalizer.convert(&bytes);
        drop(bytes);

        let text = converted.map_err(|e| {
            RagError::Conversion(format!(
                "{} ({}): {:#}",
                source,
                registration.normalizer.name(),
                e
            ))
        })?;
        if text.trim().is_empty() {
            return Err(RagError::Conversion(format!(
                "{} produced no text",
                source
            )));
        }

        Ok(Document::new(&source, registration.content_type, text))
    }
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Normalize with the built-in registry.
pub fn normalize(bytes: Vec<u8>, file_name: &str) -> RagResult<Document> {
    NormalizerRegistry::with_builtins().normalize(bytes, file_name)
}

fn source_name(file_name: &str) -> String {
    file_name.trim().trim_start_matches("./").replace('\\', "/")
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| !e.is_empty())
}

// ============ text ============

pub struct TextNormalizer;

impl Normalizer for TextNormalizer {
    fn name(&self) -> &'static str {
        "text"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("txt", MIME_TEXT),
            ("md", MIME_MARKDOWN),
            ("markdown", MIME_MARKDOWN),
            ("csv", MIME_CSV),
            ("log", MIME_TEXT),
        ]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(bytes).context("invalid UTF-8")?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Ok(text.replace("\r\n", "\n").replace('\r', "\n"))
    }
}

// ============ html ============

pub struct HtmlNormalizer;

impl Normalizer for HtmlNormalizer {
    fn name(&self) -> &'static str {
        "html"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[("html", MIME_HTML), ("htm", MIME_HTML)]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let html = std::str::from_utf8(bytes).context("invalid UTF-8")?;
        let document = Html::parse_document(html);
        let mut blocks = Vec::new();
        let mut inline = String::new();
        html_blocks(document.root_element(), &mut blocks, &mut inline);
        flush_inline(&mut blocks, &mut inline);
        Ok(blocks.join("\n\n"))
    }
}

fn html_blocks(element: ElementRef<'_>, blocks: &mut Vec<String>, inline: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                inline.push_str(text);
            }
            Node::Element(_) => {
                let Some(el) = ElementRef::wrap(child) else {
                    continue;
                };
                let tag = el.value().name();
                match tag {
                    "script" | "style" | "head" | "noscript" | "template" => {}
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        flush_inline(blocks, inline);
                        let level = tag[1..].parse::<usize>().unwrap_or(1);
                        let text = collapse_ws(&el.text().collect::<Vec<_>>().join(" "));
                        if !text.is_empty() {
                            blocks.push(format!("{} {}", "#".repeat(level), text));
                        }
                    }
                    "li" => {
                        flush_inline(blocks, inline);
                        let text = collapse_ws(&el.text().collect::<Vec<_>>().join(" "));
                        if !text.is_empty() {
                            blocks.push(format!("- {}", text));
                        }
                    }
                    "p" | "div" | "section" | "article" | "main" | "header" | "footer"
                    | "blockquote" | "pre" | "table" | "tr" | "ul" | "ol" | "br" | "body" => {
                        flush_inline(blocks, inline);
                        html_blocks(el, blocks, inline);
                        flush_inline(blocks, inline);
                    }
                    _ => html_blocks(el, blocks, inline),
                }
            }
            _ => {}
        }
    }
}

fn flush_inline(blocks: &mut Vec<String>, inline: &mut String) {
    let text = collapse_ws(inline);
    if !text.is_empty() {
        blocks.push(text);
    }
    inline.clear();
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============ pdf ============

pub struct PdfNormalizer;

impl Normalizer for PdfNormalizer {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[("pdf", MIME_PDF)]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            pdf_extract::extract_text_from_mem(bytes)
        }));
        match result {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(anyhow!("PDF extraction failed: {}", e)),
            Err(_) => Err(anyhow!("PDF parser panicked on malformed input")),
        }
    }
}

// ============ OOXML shared helpers ============

type ZipReader<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>> {
    zip::ZipArchive::new(Cursor::new(bytes)).context("not a valid ZIP container")
}

fn read_zip_entry_bounded(archive: &mut ZipReader<'_>, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .with_context(|| format!("{} not found", name))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ZIP_ENTRY_BYTES)
        .read_to_end(&mut out)
        .with_context(|| format!("failed to read {}", name))?;
    if out.len() as u64 >= MAX_ZIP_ENTRY_BYTES {
        bail!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name,
            MAX_ZIP_ENTRY_BYTES
        );
    }
    Ok(out)
}

/// Entries named `{prefix}{N}.xml`, ordered by `N`.
fn numbered_entries(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

// ============ docx ============

pub struct DocxNormalizer;

impl Normalizer for DocxNormalizer {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[("docx", MIME_DOCX)]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = open_zip(bytes)?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
        docx_paragraphs(&xml)
    }
}

#[derive(Default)]
struct DocxParagraph {
    text: String,
    style: Option<String>,
    numbered: bool,
}

impl DocxParagraph {
    fn render(&self) -> Option<String> {
        let text = self.text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(level) = self.style.as_deref().and_then(heading_level) {
            return Some(format!("{} {}", "#".repeat(level), text));
        }
        if self.numbered {
            return Some(format!("- {}", text));
        }
        Some(text.to_string())
    }
}

/// `Title` → 1, `HeadingN` → N (clamped to 6).
fn heading_level(style: &str) -> Option<usize> {
    if style.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let lower = style.to_ascii_lowercase();
    let digits = lower.strip_prefix("heading")?;
    digits.trim().parse::<usize>().ok().map(|n| n.clamp(1, 6))
}

fn docx_paragraphs(xml: &[u8]) -> Result<String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out: Vec<String> = Vec::new();
    let mut para: Option<DocxParagraph> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => para = Some(DocxParagraph::default()),
                b"t" => in_text = true,
                b"pStyle" => set_docx_style(&mut para, &e),
                b"numPr" => {
                    if let Some(p) = para.as_mut() {
                        p.numbered = true;
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"pStyle" => set_docx_style(&mut para, &e),
                b"numPr" => {
                    if let Some(p) = para.as_mut() {
                        p.numbered = true;
                    }
                }
                b"tab" => {
                    if let Some(p) = para.as_mut() {
                        p.text.push(' ');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(p) = para.as_mut() {
                    p.text.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(rendered) = para.take().and_then(|p| p.render()) {
                        out.push(rendered);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("malformed word/document.xml: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.join("\n\n"))
}

fn set_docx_style(para: &mut Option<DocxParagraph>, e: &BytesStart<'_>) {
    if let Some(p) = para.as_mut() {
        p.style = attr_value(e, b"val");
    }
}

// ============ pptx ============

pub struct PptxNormalizer;

impl Normalizer for PptxNormalizer {
    fn name(&self) -> &'static str {
        "pptx"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[("pptx", MIME_PPTX)]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = open_zip(bytes)?;
        let slides = numbered_entries(&archive, "ppt/slides/slide");
        let mut sections = Vec::new();
        for (i, name) in slides.iter().enumerate() {
            let xml = read_zip_entry_bounded(&mut archive, name)?;
            let lines = drawing_paragraphs(&xml).with_context(|| format!("malformed {}", name))?;
            if lines.is_empty() {
                continue;
            }
            sections.push(format!("## Slide {}\n\n{}", i + 1, lines.join("\n")));
        }
        Ok(sections.join("\n\n"))
    }
}

/// Text of each `a:p` paragraph in a DrawingML part.
fn drawing_paragraphs(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = current.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(lines)
}

// ============ xlsx ============

pub struct XlsxNormalizer;

impl Normalizer for XlsxNormalizer {
    fn name(&self) -> &'static str {
        "xlsx"
    }

    fn formats(&self) -> &'static [(&'static str, &'static str)] {
        &[("xlsx", MIME_XLSX)]
    }

    fn convert(&self, bytes: &[u8]) -> Result<String> {
        let mut archive = open_zip(bytes)?;
        let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
            let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
            shared_strings(&xml)?
        } else {
            Vec::new()
        };
        let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
        let mut sections = Vec::new();
        for (i, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
            let xml = read_zip_entry_bounded(&mut archive, name)?;
            let rows = sheet_rows(&xml, &shared).with_context(|| format!("malformed {}", name))?;
            if rows.is_empty() {
                continue;
            }
            sections.push(format!("## Sheet {}\n\n{}", i + 1, rows.join("\n")));
        }
        Ok(sections.join("\n\n"))
    }
}

/// One string per `si` item; rich-text runs are concatenated.
fn shared_strings(xml: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => bail!("malformed xl/sharedStrings.xml: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Plain,
}

fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<Vec<String>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_kind = CellKind::Plain;
    let mut in_value = false;
    let mut cell_count = 0usize;
    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_kind = match attr_value(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Plain,
                    };
                }
                b"v" => in_value = true,
                b"t" if cell_kind == CellKind::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                let cell = match cell_kind {
                    CellKind::Shared => value
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i))
                        .cloned(),
                    _ => Some(value.to_string()),
                };
                if let Some(cell) = cell.filter(|c| !c.is_empty()) {
                    row.push(cell);
                    cell_count += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_kind = CellKind::Plain,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_text_strips_bom_and_crlf() {
        let doc = normalize(b"\xEF\xBB\xBFola\r\nmundo".to_vec(), "notas.TXT").unwrap();
        assert_eq!(doc.text, "ola\nmundo");
        assert_eq!(doc.source, "notas.TXT");
        assert_eq!(doc.content_type, MIME_TEXT);
    }

    #[test]
    fn test_source_keeps_relative_path() {
        let doc = normalize(b"# Guia".to_vec(), "./uploads\\guia.md").unwrap();
        assert_eq!(doc.source, "uploads/guia.md");
        assert_eq!(doc.content_type, MIME_MARKDOWN);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = normalize(b"x".to_vec(), "foto.png").unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
        let err = normalize(b"x".to_vec(), "README").unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_invalid_utf8_is_conversion_error() {
        let err = normalize(vec![0xff, 0xfe, 0xfd], "a.txt").unwrap_err();
        assert!(matches!(err, RagError::Conversion(_)));
    }

    #[test]
    fn test_empty_text_is_conversion_error() {
        let err = normalize(b"  \n\n ".to_vec(), "vazio.md").unwrap_err();
        assert!(matches!(err, RagError::Conversion(_)));
    }

    #[test]
    fn test_invalid_pdf_is_conversion_error() {
        let err = normalize(b"not a pdf".to_vec(), "a.pdf").unwrap_err();
        assert!(matches!(err, RagError::Conversion(_)));
    }

    #[test]
    fn test_invalid_zip_is_conversion_error() {
        for name in ["a.docx", "a.pptx", "a.xlsx"] {
            let err = normalize(b"not a zip".to_vec(), name).unwrap_err();
            assert!(matches!(err, RagError::Conversion(_)), "{}", name);
        }
    }

    #[test]
    fn test_html_structure() {
        let html = r#"<html><head><title>t</title><style>p{}</style></head>
            <body><h2>Catedral</h2><p>Projetada por <b>Niemeyer</b>.</p>
            <ul><li>Missa</li><li>Visita</li></ul><script>alert(1)</script></body></html>"#;
        let doc = normalize(html.as_bytes().to_vec(), "guia.html").unwrap();
        assert_eq!(
            doc.text,
            "## Catedral\n\nProjetada por Niemeyer.\n\n- Missa\n\n- Visita"
        );
    }

    #[test]
    fn test_docx_headings_and_lists() {
        let xml = r#"<w:document xmlns:w="w"><w:body>
            <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Brasília</w:t></w:r></w:p>
            <w:p><w:r><w:t xml:space="preserve">Capital </w:t></w:r><w:r><w:t>federal.</w:t></w:r></w:p>
            <w:p><w:pPr><w:numPr><w:ilvl w:val="0"/></w:numPr></w:pPr><w:r><w:t>Eixo Monumental</w:t></w:r></w:p>
            </w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let doc = normalize(bytes, "guia.docx").unwrap();
        assert_eq!(doc.text, "# Brasília\n\nCapital federal.\n\n- Eixo Monumental");
    }

    #[test]
    fn test_pptx_slides_in_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#,
                t
            )
        };
        let s1 = slide("Abertura");
        let s2 = slide("Roteiro");
        let s10 = slide("Fim");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", &s10),
            ("ppt/slides/slide2.xml", &s2),
            ("ppt/slides/slide1.xml", &s1),
        ]);
        let doc = normalize(bytes, "deck.pptx").unwrap();
        assert_eq!(
            doc.text,
            "## Slide 1\n\nAbertura\n\n## Slide 2\n\nRoteiro\n\n## Slide 3\n\nFim"
        );
    }

    #[test]
    fn test_xlsx_rows() {
        let shared = r#"<sst><si><t>Local</t></si><si><t>Horário</t></si><si><r><t>Torre </t></r><r><t>de TV</t></r></si></sst>"#;
        let sheet = r#"<worksheet><sheetData>
            <row><c t="s"><v>0</v></c><c t="s"><v>1</v></c></row>
            <row><c t="s"><v>2</v></c><c><v>9</v></c></row>
            </sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let doc = normalize(bytes, "horarios.xlsx").unwrap();
        assert_eq!(doc.text, "## Sheet 1\n\nLocal | Horário\nTorre de TV | 9");
    }

    #[test]
    fn test_custom_normalizer_registration() {
        struct Shout;
        impl Normalizer for Shout {
            fn name(&self) -> &'static str {
                "shout"
            }
            fn formats(&self) -> &'static [(&'static str, &'static str)] {
                &[("txt", "text/shout")]
            }
            fn convert(&self, bytes: &[u8]) -> Result<String> {
                Ok(String::from_utf8_lossy(bytes).to_uppercase())
            }
        }
        let mut registry = NormalizerRegistry::with_builtins();
        registry.register(Arc::new(Shout));
        let doc = registry.normalize(b"oi".to_vec(), "a.txt").unwrap();
        assert_eq!(doc.text, "OI");
        assert_eq!(doc.content_type, "text/shout");
        assert!(registry.supports("b.PDF"));
        assert!(registry.extensions().contains(&"xlsx"));
    }
}
