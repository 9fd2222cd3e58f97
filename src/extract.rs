//! Multi-format text extraction for the watched knowledge directory.
//!
//! Extraction is dispatched by file extension through an [`ExtractorSet`].
//! Each [`Extractor`] turns one file into one or more text units (a whole
//! text file, one PDF page, one CSV row, one spreadsheet sheet). Failures are
//! per file: the pipeline logs them and moves on to the next path.

use std::collections::HashMap;
use std::io::Read;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::KbError;
use crate::models::ExtractedDocument;

/// Maximum sheets to process in a workbook.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const FORM_FEED: char = '\u{c}';

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    UnsupportedExtension(String),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("CSV extraction failed: {0}")]
    Csv(String),
    #[error("legacy binary .xls workbooks are not supported; save as .xlsx")]
    LegacySpreadsheet,
    #[error("extractor panicked: {0}")]
    Panicked(String),
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One extracted unit of text and its optional page/sheet locator (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedUnit {
    pub text: String,
    pub page: Option<u32>,
}

impl ExtractedUnit {
    fn whole(text: String) -> Self {
        Self { text, page: None }
    }
}

/// Format-specific text extraction capability.
pub trait Extractor: Send + Sync {
    /// Lowercase extensions (without the dot) this extractor handles.
    fn extensions(&self) -> &[&'static str];

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError>;
}

/// Registry mapping file extensions to extractors.
#[derive(Clone, Default)]
pub struct ExtractorSet {
    by_extension: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with extractors for every supported format.
    pub fn with_builtins() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(TextExtractor));
        set.register(Arc::new(MarkdownExtractor));
        set.register(Arc::new(CsvExtractor));
        set.register(Arc::new(PdfExtractor));
        set.register(Arc::new(SpreadsheetExtractor));
        set
    }

    /// Register an extractor; later registrations win for shared extensions.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for ext in extractor.extensions() {
            self.by_extension
                .insert(ext.to_string(), Arc::clone(&extractor));
        }
    }

    pub fn extractor_for(&self, path: &Path) -> Option<&Arc<dyn Extractor>> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        self.by_extension.get(&ext)
    }

    /// Extract one file below `root`, tagging every unit with its source.
    pub fn extract_file(
        &self,
        root: &Path,
        rel_path: &str,
    ) -> Result<Vec<ExtractedDocument>, ExtractError> {
        let path = root.join(rel_path);
        let extractor = self.extractor_for(&path).ok_or_else(|| {
            ExtractError::UnsupportedExtension(
                path.extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default(),
            )
        })?;

        let source_file = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| rel_path.to_string());

        // Parser crates (pdf-extract in particular) can panic on malformed
        // input; that must stay a failure of this one file.
        let units = std::panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(&path)))
            .map_err(|payload| ExtractError::Panicked(panic_message(payload.as_ref())))??;
        Ok(units
            .into_iter()
            .filter(|u| !u.text.trim().is_empty())
            .map(|u| ExtractedDocument {
                text: u.text,
                source_file: source_file.clone(),
                file_path: rel_path.to_string(),
                page: u.page,
            })
            .collect())
    }

    /// Extract every path, isolating failures per file.
    ///
    /// Returns the extracted documents plus the paths that failed. Unsupported
    /// extensions are logged and yield nothing, but are not failures.
    pub fn extract(
        &self,
        root: &Path,
        rel_paths: &[String],
    ) -> (Vec<ExtractedDocument>, Vec<(String, KbError)>) {
        let mut docs = Vec::new();
        let mut failed = Vec::new();

        for rel in rel_paths {
            match self.extract_file(root, rel) {
                Ok(mut file_docs) => {
                    debug!(path = %rel, units = file_docs.len(), "extracted");
                    docs.append(&mut file_docs);
                }
                Err(ExtractError::UnsupportedExtension(ext)) => {
                    warn!(path = %rel, extension = %ext, "no extractor for file type");
                }
                Err(e) => {
                    warn!(path = %rel, error = %e, "extraction failed");
                    failed.push((rel.clone(), KbError::ingestion(rel.as_str(), e)));
                }
            }
        }

        (docs, failed)
    }
}

// ============ Plain text ============

pub struct TextExtractor;

impl Extractor for TextExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["txt"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        let bytes = std::fs::read(path)?;
        Ok(vec![ExtractedUnit::whole(
            String::from_utf8_lossy(&bytes).into_owned(),
        )])
    }
}

// ============ Markdown ============

/// Renders Markdown to plain text: markup dropped, block structure kept as
/// blank lines so the chunker can split on paragraphs.
pub struct MarkdownExtractor;

impl Extractor for MarkdownExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["md", "markdown"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        let bytes = std::fs::read(path)?;
        let source = String::from_utf8_lossy(&bytes);
        Ok(vec![ExtractedUnit::whole(markdown_to_text(&source))])
    }
}

pub fn markdown_to_text(source: &str) -> String {
    use pulldown_cmark::{Event, Parser, TagEnd};

    let mut out = String::new();
    for event in Parser::new(source) {
        match event {
            Event::Text(t) | Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::CodeBlock
                | TagEnd::List(_)
                | TagEnd::Table,
            ) => out.push_str("\n\n"),
            Event::End(TagEnd::Item | TagEnd::TableRow | TagEnd::TableHead) => out.push('\n'),
            Event::End(TagEnd::TableCell) => out.push(' '),
            _ => {}
        }
    }

    // Nested blocks stack separators; keep at most one blank line.
    let mut text = out.trim().to_string();
    while text.contains("\n\n\n") {
        text = text.replace("\n\n\n", "\n\n");
    }
    text
}

// ============ CSV ============

/// One unit per data row, rendered as `header: value` lines.
pub struct CsvExtractor;

impl Extractor for CsvExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["csv"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| ExtractError::Csv(e.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|e| ExtractError::Csv(e.to_string()))?
            .clone();

        let mut units = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
            let text = record
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let header = headers.get(i).unwrap_or("");
                    format!("{}: {}", header.trim(), value.trim())
                })
                .collect::<Vec<_>>()
                .join("\n");
            units.push(ExtractedUnit::whole(text));
        }
        Ok(units)
    }
}

// ============ PDF ============

/// One unit per page when the text carries form-feed page breaks, otherwise
/// a single unit for the whole document.
pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        let bytes = std::fs::read(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|e| ExtractError::Pdf(e.to_string()))?;
        Ok(split_pdf_pages(&text))
    }
}

fn split_pdf_pages(text: &str) -> Vec<ExtractedUnit> {
    let pages: Vec<&str> = text.split(FORM_FEED).collect();
    if pages.len() == 1 {
        return vec![ExtractedUnit {
            text: text.to_string(),
            page: Some(1),
        }];
    }
    pages
        .into_iter()
        .enumerate()
        .map(|(i, page)| ExtractedUnit {
            text: page.to_string(),
            page: Some(i as u32 + 1),
        })
        .collect()
}

// ============ Spreadsheets (OOXML) ============

/// One unit per worksheet, cells joined by spaces. `.xls` files are accepted
/// only when they are OOXML containers.
pub struct SpreadsheetExtractor;

impl Extractor for SpreadsheetExtractor {
    fn extensions(&self) -> &[&'static str] {
        &["xlsx", "xls"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        let bytes = std::fs::read(path)?;
        if !bytes.starts_with(ZIP_MAGIC) {
            return Err(ExtractError::LegacySpreadsheet);
        }
        extract_xlsx_sheets(&bytes)
    }
}

fn extract_xlsx_sheets(bytes: &[u8]) -> Result<Vec<ExtractedUnit>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&archive);

    let mut units = Vec::new();
    for (idx, name) in sheet_names.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = extract_xlsx_sheet_cells(&sheet_xml, &shared_strings)?;
        units.push(ExtractedUnit {
            text,
            page: Some(idx as u32 + 1),
        });
    }
    Ok(units)
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Workbooks without any text cells have no `sharedStrings.xml`.
fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    if !archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    current = Some(String::new());
                }
            }
            Ok(quick_xml::events::Event::Text(te)) => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    strings.push(current.take().unwrap_or_default());
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_xlsx_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                // <v> holds values; <t> holds inline strings
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_value => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if !s.is_empty() {
                    if cell_is_shared_str {
                        if let Some(shared) = s.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                            cells.push(shared.clone());
                        }
                    } else {
                        cells.push(s.to_string());
                    }
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared_str = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
