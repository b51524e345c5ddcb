use std::io::Read;
use std::path::Path;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{ElementRef, Html, Node};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// Hard cap on characters kept from one (estimated) page. Pathological
/// PDFs can emit endlessly repeating text layers.
const MAX_PAGE_CHARS: usize = 50_000;

/// Rough bytes-per-page used to size the parse budget before the document
/// is opened.
const PDF_BYTES_PER_PAGE: u64 = 30_000;

/// Dispatch on file extension and extract plain text / Markdown.
pub fn parse_file(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "docx" => parse_docx(path),
        "pdf" => parse_pdf(path),
        "html" => parse_html(path),
        "md" | "txt" => parse_text(path),
        other => Err(IngestError::UnsupportedFormat(other.to_string())),
    }
}

/// Wall-clock budget for one PDF parse:
/// 5 minutes base + 5 minutes per 100 pages, capped at 30 minutes.
pub fn pdf_time_budget(pages: usize) -> Duration {
    let secs = (300 + (pages / 100) * 300).min(1800);
    Duration::from_secs(secs as u64)
}

/// Page estimate from file size; used only to scale the time budget and the
/// runaway-text cap before the document is parsed.
pub fn estimate_pdf_pages(file_size: u64) -> usize {
    ((file_size / PDF_BYTES_PER_PAGE) as usize).max(1)
}

fn parse_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

// ---- PDF ----

fn parse_pdf(path: &Path) -> Result<String> {
    let file_size = std::fs::metadata(path)?.len();
    let pages = estimate_pdf_pages(file_size);
    debug!(path = %path.display(), file_size, pages, "parsing PDF");

    let text = pdf_extract::extract_text(path)
        .map_err(|e| IngestError::Parse(format!("pdf extraction failed: {}", e)))?;

    // Empty documents come back empty, not as an error; the pipeline
    // decides what an empty parse means.
    let cap = MAX_PAGE_CHARS * pages;
    let char_count = text.chars().count();
    if char_count > cap {
        warn!(char_count, cap, "PDF text exceeded cap, truncating");
        return Ok(truncate_chars(&text, cap));
    }
    Ok(collapse_blank_lines(&text))
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ---- DOCX ----

/// Walk `word/document.xml`: heading styles become Markdown headings,
/// tables become pipe tables, everything else plain paragraphs.
fn parse_docx(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| IngestError::Parse(format!("not a docx archive: {}", e)))?;
    let mut document = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| IngestError::Parse(format!("docx missing document.xml: {}", e)))?
        .read_to_string(&mut document)?;

    extract_docx_xml(&document)
}

fn extract_docx_xml(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut lines: Vec<String> = Vec::new();
    let mut para_text = String::new();
    let mut heading_level: usize = 0;
    let mut in_table = false;
    let mut table_rows: Vec<Vec<String>> = Vec::new();
    let mut row_cells: Vec<String> = Vec::new();
    let mut cell_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tbl" => {
                    in_table = true;
                    table_rows.clear();
                }
                b"w:tr" if in_table => row_cells.clear(),
                b"w:tc" if in_table => cell_text.clear(),
                b"w:p" if !in_table => {
                    para_text.clear();
                    heading_level = 0;
                }
                b"w:pStyle" => {
                    if let Some(level) = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"w:val")
                        .and_then(|a| heading_style_level(&String::from_utf8_lossy(&a.value)))
                    {
                        heading_level = level;
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if in_table {
                    cell_text.push_str(&text);
                } else {
                    para_text.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:tc" if in_table => {
                    row_cells.push(cell_text.replace('\n', " ").trim().to_string())
                }
                b"w:tr" if in_table => table_rows.push(row_cells.clone()),
                b"w:tbl" => {
                    in_table = false;
                    let table = table_to_markdown(&table_rows);
                    if !table.is_empty() {
                        lines.push(table);
                        lines.push(String::new());
                    }
                }
                b"w:p" if !in_table => {
                    let text = para_text.trim();
                    if !text.is_empty() {
                        if heading_level > 0 {
                            lines.push(format!("{} {}", "#".repeat(heading_level), text));
                        } else {
                            lines.push(text.to_string());
                        }
                        lines.push(String::new());
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(IngestError::Parse(format!("docx xml error: {}", e))),
            _ => {}
        }
    }

    Ok(lines.join("\n").trim_end().to_string() + "\n")
}

fn heading_style_level(style: &str) -> Option<usize> {
    let rest = style.strip_prefix("Heading")?;
    match rest.trim().parse::<usize>() {
        Ok(level) if (1..=6).contains(&level) => Some(level),
        Ok(_) => Some(1),
        Err(_) => Some(1),
    }
}

fn table_to_markdown(rows: &[Vec<String>]) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };
    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(format!("| {} |", header.join(" | ")));
    out.push(format!("| {} |", vec!["---"; header.len()].join(" | ")));
    for row in &rows[1..] {
        out.push(format!("| {} |", row.join(" | ")));
    }
    out.join("\n")
}

// ---- HTML ----

const STRIP_TAGS: &[&str] = &["script", "style", "noscript", "header", "footer"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul", "ol", "tr", "td", "th", "br",
    "hr", "article", "section", "aside", "main", "nav",
];

fn parse_html(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    let html = String::from_utf8_lossy(&bytes);
    if html.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(extract_html_text(&html))
}

pub(crate) fn extract_html_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts: Vec<String> = Vec::new();

    let root = document
        .select(&scraper::Selector::parse("body").expect("static selector"))
        .next();
    match root {
        Some(body) => walk_element(body, &mut parts),
        None => walk_element(document.root_element(), &mut parts),
    }

    let raw = parts.concat();
    let text = if raw.trim().is_empty() {
        // Fallback: every text node, newline separated.
        document.root_element().text().collect::<Vec<_>>().join("\n")
    } else {
        raw
    };
    collapse_blank_lines(text.trim())
}

fn walk_element(element: ElementRef<'_>, parts: &mut Vec<String>) {
    let name = element.value().name();
    if STRIP_TAGS.contains(&name) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    walk_element(child_ref, parts);
                    if BLOCK_TAGS.contains(&child_ref.value().name()) {
                        parts.push("\n".to_string());
                    }
                }
            }
            _ => {}
        }
    }
}

/// Collapse runs of three or more newlines down to a blank line.
pub(crate) fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn dispatch_rejects_unknown_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, b"...").unwrap();
        assert!(matches!(
            parse_file(&path),
            Err(IngestError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn text_files_read_with_lossy_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"hello \xF0\x28 world").unwrap(); // invalid UTF-8 in the middle
        let text = parse_file(&path).unwrap();
        assert!(text.starts_with("hello"));
        assert!(text.ends_with("world"));
    }

    #[test]
    fn pdf_budget_scales_with_pages_and_caps() {
        assert_eq!(pdf_time_budget(1), Duration::from_secs(300));
        assert_eq!(pdf_time_budget(99), Duration::from_secs(300));
        assert_eq!(pdf_time_budget(100), Duration::from_secs(600));
        assert_eq!(pdf_time_budget(450), Duration::from_secs(1500));
        assert_eq!(pdf_time_budget(10_000), Duration::from_secs(1800));
    }

    #[test]
    fn page_estimate_never_zero() {
        assert_eq!(estimate_pdf_pages(0), 1);
        assert!(estimate_pdf_pages(3_000_000) >= 100);
    }

    #[test]
    fn docx_headings_and_tables_become_markdown() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Title</w:t></w:r></w:p>
    <w:p><w:r><w:t>Body text.</w:t></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>Name</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Age</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>Ada</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>36</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
  </w:body>
</w:document>"#;
        let text = extract_docx_xml(xml).unwrap();
        assert!(text.contains("# Title"));
        assert!(text.contains("Body text."));
        assert!(text.contains("| Name | Age |"));
        assert!(text.contains("| --- | --- |"));
        assert!(text.contains("| Ada | 36 |"));
    }

    #[test]
    fn html_strips_chrome_and_collapses_blank_runs() {
        let html = r#"<html><head><style>.x{}</style></head><body>
            <header>site nav</header>
            <script>alert(1)</script>
            <h1>Title</h1>
            <p>First paragraph.</p>
            <div><p>Nested text.</p></div>
            <footer>copyright</footer>
        </body></html>"#;
        let text = extract_html_text(html);
        assert!(text.contains("Title"));
        assert!(text.contains("First paragraph."));
        assert!(text.contains("Nested text."));
        assert!(!text.contains("alert"));
        assert!(!text.contains("site nav"));
        assert!(!text.contains("copyright"));
        assert!(!text.contains("\n\n\n"));
    }

    #[test]
    fn blank_line_collapse_keeps_paragraph_breaks() {
        assert_eq!(collapse_blank_lines("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("a\n\nb"), "a\n\nb");
        assert_eq!(collapse_blank_lines("a\nb"), "a\nb");
    }

    #[test]
    fn char_truncation_is_boundary_safe() {
        let text = "你好".repeat(10);
        let cut = truncate_chars(&text, 5);
        assert_eq!(cut.chars().count(), 5);
    }
}
