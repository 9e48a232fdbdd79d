//! Document readers: turn a file on disk into plain UTF-8 text.
//!
//! Dispatch is by extension. Plain-text formats are decoded lossily, HTML is
//! reduced to visible text, PDF goes through `pdf-extract`, and the OOXML
//! formats (docx, pptx, xlsx) are unzipped and their XML parts walked with
//! `quick-xml`. Readers never panic on bad input; the pipeline records the
//! returned [`ReadError`] against the path and moves on.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// HTML elements whose content is never visible text.
const HTML_SKIP_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "header", "nav", "footer", "aside", "template", "svg",
];

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("no text content extracted")]
    Empty,
}

/// Formats with a reader. Anything else is [`ReadError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    PlainText,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

impl Format {
    pub fn from_extension(ext: &str) -> Option<Format> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" | "markdown" | "csv" | "json" | "xml" | "log" => Some(Format::PlainText),
            "html" | "htm" => Some(Format::Html),
            "pdf" => Some(Format::Pdf),
            "docx" => Some(Format::Docx),
            "pptx" => Some(Format::Pptx),
            "xlsx" => Some(Format::Xlsx),
            _ => None,
        }
    }
}

/// Lowercase extension of `path` without the dot, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Read and extract a file. Whitespace-only output is an error.
pub fn read_document(path: &Path) -> Result<String, ReadError> {
    let ext = extension_of(path);
    let format = Format::from_extension(&ext)
        .ok_or_else(|| ReadError::Unsupported(format!(".{} has no text reader", ext)))?;
    let bytes = std::fs::read(path)?;
    read_bytes(&bytes, format)
}

/// Extract text from in-memory content of a known format.
pub fn read_bytes(bytes: &[u8], format: Format) -> Result<String, ReadError> {
    let text = match format {
        Format::PlainText => String::from_utf8_lossy(bytes).into_owned(),
        Format::Html => html_to_text(&String::from_utf8_lossy(bytes)),
        Format::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ReadError::Pdf(e.to_string()))?
        }
        Format::Docx => read_docx(bytes)?,
        Format::Pptx => read_pptx(bytes)?,
        Format::Xlsx => read_xlsx(bytes)?,
    };
    if text.trim().is_empty() {
        return Err(ReadError::Empty);
    }
    Ok(text)
}

// ─── HTML ────────────────────────────────────────────────────────────

/// Reduce an HTML page to its visible text with whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `html`.
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len() / 2);
    let mut pos = 0;

    while pos < html.len() {
        let Some(rel) = html[pos..].find('<') else {
            out.push_str(&decode_entities(&html[pos..]));
            break;
        };
        let lt = pos + rel;
        out.push_str(&decode_entities(&html[pos..lt]));

        if lower[lt..].starts_with("<!--") {
            pos = match lower[lt + 4..].find("-->") {
                Some(end) => lt + 4 + end + 3,
                None => html.len(),
            };
            continue;
        }

        let Some(gt_rel) = html[lt..].find('>') else {
            break;
        };
        let gt = lt + gt_rel;
        let tag = &lower[lt + 1..gt];
        let closing = tag.starts_with('/');
        let name: String = tag
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        pos = gt + 1;

        if !closing && !tag.ends_with('/') && HTML_SKIP_ELEMENTS.contains(&name.as_str()) {
            let close = format!("</{}", name);
            pos = match lower[pos..].find(&close) {
                Some(end) => {
                    let close_start = pos + end;
                    lower[close_start..]
                        .find('>')
                        .map(|g| close_start + g + 1)
                        .unwrap_or(html.len())
                }
                None => html.len(),
            };
        }
        // Tags separate words even when the markup has no whitespace.
        out.push(' ');
    }

    collapse_whitespace(&out)
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after.find(';').filter(|&semi| semi <= 10).and_then(|semi| {
            let entity = &after[..semi];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, semi))
        });
        match decoded {
            Some((c, semi)) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ─── OOXML ───────────────────────────────────────────────────────────

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ReadError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ReadError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ReadError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ReadError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ReadError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ReadError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries under `prefix` named `<prefix>N.xml`, in numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
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

/// Concatenate the text of every `<t>` element; a newline ends each
/// `<p>` so paragraphs survive into the chunker.
fn collect_text_runs(xml: &[u8]) -> Result<String, ReadError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ReadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn read_docx(bytes: &[u8]) -> Result<String, ReadError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml)
}

fn read_pptx(bytes: &[u8]) -> Result<String, ReadError> {
    let mut archive = open_archive(bytes)?;
    let mut out = String::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if text.trim().is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text.trim_end());
    }
    Ok(out)
}

fn read_xlsx(bytes: &[u8]) -> Result<String, ReadError> {
    let mut archive = open_archive(bytes)?;
    // Workbooks with only numbers have no shared strings part.
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml")?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let rows = sheet_rows(&xml, &shared)?;
        if !rows.is_empty() {
            sheets.push(rows);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ReadError> {
    use quick_xml::events::Event;

    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(te.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ReadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One line per spreadsheet row, cells separated by tabs.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, ReadError> {
    use quick_xml::events::Event;

    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut shared_cell = false;
    let mut in_value = false;
    let mut cells = 0usize;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    while cells < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared_cell = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if !value.is_empty() {
                    let cell = if shared_cell {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                    } else {
                        Some(value.to_string())
                    };
                    if let Some(cell) = cell {
                        row.push(cell);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared_cell = false,
                b"row" if !row.is_empty() => rows.push(std::mem::take(&mut row).join("\t")),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ReadError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_html_strips_boilerplate() {
        let html = r#"<html><head><title>T</title><style>p{color:red}</style>
            <script>var x = "<p>nope</p>";</script></head>
            <body><nav>Home | About</nav><h1>Release&nbsp;notes</h1>
            <p>Fixed the <b>cache</b> &amp; the index.</p><!-- hidden -->
            <footer>(c) 2024</footer></body></html>"#;
        let text = html_to_text(html);
        assert_eq!(text, "T Release notes Fixed the cache & the index.");
    }

    #[test]
    fn test_html_uppercase_and_numeric_entities() {
        let text = html_to_text("<DIV>caf&#233; &#x41;<SCRIPT>x()</SCRIPT>ok</DIV>");
        assert_eq!(text, "café A ok");
    }

    #[test]
    fn test_plain_text_and_empty() {
        assert_eq!(
            read_bytes(b"hello\nworld", Format::PlainText).unwrap(),
            "hello\nworld"
        );
        assert!(matches!(
            read_bytes(b"  \n\t ", Format::PlainText),
            Err(ReadError::Empty)
        ));
    }

    #[test]
    fn test_legacy_office_is_unsupported() {
        assert_eq!(Format::from_extension("DOC"), None);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("old.doc");
        std::fs::write(&path, b"\xd0\xcf\x11\xe0").unwrap();
        assert!(matches!(
            read_document(&path),
            Err(ReadError::Unsupported(_))
        ));
    }

    #[test]
    fn test_docx_paragraphs() {
        let doc = zip_with(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="x"><w:body>
                <w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space="preserve"> line</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second</w:t></w:r></w:p>
            </w:body></w:document>"#,
        )]);
        let text = read_bytes(&doc, Format::Docx).unwrap();
        assert_eq!(text, "First line\nSecond\n");
    }

    #[test]
    fn test_xlsx_rows_with_shared_strings() {
        let book = zip_with(&[
            (
                "xl/sharedStrings.xml",
                r#"<sst><si><t>name</t></si><si><t>qty</t></si><si><t>apples</t></si></sst>"#,
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData>
                    <row><c t="s"><v>0</v></c><c t="s"><v>1</v></c></row>
                    <row><c t="s"><v>2</v></c><c><v>42</v></c></row>
                </sheetData></worksheet>"#,
            ),
        ]);
        let text = read_bytes(&book, Format::Xlsx).unwrap();
        assert_eq!(text, "name\tqty\napples\t42");
    }

    #[test]
    fn test_invalid_containers_return_errors() {
        assert!(matches!(
            read_bytes(b"not a pdf", Format::Pdf),
            Err(ReadError::Pdf(_))
        ));
        assert!(matches!(
            read_bytes(b"not a zip", Format::Docx),
            Err(ReadError::Ooxml(_))
        ));
    }
}
