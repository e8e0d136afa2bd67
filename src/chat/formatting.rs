//! Result-text rendering: converts the markdown-ish output agents produce
//! into plain text plus typed segments (Telegram message entities), then
//! paginates into keyboard-friendly pages.
//!
//! Segments use byte offsets into the rendered text; conversion to Telegram's
//! UTF-16 entity offsets happens at the send boundary.

use teloxide::types::{MessageEntity, MessageEntityKind};

/// Hard page budget in characters. Telegram's limit is 4096; staying at 4000
/// leaves headroom for page footers.
pub const PAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentKind {
    Bold,
    Italic,
    Code,
    Pre { language: Option<String> },
    Link(String),
}

/// A typed range over the rendered text, in byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone)]
pub struct Page {
    pub text: String,
    pub segments: Vec<Segment>,
}

/// Convert agent markdown into rendered text plus segments. Fenced code
/// blocks and tables become `Pre` ranges (tables pre-rendered fixed-width),
/// headings become bold lines, list markers become bullets.
pub fn render_markdown(md: &str) -> (String, Vec<Segment>) {
    let mut out = String::with_capacity(md.len());
    let mut segments = Vec::new();
    let lines: Vec<&str> = md.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        // Fenced code block.
        if let Some(fence) = line.strip_prefix("```") {
            let language = {
                let lang = fence.trim();
                (!lang.is_empty()).then(|| lang.to_string())
            };
            i += 1;
            let start = out.len();
            let mut first = true;
            while i < lines.len() && !lines[i].starts_with("```") {
                if !first {
                    out.push('\n');
                }
                out.push_str(lines[i]);
                first = false;
                i += 1;
            }
            if i < lines.len() {
                i += 1; // closing fence
            }
            if out.len() > start {
                segments.push(Segment {
                    start,
                    end: out.len(),
                    kind: SegmentKind::Pre { language },
                });
            }
            out.push('\n');
            continue;
        }

        // Table: a pipe row followed by a separator row. Rendered as a
        // fixed-width code block since chat clients have no table widget.
        if is_table_row(line) && i + 1 < lines.len() && is_table_separator(lines[i + 1]) {
            let mut rows = vec![line];
            let mut j = i + 1;
            while j < lines.len() && is_table_row(lines[j]) {
                rows.push(lines[j]);
                j += 1;
            }
            let rendered = render_table(&rows);
            let start = out.len();
            out.push_str(&rendered);
            segments.push(Segment {
                start,
                end: out.len(),
                kind: SegmentKind::Pre { language: None },
            });
            out.push('\n');
            i = j;
            continue;
        }

        // Heading: bold line without the hashes.
        if let Some(heading) = strip_heading(line) {
            let start = out.len();
            out.push_str(heading);
            segments.push(Segment {
                start,
                end: out.len(),
                kind: SegmentKind::Bold,
            });
            out.push('\n');
            i += 1;
            continue;
        }

        // List markers become bullets; then inline spans.
        let line = if let Some(rest) = line.strip_prefix("- ") {
            out.push_str("• ");
            rest
        } else if let Some(rest) = line.strip_prefix("* ") {
            out.push_str("• ");
            rest
        } else {
            line
        };
        append_inline(line, &mut out, &mut segments);
        out.push('\n');
        i += 1;
    }

    if out.ends_with('\n') {
        out.pop();
    }
    (out, segments)
}

/// Inline spans: `code`, **bold**, [text](url), _italic_, *italic*.
fn append_inline(line: &str, out: &mut String, segments: &mut Vec<Segment>) {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let mut i = 0;

    while i < len {
        if chars[i] == '`' {
            if let Some(end) = find_char(&chars, '`', i + 1) {
                let start = out.len();
                push_chars(out, &chars[i + 1..end]);
                segments.push(Segment {
                    start,
                    end: out.len(),
                    kind: SegmentKind::Code,
                });
                i = end + 1;
                continue;
            }
        }

        if i + 1 < len && chars[i] == '*' && chars[i + 1] == '*' {
            if let Some(end) = find_double_char(&chars, '*', i + 2) {
                let start = out.len();
                push_chars(out, &chars[i + 2..end]);
                segments.push(Segment {
                    start,
                    end: out.len(),
                    kind: SegmentKind::Bold,
                });
                i = end + 2;
                continue;
            }
        }

        if chars[i] == '[' {
            if let Some((text, url, next)) = parse_link(&chars, i) {
                let start = out.len();
                out.push_str(&text);
                segments.push(Segment {
                    start,
                    end: out.len(),
                    kind: SegmentKind::Link(url),
                });
                i = next;
                continue;
            }
        }

        // _italic_, but not inside identifiers like some_var_name.
        if chars[i] == '_' && (i == 0 || chars[i - 1] == ' ') {
            if let Some(end) = find_char(&chars, '_', i + 1) {
                let boundary =
                    end + 1 >= len || matches!(chars[end + 1], ' ' | '.' | ',' | '!' | '?');
                if boundary {
                    let start = out.len();
                    push_chars(out, &chars[i + 1..end]);
                    segments.push(Segment {
                        start,
                        end: out.len(),
                        kind: SegmentKind::Italic,
                    });
                    i = end + 1;
                    continue;
                }
            }
        }

        if chars[i] == '*' && (i + 1 >= len || chars[i + 1] != '*') {
            if let Some(end) = find_single_star(&chars, i + 1) {
                let start = out.len();
                push_chars(out, &chars[i + 1..end]);
                segments.push(Segment {
                    start,
                    end: out.len(),
                    kind: SegmentKind::Italic,
                });
                i = end + 1;
                continue;
            }
        }

        out.push(chars[i]);
        i += 1;
    }
}

fn push_chars(out: &mut String, chars: &[char]) {
    out.extend(chars.iter());
}

fn find_char(chars: &[char], c: char, start: usize) -> Option<usize> {
    (start..chars.len()).find(|&j| chars[j] == c)
}

fn find_double_char(chars: &[char], c: char, start: usize) -> Option<usize> {
    let mut j = start;
    while j + 1 < chars.len() {
        if chars[j] == c && chars[j + 1] == c {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn find_single_star(chars: &[char], start: usize) -> Option<usize> {
    (start..chars.len())
        .find(|&j| chars[j] == '*' && (j + 1 >= chars.len() || chars[j + 1] != '*'))
}

fn parse_link(chars: &[char], start: usize) -> Option<(String, String, usize)> {
    let close_bracket = find_char(chars, ']', start + 1)?;
    if close_bracket + 1 >= chars.len() || chars[close_bracket + 1] != '(' {
        return None;
    }
    let close_paren = find_char(chars, ')', close_bracket + 2)?;
    let text: String = chars[start + 1..close_bracket].iter().collect();
    let url: String = chars[close_bracket + 2..close_paren].iter().collect();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    Some((text, url, close_paren + 1))
}

fn strip_heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let after = trimmed.trim_start_matches('#');
    after.strip_prefix(' ').map(str::trim_start)
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.len() > 1
}

fn is_table_separator(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && !t.is_empty()
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
        && t.contains('-')
}

/// Render pipe-table rows as fixed-width text. Separator rows are dropped;
/// every column is padded to its widest cell.
fn render_table(rows: &[&str]) -> String {
    let parsed: Vec<Vec<String>> = rows
        .iter()
        .filter(|r| !is_table_separator(r))
        .map(|r| {
            r.trim()
                .trim_matches('|')
                .split('|')
                .map(|cell| cell.trim().to_string())
                .collect()
        })
        .collect();

    let columns = parsed.iter().map(Vec::len).max().unwrap_or(0);
    let mut widths = vec![0usize; columns];
    for row in &parsed {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for (row_idx, row) in parsed.iter().enumerate() {
        if row_idx > 0 {
            out.push('\n');
        }
        let rendered: Vec<String> = (0..columns)
            .map(|col| {
                let cell = row.get(col).map(String::as_str).unwrap_or("");
                let pad = widths[col].saturating_sub(cell.chars().count());
                format!("{}{}", cell, " ".repeat(pad))
            })
            .collect();
        out.push_str(rendered.join(" | ").trim_end());
    }
    out
}

/// Split rendered text into pages of at most `page_chars` characters. Pages
/// split at the last newline inside the window; when no newline falls in the
/// upper 70% of the window the page is hard-cut at the budget instead.
/// Segment ranges are clipped to each page and re-based to its start.
pub fn paginate(text: &str, segments: &[Segment], page_chars: usize) -> Vec<Page> {
    let mut pages = Vec::new();
    let mut remaining = text;
    let mut offset = 0usize; // absolute byte offset of `remaining`

    loop {
        let char_count = remaining.chars().count();
        if char_count <= page_chars {
            pages.push(make_page(remaining, offset, segments));
            break;
        }

        let byte_budget = remaining
            .char_indices()
            .nth(page_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..byte_budget];

        let newline_split = window.rfind('\n').filter(|&pos| {
            // Newline must land in the upper 70% of the window.
            let chars_before = window[..pos].chars().count();
            chars_before * 10 >= page_chars * 3
        });

        match newline_split {
            Some(pos) => {
                pages.push(make_page(&remaining[..pos], offset, segments));
                offset += pos + 1; // the split newline is eaten
                remaining = &remaining[pos + 1..];
            }
            None => {
                pages.push(make_page(window, offset, segments));
                offset += byte_budget;
                remaining = &remaining[byte_budget..];
            }
        }
    }

    pages
}

fn make_page(page_text: &str, page_start: usize, segments: &[Segment]) -> Page {
    let page_end = page_start + page_text.len();
    let clipped = segments
        .iter()
        .filter(|s| s.start < page_end && s.end > page_start)
        .map(|s| Segment {
            start: s.start.max(page_start) - page_start,
            end: s.end.min(page_end) - page_start,
            kind: s.kind.clone(),
        })
        .filter(|s| s.start < s.end)
        .collect();
    Page {
        text: page_text.to_string(),
        segments: clipped,
    }
}

/// Convert a page's byte-offset segments into Telegram message entities,
/// which use UTF-16 code unit offsets.
pub fn to_entities(page: &Page) -> Vec<MessageEntity> {
    page.segments
        .iter()
        .map(|s| {
            let offset = page.text[..s.start].encode_utf16().count();
            let length = page.text[s.start..s.end].encode_utf16().count();
            let kind = match &s.kind {
                SegmentKind::Bold => MessageEntityKind::Bold,
                SegmentKind::Italic => MessageEntityKind::Italic,
                SegmentKind::Code => MessageEntityKind::Code,
                SegmentKind::Pre { language } => MessageEntityKind::Pre {
                    language: language.clone(),
                },
                SegmentKind::Link(url) => match reqwest::Url::parse(url) {
                    Ok(url) => MessageEntityKind::TextLink { url },
                    Err(_) => MessageEntityKind::Code,
                },
            };
            MessageEntity {
                kind,
                offset,
                length,
            }
        })
        .collect()
}
