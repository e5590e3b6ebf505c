//! Markdown sanitizer: removes raw HTML, keeps markdown syntax.
//!
//! Fenced code blocks and inline code spans are left byte-for-byte intact
//! (renderers escape them). In prose, tags, comments and dangerous elements
//! (with their content) are removed, autolinks are kept only when their
//! target passes [`sanitize_url`], and link destinations that fail it are
//! replaced by `#`. Text is never entity-escaped, so `>` blockquotes and
//! `a < b` survive untouched.

use super::html::{RAW_TEXT_TAGS, Token, Tokenizer, is_drop_tag};
use super::url::sanitize_url;

/// Upper bound on strip passes before leftover `<` are neutralised.
const MAX_PASSES: usize = 16;

/// Sanitize user-authored markdown.
///
/// ```rust
/// use request_guard::sanitize::sanitize_markdown;
///
/// let md = "# Title\n\n- item <script>alert(1)</script>\n";
/// assert_eq!(sanitize_markdown(md), "# Title\n\n- item \n");
/// ```
pub fn sanitize_markdown(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_PASSES {
        let next = single_pass(&current);
        if next == current {
            return next;
        }
        current = next;
    }
    // Pathological nesting: make every remaining `<` in prose inert
    map_prose(&current, |prose| prose.replace('<', "&lt;"))
}

fn single_pass(input: &str) -> String {
    map_prose(input, |prose| rewrite_link_destinations(&strip_tags(prose)))
}

/// Apply `f` to prose segments, copying code segments verbatim.
fn map_prose(input: &str, f: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(input.len());
    for segment in split_fences(input) {
        match segment {
            Segment::Code(code) => out.push_str(code),
            Segment::Prose(prose) => {
                for span in split_code_spans(prose) {
                    match span {
                        Segment::Code(code) => out.push_str(code),
                        Segment::Prose(text) => out.push_str(&f(text)),
                    }
                }
            }
        }
    }
    out
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Prose(&'a str),
    Code(&'a str),
}

/// Opening fence marker (char and run length) for a line, if any.
fn fence_marker(line: &str) -> Option<(char, usize)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let body = line.get(indent..)?;
    let ch = body.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = body.chars().take_while(|c| *c == ch).count();
    (run >= 3).then_some((ch, run))
}

fn split_fences(input: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut prose_start = 0;
    let mut offset = 0;
    let mut open: Option<(char, usize, usize)> = None;

    for line in input.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        match open {
            None => {
                if let Some((ch, run)) = fence_marker(line) {
                    if prose_start < line_start {
                        segments.push(Segment::Prose(
                            input.get(prose_start..line_start).unwrap_or_default(),
                        ));
                    }
                    open = Some((ch, run, line_start));
                }
            }
            Some((ch, run, start)) => {
                let closes = fence_marker(line).is_some_and(|(c, r)| {
                    c == ch && r >= run && line.trim().chars().all(|x| x == ch)
                });
                if closes {
                    segments.push(Segment::Code(input.get(start..offset).unwrap_or_default()));
                    open = None;
                    prose_start = offset;
                }
            }
        }
    }

    match open {
        // An unclosed fence runs to the end of the document
        Some((_, _, start)) => segments.push(Segment::Code(input.get(start..).unwrap_or_default())),
        None if prose_start < input.len() => {
            segments.push(Segment::Prose(input.get(prose_start..).unwrap_or_default()))
        }
        None => {}
    }
    segments
}

fn backtick_run(bytes: &[u8], at: usize) -> usize {
    bytes
        .get(at..)
        .map_or(0, |b| b.iter().take_while(|c| **c == b'`').count())
}

fn split_code_spans(prose: &str) -> Vec<Segment<'_>> {
    let bytes = prose.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes.get(i) != Some(&b'`') {
            i += 1;
            continue;
        }
        let run = backtick_run(bytes, i);
        let mut j = i + run;
        let mut close = None;
        while j < bytes.len() {
            if bytes.get(j) == Some(&b'`') {
                let other = backtick_run(bytes, j);
                if other == run {
                    close = Some(j + other);
                    break;
                }
                j += other;
            } else {
                j += 1;
            }
        }
        match close {
            Some(end) => {
                if text_start < i {
                    segments.push(Segment::Prose(prose.get(text_start..i).unwrap_or_default()));
                }
                segments.push(Segment::Code(prose.get(i..end).unwrap_or_default()));
                text_start = end;
                i = end;
            }
            None => i += run,
        }
    }

    if text_start < bytes.len() {
        segments.push(Segment::Prose(prose.get(text_start..).unwrap_or_default()));
    }
    segments
}

/// Remove markup from a prose segment without escaping the remaining text.
fn strip_tags(prose: &str) -> String {
    let mut out = String::with_capacity(prose.len());
    let mut tokens = Tokenizer::new(prose);

    loop {
        if let Some(target) = tokens.autolink() {
            if !sanitize_url(target).is_empty() {
                out.push('<');
                out.push_str(target);
                out.push('>');
            }
            continue;
        }
        let Some(token) = tokens.next_token() else {
            break;
        };
        match token {
            Token::Text(text) => out.push_str(text),
            Token::StartTag {
                name, self_closing, ..
            } if is_drop_tag(&name) => {
                if !self_closing || RAW_TEXT_TAGS.contains(&name.as_str()) {
                    tokens.skip_element(&name);
                }
            }
            Token::StartTag { .. } | Token::EndTag { .. } | Token::Ignored => {}
        }
    }
    out
}

/// Replace `](dest)` destinations that fail URL sanitization with `#`.
fn rewrite_link_destinations(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = rest.find("](") {
        let (head, tail) = rest.split_at(idx + 2);
        out.push_str(head);

        let leading = tail.len() - tail.trim_start().len();
        let body = tail.get(leading..).unwrap_or_default();
        let mut depth = 0usize;
        let mut end = body.len();
        for (i, c) in body.char_indices() {
            match c {
                '(' => depth += 1,
                ')' if depth == 0 => {
                    end = i;
                    break;
                }
                ')' => depth -= 1,
                c if c.is_whitespace() => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let dest = body.get(..end).unwrap_or_default();

        out.push_str(tail.get(..leading).unwrap_or_default());
        if !dest.is_empty() && sanitize_url(dest).is_empty() {
            out.push('#');
        } else {
            out.push_str(dest);
        }
        rest = body.get(end..).unwrap_or_default();
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_syntax_untouched() {
        let md = "# Heading\n\n## Sub\n\n- one\n- two\n\n1. first\n\n> quoted\n\n**bold** _em_ a < b\n";
        assert_eq!(sanitize_markdown(md), md);
    }

    #[test]
    fn test_raw_html_removed() {
        assert_eq!(
            sanitize_markdown("Hello <b>there</b> <img src=x onerror=alert(1)>!"),
            "Hello there !"
        );
        assert_eq!(
            sanitize_markdown("x<script>alert(1)</script>y<!-- c -->z"),
            "xyz"
        );
    }

    #[test]
    fn test_reassembled_tags_removed() {
        let out = sanitize_markdown("<scr<b>ipt>alert(1)</scr</b>ipt>");
        assert!(!out.to_lowercase().contains("<script"));
        assert_eq!(sanitize_markdown(&out), out);
    }

    #[test]
    fn test_code_preserved() {
        let md = "Use `<div>` here.\n\n```html\n<script>alert(1)</script>\n```\nafter <i>x</i>\n";
        assert_eq!(
            sanitize_markdown(md),
            "Use `<div>` here.\n\n```html\n<script>alert(1)</script>\n```\nafter x\n"
        );
    }

    #[test]
    fn test_tilde_fence_and_unclosed_fence() {
        let md = "~~~\n<b>keep</b>\n~~~\n<b>drop</b>\n```\n<i>open";
        assert_eq!(
            sanitize_markdown(md),
            "~~~\n<b>keep</b>\n~~~\ndrop\n```\n<i>open"
        );
    }

    #[test]
    fn test_link_destinations() {
        assert_eq!(
            sanitize_markdown("[ok](https://example.com) [bad](javascript:alert(1)) [rel](/p/1)"),
            "[ok](https://example.com) [bad](#) [rel](/p/1)"
        );
        assert_eq!(
            sanitize_markdown("![img](data:image/svg+xml;base64,AAAA \"t\")"),
            "![img](# \"t\")"
        );
        assert_eq!(
            sanitize_markdown("[wiki](https://en.wikipedia.org/wiki/Rust_(language))"),
            "[wiki](https://en.wikipedia.org/wiki/Rust_(language))"
        );
    }

    #[test]
    fn test_autolinks() {
        assert_eq!(
            sanitize_markdown("see <https://example.com> and <javascript:alert(1)>"),
            "see <https://example.com> and "
        );
    }

    #[test]
    fn test_idempotent() {
        for md in [
            "plain",
            "<<b>script>alert(1)<</b>/script>",
            "[x](javascript:y) `code <b>`",
            "```\n<b>\n```",
            "a <!-- unterminated",
        ] {
            let once = sanitize_markdown(md);
            assert_eq!(sanitize_markdown(&once), once, "not idempotent for {md:?}");
        }
    }

    #[test]
    fn test_split_code_spans_unmatched() {
        assert_eq!(
            split_code_spans("a `` b ` c"),
            vec![Segment::Prose("a `` b ` c")]
        );
    }
}
