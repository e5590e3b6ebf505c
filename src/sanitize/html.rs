//! Allowlist HTML sanitizer.
//!
//! Input is tokenized the way a browser would split it into tags, comments
//! and text, and the output is rebuilt from scratch. Nothing from the input
//! reaches the output unless it was recognised as text (re-escaped) or as an
//! allowlisted tag/attribute (re-serialized). Obfuscated markup that the
//! tokenizer cannot classify therefore ends up as inert text, not as a tag.
//!
//! Output is always balanced, lowercase, and contains no raw `<` or `>`
//! outside of emitted tags, which makes the function idempotent.

use std::borrow::Cow;

use super::url::sanitize_url;

/// Tags that survive sanitization.
const ALLOWED_TAGS: &[&str] = &[
    "a",
    "b",
    "blockquote",
    "br",
    "code",
    "em",
    "h1",
    "h2",
    "h3",
    "h4",
    "h5",
    "h6",
    "hr",
    "i",
    "li",
    "ol",
    "p",
    "pre",
    "s",
    "strong",
    "u",
    "ul",
];

const VOID_TAGS: &[&str] = &["br", "hr"];

/// Elements whose content is raw text up to the matching end tag.
pub(crate) const RAW_TEXT_TAGS: &[&str] = &[
    "iframe",
    "noembed",
    "noframes",
    "noscript",
    "plaintext",
    "script",
    "style",
    "textarea",
    "title",
    "xmp",
];

/// Elements dropped together with their (parsed) children.
const NESTED_DROP_TAGS: &[&str] = &["applet", "math", "object", "select", "svg", "template"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    Text(&'a str),
    StartTag {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag {
        name: String,
    },
    /// Comments, doctypes, processing instructions and unterminated tags.
    Ignored,
}

pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0c)
}

impl<'a> Tokenizer<'a> {
    pub(crate) fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn byte(&self, i: usize) -> Option<u8> {
        self.input.as_bytes().get(i).copied()
    }

    fn slice(&self, from: usize, to: usize) -> &'a str {
        self.input.get(from..to).unwrap_or_default()
    }

    /// Position of the next `needle` at or after `from`.
    fn find(&self, from: usize, needle: &str) -> Option<usize> {
        self.input
            .get(from..)
            .and_then(|rest| rest.find(needle))
            .map(|i| from + i)
    }

    /// Consume up to and including the next `>`; to the end when there is none.
    fn skip_past_gt(&mut self, from: usize) {
        self.pos = self.find(from, ">").map_or(self.input.len(), |i| i + 1);
    }

    pub(crate) fn next_token(&mut self) -> Option<Token<'a>> {
        let start = self.pos;
        if start >= self.input.len() {
            return None;
        }

        if self.byte(start) != Some(b'<') {
            let end = self.find(start, "<").unwrap_or(self.input.len());
            self.pos = end;
            return Some(Token::Text(self.slice(start, end)));
        }

        match self.byte(start + 1) {
            Some(b) if b.is_ascii_alphabetic() => Some(self.start_tag(start)),
            Some(b'/') => match self.byte(start + 2) {
                Some(b) if b.is_ascii_alphabetic() => Some(self.end_tag(start)),
                Some(b'>') => {
                    self.pos = start + 3;
                    Some(Token::Ignored)
                }
                Some(_) => {
                    self.skip_past_gt(start + 2);
                    Some(Token::Ignored)
                }
                None => {
                    self.pos = self.input.len();
                    Some(Token::Text(self.slice(start, self.input.len())))
                }
            },
            Some(b'!') => {
                if self.input.get(start..).is_some_and(|r| r.starts_with("<!--")) {
                    self.pos = self
                        .find(start + 4, "-->")
                        .map_or(self.input.len(), |i| i + 3);
                } else {
                    self.skip_past_gt(start + 2);
                }
                Some(Token::Ignored)
            }
            Some(b'?') => {
                self.skip_past_gt(start + 2);
                Some(Token::Ignored)
            }
            _ => {
                self.pos = start + 1;
                Some(Token::Text(self.slice(start, start + 1)))
            }
        }
    }

    fn read_name(&self, mut i: usize) -> (String, usize) {
        let start = i;
        while let Some(b) = self.byte(i) {
            if is_ws(b) || b == b'/' || b == b'>' {
                break;
            }
            i += 1;
        }
        (self.slice(start, i).to_ascii_lowercase(), i)
    }

    fn skip_ws(&self, mut i: usize) -> usize {
        while self.byte(i).is_some_and(is_ws) {
            i += 1;
        }
        i
    }

    fn start_tag(&mut self, start: usize) -> Token<'a> {
        let (name, mut i) = self.read_name(start + 1);
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            i = self.skip_ws(i);
            match self.byte(i) {
                None => {
                    // Unterminated tag at end of input is discarded by browsers
                    self.pos = self.input.len();
                    return Token::Ignored;
                }
                Some(b'>') => {
                    i += 1;
                    break;
                }
                Some(b'/') => {
                    self_closing = self.byte(i + 1) == Some(b'>');
                    i += 1;
                    continue;
                }
                Some(_) => {}
            }
            self_closing = false;

            let name_start = i;
            if self.byte(i) == Some(b'=') {
                i += 1;
            }
            while let Some(b) = self.byte(i) {
                if is_ws(b) || matches!(b, b'/' | b'>' | b'=') {
                    break;
                }
                i += 1;
            }
            let attr_name = self.slice(name_start, i).to_ascii_lowercase();

            i = self.skip_ws(i);
            let mut value = "";
            if self.byte(i) == Some(b'=') {
                i = self.skip_ws(i + 1);
                match self.byte(i) {
                    Some(q @ (b'"' | b'\'')) => {
                        let quote = if q == b'"' { "\"" } else { "'" };
                        let Some(close) = self.find(i + 1, quote) else {
                            self.pos = self.input.len();
                            return Token::Ignored;
                        };
                        value = self.slice(i + 1, close);
                        i = close + 1;
                    }
                    _ => {
                        let value_start = i;
                        while let Some(b) = self.byte(i) {
                            if is_ws(b) || b == b'>' {
                                break;
                            }
                            i += 1;
                        }
                        value = self.slice(value_start, i);
                    }
                }
            }

            if !attr_name.is_empty() && !attrs.iter().any(|(n, _)| *n == attr_name) {
                attrs.push((attr_name, decode_entities(value).into_owned()));
            }
        }

        self.pos = i;
        Token::StartTag {
            name,
            attrs,
            self_closing,
        }
    }

    fn end_tag(&mut self, start: usize) -> Token<'a> {
        let (name, i) = self.read_name(start + 2);
        match self.find(i, ">") {
            Some(gt) => {
                self.pos = gt + 1;
                Token::EndTag { name }
            }
            None => {
                self.pos = self.input.len();
                Token::Ignored
            }
        }
    }

    /// Consume an autolink such as `<https://example.com>` and return its target.
    pub(crate) fn autolink(&mut self) -> Option<&'a str> {
        let start = self.pos;
        if self.byte(start) != Some(b'<') || !self.byte(start + 1)?.is_ascii_alphabetic() {
            return None;
        }
        let end = self.find(start + 1, ">")?;
        let target = self.slice(start + 1, end);
        if !target.contains(':') || target.bytes().any(|b| is_ws(b) || b == b'<') {
            return None;
        }
        self.pos = end + 1;
        Some(target)
    }

    /// Skip the content of an element that is dropped wholesale.
    pub(crate) fn skip_element(&mut self, name: &str) {
        if RAW_TEXT_TAGS.contains(&name) {
            self.skip_raw_text(name);
            return;
        }

        let mut depth = 1usize;
        while let Some(token) = self.next_token() {
            match token {
                Token::StartTag {
                    name: ref inner,
                    self_closing: false,
                    ..
                } if inner == name => depth += 1,
                Token::EndTag { name: ref inner } if inner == name => {
                    depth -= 1;
                    if depth == 0 {
                        return;
                    }
                }
                _ => {}
            }
        }
    }

    fn skip_raw_text(&mut self, name: &str) {
        let haystack = self
            .input
            .get(self.pos..)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let needle = format!("</{name}");
        let mut from = 0;

        while let Some(found) = haystack.get(from..).and_then(|h| h.find(&needle)) {
            let after = from + found + needle.len();
            match haystack.as_bytes().get(after) {
                Some(&b) if is_ws(b) || b == b'/' || b == b'>' => {
                    let base = self.pos;
                    self.skip_past_gt(base + after);
                    return;
                }
                None => break,
                Some(_) => from = after,
            }
        }

        self.pos = self.input.len();
    }
}

pub(crate) fn is_drop_tag(name: &str) -> bool {
    RAW_TEXT_TAGS.contains(&name) || NESTED_DROP_TAGS.contains(&name)
}

fn allowed_tag(name: &str) -> Option<&'static str> {
    ALLOWED_TAGS.iter().copied().find(|t| *t == name)
}

/// Sanitize untrusted HTML against the tag allowlist.
///
/// ```rust
/// use request_guard::sanitize::sanitize_html;
///
/// let clean = sanitize_html("<script>alert(1)</script>Hello <strong>world</strong>");
/// assert_eq!(clean, "Hello <strong>world</strong>");
/// ```
pub fn sanitize_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut open: Vec<&'static str> = Vec::new();
    let mut tokens = Tokenizer::new(input);

    while let Some(token) = tokens.next_token() {
        match token {
            Token::Text(text) => out.push_str(&escape_text(text)),
            Token::StartTag {
                name,
                attrs,
                self_closing,
            } => {
                if is_drop_tag(&name) {
                    // Self-closing syntax is ignored on raw-text elements
                    if !self_closing || RAW_TEXT_TAGS.contains(&name.as_str()) {
                        tokens.skip_element(&name);
                    }
                    continue;
                }
                let Some(tag) = allowed_tag(&name) else {
                    continue;
                };
                write_start_tag(&mut out, tag, &attrs);
                if !VOID_TAGS.contains(&tag) {
                    open.push(tag);
                }
            }
            Token::EndTag { name } => {
                if let Some(idx) = open.iter().rposition(|t| *t == name) {
                    for tag in open.drain(idx..).rev() {
                        write_end_tag(&mut out, tag);
                    }
                }
            }
            Token::Ignored => {}
        }
    }

    for tag in open.into_iter().rev() {
        write_end_tag(&mut out, tag);
    }
    out
}

fn write_start_tag(out: &mut String, tag: &str, attrs: &[(String, String)]) {
    out.push('<');
    out.push_str(tag);
    if tag == "a" {
        for (name, value) in attrs {
            let value = match name.as_str() {
                "href" => sanitize_url(value),
                "title" => value.clone(),
                _ => continue,
            };
            if name == "href" && value.is_empty() {
                continue;
            }
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(&value));
            out.push('"');
        }
    }
    out.push('>');
}

fn write_end_tag(out: &mut String, tag: &str) {
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}

// =============================================================================
// Entities
// =============================================================================

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "colon" => ':',
        "semi" => ';',
        "tab" => '\t',
        "newline" => '\n',
        "sol" => '/',
        "bsol" => '\\',
        "lpar" => '(',
        "rpar" => ')',
        "period" => '.',
        "comma" => ',',
        "excl" => '!',
        "num" => '#',
        "equals" => '=',
        "grave" => '`',
        _ => return None,
    })
}

/// Decode character references. Unknown names are left as written.
pub(crate) fn decode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains('&') {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(rest.get(..amp).unwrap_or_default());
        let after = rest.get(amp + 1..).unwrap_or_default();
        match decode_one(after) {
            Some((ch, consumed)) => {
                out.push(ch);
                rest = after.get(consumed..).unwrap_or_default();
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

/// Decode the reference following an `&`, returning the char and bytes consumed.
fn decode_one(after: &str) -> Option<(char, usize)> {
    if let Some(numeric) = after.strip_prefix('#') {
        let (digits, radix, prefix) = match numeric.strip_prefix(['x', 'X']) {
            Some(hex) => (hex, 16, 2),
            None => (numeric, 10, 1),
        };
        let len = digits
            .bytes()
            .take_while(|b| {
                if radix == 16 {
                    b.is_ascii_hexdigit()
                } else {
                    b.is_ascii_digit()
                }
            })
            .count();
        if len == 0 {
            return None;
        }
        let value = u32::from_str_radix(digits.get(..len)?, radix).unwrap_or(u32::MAX);
        let ch = char::from_u32(value)
            .filter(|c| *c != '\0')
            .unwrap_or('\u{fffd}');
        let semicolon = usize::from(digits.as_bytes().get(len) == Some(&b';'));
        return Some((ch, prefix + len + semicolon));
    }

    let len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    let name = after.get(..len)?;
    let ch = named_entity(name)?;
    if after.as_bytes().get(len) == Some(&b';') {
        Some((ch, len + 1))
    } else if matches!(name, "amp" | "lt" | "gt" | "quot") {
        Some((ch, len))
    } else {
        None
    }
}

/// Whether `rest` (starting at `&`) is a complete character reference.
fn starts_entity(rest: &str) -> bool {
    let Some(body) = rest.strip_prefix('&') else {
        return false;
    };
    let (digits, check): (&str, fn(&u8) -> bool) = if let Some(n) = body.strip_prefix("#x") {
        (n, u8::is_ascii_hexdigit)
    } else if let Some(n) = body.strip_prefix("#X") {
        (n, u8::is_ascii_hexdigit)
    } else if let Some(n) = body.strip_prefix('#') {
        (n, u8::is_ascii_digit)
    } else {
        if !body.bytes().next().is_some_and(|b| b.is_ascii_alphabetic()) {
            return false;
        }
        (body, u8::is_ascii_alphanumeric)
    };
    let len = digits.bytes().take_while(check).count();
    len > 0 && digits.as_bytes().get(len) == Some(&b';')
}

/// Escape text content. Existing complete references are kept as written.
pub(crate) fn escape_text(text: &str) -> Cow<'_, str> {
    if !text.contains(['<', '>', '&']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for (i, ch) in text.char_indices() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' if !starts_entity(text.get(i..).unwrap_or_default()) => out.push_str("&amp;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}
