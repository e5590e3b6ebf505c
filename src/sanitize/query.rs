//! Query-string sanitization for the redirect stage of the pipeline.
//!
//! Values are percent-decoded repeatedly before matching so that
//! `%253Cscript%253E` is seen as `<script>`. A request whose query carries a
//! denylisted construct is answered with a redirect to the rewritten URL
//! instead of being forwarded.

use regex::Regex;
use url::form_urlencoded;

/// Total percent-decoding passes, the form decoding included.
const MAX_DECODE_PASSES: usize = 3;

/// Strip passes before a value is given up on and emptied.
const MAX_CLEAN_PASSES: usize = 8;

/// Elements removed together with their content.
const BLOCK_TAGS: &[&str] = &["script", "iframe", "object", "applet", "style"];

const DETECT_PATTERNS: &[&str] = &[
    r"(?i)<\s*/?\s*[a-z!?]",
    r"(?i)(?:java|vb|live)script\s*:",
    r"(?i)data\s*:\s*text/html",
    r"(?i)\bon[a-z]{3,}\s*=",
    r"(?i)\b(?:alert|confirm|prompt|eval|expression)\s*\(",
];

const STRIP_PATTERNS: &[&str] = &[
    r"(?i)<[^>]*>",
    r"(?i)(?:java|vb|live)script\s*:",
    r"(?i)data\s*:\s*text/html",
    r"(?i)\bon[a-z]{3,}\s*=",
    r"(?i)\b(?:alert|confirm|prompt|eval|expression)\s*\(",
    r"[<>]",
];

/// Result of sanitizing a query string that needed changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedQuery {
    /// Path plus rewritten query, suitable for a `Location` header.
    pub location: String,
    /// Names of the parameters that were rewritten or dropped.
    pub flagged: Vec<String>,
}

/// Denylist matcher for URL query parameters.
///
/// Patterns are compiled once; construct at startup and share.
#[derive(Debug, Clone)]
pub struct QuerySanitizer {
    detect: Vec<Regex>,
    strip: Vec<Regex>,
}

impl QuerySanitizer {
    pub fn new() -> Result<Self, regex::Error> {
        let detect = DETECT_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut strip = BLOCK_TAGS
            .iter()
            .map(|tag| Regex::new(&format!(r"(?is)<\s*{tag}\b[^>]*>.*?<\s*/\s*{tag}[^>]*>")))
            .collect::<Result<Vec<_>, _>>()?;
        for pattern in STRIP_PATTERNS {
            strip.push(Regex::new(pattern)?);
        }

        Ok(Self { detect, strip })
    }

    /// Whether any decoding layer of `value` matches a denylist pattern.
    pub fn is_dangerous(&self, value: &str) -> bool {
        decode_layers(value)
            .iter()
            .any(|layer| self.detect.iter().any(|re| re.is_match(layer)))
    }

    /// Fully decode `value` and strip denylisted constructs until clean.
    ///
    /// Returns an empty string when the value cannot be cleaned.
    pub fn clean_value(&self, value: &str) -> String {
        let mut current = value.to_string();
        for _ in 0..MAX_CLEAN_PASSES {
            let mut next = decode_layers(&current).pop().unwrap_or_default();
            for re in &self.strip {
                next = re.replace_all(&next, "").into_owned();
            }
            if !self.is_dangerous(&next) {
                return next;
            }
            current = next;
        }
        String::new()
    }

    /// Rewrite `query` for `path` when any parameter is dangerous.
    ///
    /// Returns `None` when the query is already clean. Dangerous parameter
    /// names drop the whole pair; dangerous values are replaced by their
    /// cleaned form.
    pub fn sanitize(&self, path: &str, query: &str) -> Option<SanitizedQuery> {
        let mut flagged = Vec::new();
        let mut serializer = form_urlencoded::Serializer::new(String::new());

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if self.is_dangerous(&key) {
                flagged.push(key.into_owned());
                continue;
            }
            if self.is_dangerous(&value) {
                serializer.append_pair(&key, &self.clean_value(&value));
                flagged.push(key.into_owned());
            } else {
                serializer.append_pair(&key, &value);
            }
        }

        if flagged.is_empty() {
            return None;
        }

        let rewritten = serializer.finish();
        let location = if rewritten.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{rewritten}")
        };
        Some(SanitizedQuery { location, flagged })
    }
}

/// `value` followed by each successive percent-decoding that changes it.
fn decode_layers(value: &str) -> Vec<String> {
    let mut layers = vec![value.to_string()];
    for _ in 1..MAX_DECODE_PASSES {
        let Some(last) = layers.last() else { break };
        match urlencoding::decode(last) {
            Ok(decoded) if decoded != last.as_str() => {
                let decoded = decoded.into_owned();
                layers.push(decoded);
            }
            _ => break,
        }
    }
    layers
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sanitizer() -> QuerySanitizer {
        QuerySanitizer::new().unwrap()
    }

    #[test]
    fn test_clean_query_untouched() {
        let s = sanitizer();
        assert_eq!(s.sanitize("/search", "q=rust+async&page=2"), None);
        assert_eq!(s.sanitize("/search", "q=1+%3C+2&expr=one%3Dtwo"), None);
        assert_eq!(s.sanitize("/search", ""), None);
    }

    #[test]
    fn test_script_value_rewritten() {
        let out = sanitizer()
            .sanitize("/search", "q=%3Cscript%3Ealert(1)%3C%2Fscript%3Ehello&page=2")
            .unwrap();
        assert_eq!(out.location, "/search?q=hello&page=2");
        assert_eq!(out.flagged, vec!["q".to_string()]);
    }

    #[test]
    fn test_double_encoded_payload_detected() {
        let s = sanitizer();
        let query = "q=%253Cscript%253Ealert(1)%253C%252Fscript%253E";
        assert!(s.is_dangerous("%3Cscript%3E"));
        let out = s.sanitize("/search", query).unwrap();
        assert_eq!(out.location, "/search?q=");
    }

    #[test]
    fn test_javascript_scheme_and_calls_stripped() {
        let out = sanitizer()
            .sanitize("/p", "next=javascript:alert(1)")
            .unwrap();
        assert_eq!(out.location, "/p?next=1%29");
    }

    #[test]
    fn test_event_handler_attribute_stripped() {
        let s = sanitizer();
        assert_eq!(s.clean_value("x\" onmouseover=steal() y"), "x\" steal() y");
        assert_eq!(s.clean_value("<img src=x onerror=alert(1)>"), "");
    }

    #[test]
    fn test_dangerous_key_dropped() {
        let out = sanitizer()
            .sanitize("/p", "%3Csvg%20onload%3Dx%3E=1&ok=yes")
            .unwrap();
        assert_eq!(out.location, "/p?ok=yes");
        assert_eq!(out.flagged.len(), 1);
    }

    #[test]
    fn test_empty_rewrite_drops_question_mark() {
        let out = sanitizer().sanitize("/p", "%3Cb%3E=1").unwrap();
        assert_eq!(out.location, "/p");
    }

    #[test]
    fn test_redirect_target_is_clean() {
        let s = sanitizer();
        for query in [
            "q=%3Cscr%3Cscript%3Eipt%3Ealert(1)%3C%2Fscript%3E",
            "a=%25253Cb%25253E",
            "x=javajavascript:script:1",
            "y=EVAL%20(%20x%20)&z=ok",
        ] {
            let out = s.sanitize("/r", query).unwrap();
            let (_, rewritten) = out.location.split_once('?').unwrap_or(("", ""));
            assert_eq!(s.sanitize("/r", rewritten), None, "redirect loop for {query:?}");
        }
    }
}
