//! Fuzz target for the sanitizers.
//!
//! Checks that arbitrary input never panics any sanitizer and that the
//! URL and query outputs never carry a scriptable scheme or a dangerous value.
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_sanitizers -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use request_guard::sanitize::{
    QuerySanitizer, is_scriptable, sanitize_html, sanitize_json, sanitize_markdown, sanitize_url,
};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let _ = sanitize_html(s);
    let _ = sanitize_markdown(s);

    let url = sanitize_url(s);
    assert!(url.is_empty() || !is_scriptable(&url));

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(s) {
        let _ = sanitize_json(&value);
    }

    if let Ok(sanitizer) = QuerySanitizer::new() {
        if let Some(rewritten) = sanitizer.sanitize("/search", s) {
            let query = rewritten.location.split_once('?').map_or("", |(_, q)| q);
            assert!(sanitizer.sanitize("/search", query).is_none());
        }
    }
});
