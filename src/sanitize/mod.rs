//! Pure sanitizers for untrusted input.
//!
//! Every function here is deterministic, performs no I/O and is idempotent:
//! applying it to its own output returns that output unchanged.
//!
//! - [`sanitize_html`] rebuilds HTML against a tag allowlist.
//! - [`sanitize_url`] keeps relative URLs and `http`, `https`, `mailto`.
//! - [`sanitize_markdown`] strips raw HTML but keeps markdown syntax and code.
//! - [`sanitize_json`] applies the string rules to every leaf of a document.
//! - [`QuerySanitizer`] detects and rewrites dangerous query parameters.

mod html;
mod json;
mod markdown;
mod query;
mod url;

pub use html::sanitize_html;
pub use json::sanitize_json;
pub use markdown::sanitize_markdown;
pub use query::{QuerySanitizer, SanitizedQuery};
pub use url::{ALLOWED_SCHEMES, is_scriptable, sanitize_url, url_scheme};
