//! Route classification.

use crate::utils::path_matches_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Build assets and icons. They skip every security stage.
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct RouteClassifier {
    static_prefixes: Vec<String>,
}

impl RouteClassifier {
    pub fn new(static_prefixes: Vec<String>) -> Self {
        Self { static_prefixes }
    }

    pub fn classify(&self, path: &str) -> RouteClass {
        if self
            .static_prefixes
            .iter()
            .any(|prefix| path_matches_prefix(path, prefix))
        {
            RouteClass::Static
        } else {
            RouteClass::Dynamic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let classifier = RouteClassifier::new(vec![
            "/_next/static".into(),
            "/static/".into(),
            "/favicon.ico".into(),
        ]);
        assert_eq!(classifier.classify("/_next/static/chunk.js"), RouteClass::Static);
        assert_eq!(classifier.classify("/static/logo.png"), RouteClass::Static);
        assert_eq!(classifier.classify("/favicon.ico"), RouteClass::Static);
        assert_eq!(classifier.classify("/_next/staticky"), RouteClass::Dynamic);
        assert_eq!(classifier.classify("/api/posts"), RouteClass::Dynamic);
        assert_eq!(classifier.classify("/"), RouteClass::Dynamic);
    }
}
