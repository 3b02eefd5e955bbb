//! URL patterns used to short-circuit a session or pick a download link.

use regex::Regex;

/// Patterns applied when a download resolution names none.
pub const DEFAULT_DOWNLOAD_PATTERNS: &[&str] = &["*.nsp", "*.xci", "*.zip", "*.7z"];

/// A URL matcher.
///
/// Patterns containing `*` or `?` are globs matched against the whole URL
/// (`*` spans any run of characters, `?` a single one). Anything else matches
/// as a substring, so `.zip` and `*.zip` both catch a plain archive link.
/// Matching ignores ASCII case. Query strings are ignored by globs.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Glob(Regex),
    Contains(String),
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Option<Self> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return None;
        }

        let matcher = if trimmed.contains(['*', '?']) {
            let mut expr = String::from("(?i)^");
            for ch in trimmed.chars() {
                match ch {
                    '*' => expr.push_str(".*"),
                    '?' => expr.push('.'),
                    other => expr.push_str(&regex::escape(&other.to_string())),
                }
            }
            expr.push('$');
            Matcher::Glob(Regex::new(&expr).ok()?)
        } else {
            Matcher::Contains(trimmed.to_ascii_lowercase())
        };

        Some(Self {
            source: trimmed.to_string(),
            matcher,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, url: &str) -> bool {
        match &self.matcher {
            Matcher::Glob(regex) => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                regex.is_match(url) || regex.is_match(without_query)
            }
            Matcher::Contains(needle) => url.to_ascii_lowercase().contains(needle.as_str()),
        }
    }
}

/// Compile `patterns`, dropping blank entries.
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Vec<UrlPattern> {
    patterns
        .iter()
        .filter_map(|pattern| {
            let compiled = UrlPattern::new(pattern.as_ref());
            if compiled.is_none() {
                log::debug!("ignoring empty url pattern");
            }
            compiled
        })
        .collect()
}

pub fn default_download_patterns() -> Vec<UrlPattern> {
    compile_patterns(DEFAULT_DOWNLOAD_PATTERNS)
}

pub fn any_match<'a>(patterns: &'a [UrlPattern], url: &str) -> Option<&'a UrlPattern> {
    patterns.iter().find(|pattern| pattern.matches(url))
}
