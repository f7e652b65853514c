//! Url targeting for experiments.
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use url::Url;

/// How [`UrlTarget::pattern`] is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlTargetType {
    /// Regular expression tested against the full url and against the url without its origin.
    Regex,
    /// Url-shaped pattern with `*` wildcards. Host and path must match, the hash and query
    /// parameters only if the pattern sets them. Case-insensitive.
    Simple,
    /// The url must equal the pattern.
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlTarget {
    /// `false` turns the target into an exclusion.
    #[serde(default = "default_include")]
    pub include: bool,
    #[serde(rename = "type")]
    pub target_type: UrlTargetType,
    pub pattern: String,
}

fn default_include() -> bool {
    true
}

/// Check `url` against a list of include/exclude targets.
///
/// Any matching exclusion rejects the url. If there are include targets, at least one of them
/// must match. An empty list never matches.
pub fn is_url_targeted(url: &str, targets: &[UrlTarget]) -> bool {
    if targets.is_empty() {
        return false;
    }

    let mut has_include_rules = false;
    let mut is_included = false;

    for target in targets {
        let matched = eval_url_target(url, target.target_type, &target.pattern);
        if !target.include {
            if matched {
                return false;
            }
        } else {
            has_include_rules = true;
            if matched {
                is_included = true;
            }
        }
    }

    is_included || !has_include_rules
}

/// Legacy url targeting: `url_regex` is tested against the full url and against the path
/// (scheme and host stripped).
pub fn url_is_valid(url_regex: &str, url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let Ok(regex) = Regex::new(url_regex) else {
        log::debug!(target: "growthbook", url_regex; "invalid experiment url regex");
        return false;
    };
    if regex.is_match(url) {
        return true;
    }

    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let path_only = match without_scheme.find('/') {
        Some(index) => &without_scheme[index..],
        None => without_scheme,
    };
    regex.is_match(path_only)
}

fn parse_relative(url: &str) -> Option<Url> {
    let base = Url::parse("https://_").ok()?;
    base.join(url).ok()
}

fn eval_url_target(url: &str, target_type: UrlTargetType, pattern: &str) -> bool {
    let Some(parsed) = parse_relative(url) else {
        return false;
    };
    match target_type {
        UrlTargetType::Regex => {
            let Ok(regex) = Regex::new(pattern) else {
                return false;
            };
            let href = parsed.as_str();
            let origin_len = parsed.origin().ascii_serialization().len();
            regex.is_match(href) || href.get(origin_len..).is_some_and(|rest| regex.is_match(rest))
        }
        UrlTargetType::Simple => eval_simple_url_target(&parsed, pattern),
        UrlTargetType::Exact => parsed.as_str() == pattern || url == pattern,
    }
}

const WILDCARD: &str = "_____";

fn eval_simple_url_target(actual: &Url, pattern: &str) -> bool {
    // Bare hosts ("example.com/path") are read as https urls.
    let pattern = match pattern.split_once('.') {
        Some((head, _)) if !head.contains([':', '/', '?']) => format!("https://{pattern}"),
        _ => pattern.to_owned(),
    };
    let Some(expected) = parse_relative(&pattern.replace('*', WILDCARD)) else {
        return false;
    };

    let mut comparisons = vec![
        (host_with_port(actual), host_with_port(&expected), false),
        (actual.path().to_owned(), expected.path().to_owned(), true),
    ];
    if let Some(fragment) = expected.fragment().filter(|f| !f.is_empty()) {
        comparisons.push((
            actual.fragment().unwrap_or_default().to_owned(),
            fragment.to_owned(),
            false,
        ));
    }
    for (key, value) in expected.query_pairs() {
        let actual_value = actual
            .query_pairs()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        comparisons.push((actual_value, value.into_owned(), false));
    }

    comparisons
        .iter()
        .all(|(actual, pattern, is_path)| eval_simple_url_part(actual, pattern, *is_path))
}

fn host_with_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        _ => String::new(),
    }
}

fn eval_simple_url_part(actual: &str, pattern: &str, is_path: bool) -> bool {
    let mut escaped = regex::escape(pattern).replace(WILDCARD, ".*");
    if is_path {
        let trimmed = escaped.strip_prefix('/').unwrap_or(&escaped);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        escaped = format!("/?{trimmed}/?");
    }
    RegexBuilder::new(&format!("^{escaped}$"))
        .case_insensitive(true)
        .build()
        .is_ok_and(|regex| regex.is_match(actual))
}
