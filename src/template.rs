//! Materializes one iteration's concrete request from the base template.
//!
//! A template URL (and any header value or body value) may contain bracketed
//! placeholders that are resolved independently for every iteration:
//!  - `[lo-hi]` resolves to a uniformly random integer between `lo` and `hi`,
//!    inclusive of both bounds;
//!  - `[name]` resolves to a uniformly random element of the parameter pool
//!    registered under `name`, or to the empty string when no such pool
//!    exists;
//!  - `[header:Name:Value]` (URL only) sets the header `Name` for the current
//!    request and is stripped from the URL.
//!
//! Substitution is applied iteratively so pool values may themselves contain
//! placeholders, bounded by [`MAX_SUBSTITUTION_PASSES`] to guard against
//! self-referential pools. Unresolvable placeholders degrade to the empty
//! string; templating never fails an iteration.

use lazy_static::lazy_static;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

use crate::client::Method;

/// Maximum number of substitution passes applied to a single string.
pub const MAX_SUBSTITUTION_PASSES: usize = 32;

lazy_static! {
    // Numeric range token, ie `[10-99]`.
    static ref NUMERIC_RANGE: Regex = Regex::new(r"\[(\d+)-(\d+)\]").unwrap();
    // Named parameter token, ie `[user]`.
    static ref NAMED_PARAM: Regex = Regex::new(r"\[(\w+)\]").unwrap();
    // Inline header directive, ie `[header:Cookie:uid=123]`.
    static ref HEADER_DIRECTIVE: Regex =
        Regex::new(r"(?i)\s*\[header:\s*([\w\-]+):\s*([^\]]+)\]").unwrap();
    // Any placeholder still requiring substitution.
    static ref ANY_PLACEHOLDER: Regex = Regex::new(r"\[(\w+|\d+-\d+)\]").unwrap();
}

/// Named pools of candidate values drawn from during placeholder substitution.
pub type ParamPools = BTreeMap<String, Vec<String>>;

/// An optional request body, either raw bytes-as-text or structured form fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// A raw body sent as-is (after placeholder substitution).
    Raw(String),
    /// Form fields, each value individually placeholder-substituted.
    Form(BTreeMap<String, String>),
}

/// Immutable base state for the run, built once from configuration.
///
/// Workers never mutate the shared template; each iteration derives a private
/// [`ResolvedRequest`] from it.
#[derive(Debug, Clone)]
pub struct IterationTemplate {
    /// Base URL pattern, possibly containing placeholders.
    pub url: String,
    /// HTTP method used for every iteration.
    pub method: Method,
    /// Base request headers, values possibly containing placeholders.
    pub headers: BTreeMap<String, String>,
    /// Optional request body.
    pub body: Option<RequestBody>,
    /// Multipart file attachments, field name to path on disk.
    pub files: BTreeMap<String, String>,
    /// Parameter pools referenced by `[name]` placeholders.
    pub params: ParamPools,
}

/// One iteration's concrete request, owned by the worker processing it.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    /// Concrete URL with all placeholders substituted.
    pub url: String,
    /// HTTP method.
    pub method: Method,
    /// Request headers, including any inline `[header:...]` overrides.
    pub headers: BTreeMap<String, String>,
    /// Request body with placeholder substitution applied.
    pub body: Option<RequestBody>,
    /// Multipart file attachments, passed through unmodified.
    pub files: BTreeMap<String, String>,
}

impl IterationTemplate {
    /// Materialize a concrete request for one iteration.
    ///
    /// Uses an independent random source per call, so concurrent workers can
    /// resolve requests without any shared mutable state.
    pub fn resolve(&self) -> ResolvedRequest {
        let mut rng = rand::rng();

        let url = substitute(&self.url, &self.params, &mut rng);

        // Extract inline header directives after URL substitution; the
        // directive value is not itself substituted at extraction time, but
        // lands in the header map which is substituted below.
        let mut headers = self.headers.clone();
        let url = extract_header_directives(&url, &mut headers);

        for value in headers.values_mut() {
            *value = substitute(value, &self.params, &mut rng);
        }

        let body = self.body.as_ref().map(|body| match body {
            RequestBody::Raw(data) => RequestBody::Raw(substitute(data, &self.params, &mut rng)),
            RequestBody::Form(fields) => RequestBody::Form(
                fields
                    .iter()
                    .map(|(name, value)| {
                        (name.clone(), substitute(value, &self.params, &mut rng))
                    })
                    .collect(),
            ),
        });

        ResolvedRequest {
            url: url.trim().to_string(),
            method: self.method,
            headers,
            body,
            files: self.files.clone(),
        }
    }
}

/// Apply numeric-range and named-parameter substitution to a string.
///
/// Passes repeat until no placeholder remains or [`MAX_SUBSTITUTION_PASSES`]
/// is reached, whichever comes first.
pub fn substitute<R: Rng>(input: &str, params: &ParamPools, rng: &mut R) -> String {
    let mut current = input.to_string();
    let mut passes = 0;
    while ANY_PLACEHOLDER.is_match(&current) {
        // Numeric ranges first so `[10-99]` is never treated as a pool name.
        current = NUMERIC_RANGE
            .replace_all(&current, |caps: &Captures| {
                let low = caps[1].parse::<i64>().unwrap_or(0);
                let high = caps[2].parse::<i64>().unwrap_or(0);
                let uniform: f64 = rng.random();
                format!(
                    "{}",
                    (low as f64 + (high - low) as f64 * uniform).round() as i64
                )
            })
            .into_owned();
        current = NAMED_PARAM
            .replace_all(&current, |caps: &Captures| pick(params, &caps[1], rng))
            .into_owned();
        passes += 1;
        if passes >= MAX_SUBSTITUTION_PASSES {
            debug!(
                "placeholder substitution hit the {} pass limit: {}",
                MAX_SUBSTITUTION_PASSES, current
            );
            break;
        }
    }
    current
}

// Uniformly pick one element of the named pool, or the empty string when the
// pool is absent or empty.
fn pick<R: Rng>(params: &ParamPools, name: &str, rng: &mut R) -> String {
    match params.get(name) {
        Some(pool) if !pool.is_empty() => pool[rng.random_range(0..pool.len())].clone(),
        _ => String::new(),
    }
}

// Strip every `[header:Name:Value]` directive from the URL, recording each as
// a header override for the current request only.
fn extract_header_directives(url: &str, headers: &mut BTreeMap<String, String>) -> String {
    HEADER_DIRECTIVE
        .replace_all(url, |caps: &Captures| {
            headers.insert(caps[1].to_string(), caps[2].trim().to_string());
            String::new()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(url: &str, params: ParamPools) -> IterationTemplate {
        IterationTemplate {
            url: url.to_string(),
            method: Method::Get,
            headers: BTreeMap::new(),
            body: None,
            files: BTreeMap::new(),
            params,
        }
    }

    #[test]
    fn degenerate_range_is_deterministic() {
        let resolved = template("http://example.com/[5-5]", ParamPools::new()).resolve();
        assert_eq!(resolved.url, "http://example.com/5");
    }

    #[test]
    fn range_is_inclusive_of_both_bounds() {
        let mut rng = rand::rng();
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..500 {
            let value = substitute("[1-3]", &ParamPools::new(), &mut rng);
            let value = value.parse::<i64>().unwrap();
            assert!((1..=3).contains(&value));
            seen.insert(value);
        }
        // With 500 draws all three values are seen for all practical purposes.
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn absent_pool_resolves_to_empty_string() {
        let resolved = template("http://example.com/?u=[user]", ParamPools::new()).resolve();
        assert_eq!(resolved.url, "http://example.com/?u=");
    }

    #[test]
    fn empty_pool_resolves_to_empty_string() {
        let mut params = ParamPools::new();
        params.insert("user".to_string(), Vec::new());
        let resolved = template("http://example.com/?u=[user]", params).resolve();
        assert_eq!(resolved.url, "http://example.com/?u=");
    }

    #[test]
    fn pool_pick_is_one_of_the_candidates() {
        let mut params = ParamPools::new();
        params.insert(
            "user".to_string(),
            vec!["a".to_string(), "b".to_string()],
        );
        for _ in 0..50 {
            let resolved = template("http://x/[1-1]?u=[user]", params.clone()).resolve();
            assert!(
                resolved.url == "http://x/1?u=a" || resolved.url == "http://x/1?u=b",
                "unexpected resolution: {}",
                resolved.url
            );
        }
    }

    #[test]
    fn nested_pool_values_resolve() {
        let mut params = ParamPools::new();
        params.insert("outer".to_string(), vec!["[inner]".to_string()]);
        params.insert("inner".to_string(), vec!["x".to_string()]);
        let resolved = template("http://example.com/[outer]", params).resolve();
        assert_eq!(resolved.url, "http://example.com/x");
    }

    #[test]
    fn self_referential_pool_terminates() {
        let mut params = ParamPools::new();
        params.insert("loop".to_string(), vec!["[loop]".to_string()]);
        // Must terminate within the pass limit rather than hanging.
        let resolved = template("http://example.com/[loop]", params).resolve();
        assert!(resolved.url.starts_with("http://example.com/"));
    }

    #[test]
    fn header_directive_is_extracted_and_stripped() {
        let resolved = template(
            "http://example.com/ads?cb=1234 [header:Cookie:uid=tor00355;]",
            ParamPools::new(),
        )
        .resolve();
        assert_eq!(resolved.url, "http://example.com/ads?cb=1234");
        assert_eq!(
            resolved.headers.get("Cookie"),
            Some(&"uid=tor00355;".to_string())
        );
    }

    #[test]
    fn header_directive_keyword_is_case_insensitive() {
        let resolved = template(
            "http://example.com/[HEADER:X-Test:foo]",
            ParamPools::new(),
        )
        .resolve();
        assert_eq!(resolved.url, "http://example.com/");
        assert_eq!(resolved.headers.get("X-Test"), Some(&"foo".to_string()));
    }

    #[test]
    fn base_header_values_are_substituted() {
        let mut params = ParamPools::new();
        params.insert("token".to_string(), vec!["abc123".to_string()]);
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer [token]".to_string());
        let mut template = template("http://example.com/", params);
        template.headers = headers;
        let resolved = template.resolve();
        assert_eq!(
            resolved.headers.get("Authorization"),
            Some(&"Bearer abc123".to_string())
        );
    }

    #[test]
    fn raw_body_is_substituted() {
        let mut params = ParamPools::new();
        params.insert("user".to_string(), vec!["a".to_string()]);
        let mut template = template("http://example.com/", params);
        template.body = Some(RequestBody::Raw("login=[user]&n=[2-2]".to_string()));
        let resolved = template.resolve();
        assert_eq!(
            resolved.body,
            Some(RequestBody::Raw("login=a&n=2".to_string()))
        );
    }

    #[test]
    fn form_body_values_are_substituted() {
        let mut params = ParamPools::new();
        params.insert("user".to_string(), vec!["a".to_string()]);
        let mut fields = BTreeMap::new();
        fields.insert("login".to_string(), "[user]".to_string());
        let mut template = template("http://example.com/", params);
        template.body = Some(RequestBody::Form(fields));
        let resolved = template.resolve();
        let mut expected = BTreeMap::new();
        expected.insert("login".to_string(), "a".to_string());
        assert_eq!(resolved.body, Some(RequestBody::Form(expected)));
    }
}
