use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

/// Marker substituted for every redacted value. Contains no digits or '@'
/// so a second scrub pass can never rematch it.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Marker used inside URL query values, kept URL-safe so the sanitized URL
/// stays parseable without percent-encoding surprises.
pub const URL_REDACTION_MARKER: &str = "REDACTED";

/// Query parameter names whose values are replaced (the key is kept, so the
/// shape of the URL stays debuggable).
pub const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "token",
    "key",
    "password",
    "secret",
    "auth",
    "api_key",
    "access_token",
];

/// One redaction rule. The rule set is data: tests cover each entry on its
/// own and call sites never branch on a specific category.
pub struct PiiPattern {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: &'static str,
}

pub static PII_PATTERNS: Lazy<Vec<PiiPattern>> = Lazy::new(|| {
    vec![
        PiiPattern {
            name: "email",
            pattern: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap(),
            replacement: REDACTION_MARKER,
        },
        PiiPattern {
            name: "credit_card",
            pattern: Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b").unwrap(),
            replacement: REDACTION_MARKER,
        },
        PiiPattern {
            name: "ssn",
            pattern: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            replacement: REDACTION_MARKER,
        },
        PiiPattern {
            name: "phone",
            pattern: Regex::new(r"\+?\b\d(?:[ .\-()]{0,2}\d){8,14}\b").unwrap(),
            replacement: REDACTION_MARKER,
        },
        PiiPattern {
            name: "secret_kv",
            pattern: Regex::new(
                r#"(?i)\b(token|secret|password|passwd|pwd|api[_\-]?key|auth|access[_\-]?token|authorization)\b\s*[=:]\s*[^\s&"',;]+"#,
            )
            .unwrap(),
            replacement: "$1=[REDACTED]",
        },
    ]
});

/// Redacts PII categories from untrusted free text. Pure and idempotent:
/// every category maps to a fixed marker, so reapplication is a no-op and
/// category order does not matter.
pub fn scrub(text: &str) -> String {
    let mut out = text.to_string();
    for rule in PII_PATTERNS.iter() {
        if let std::borrow::Cow::Owned(replaced) = rule.pattern.replace_all(&out, rule.replacement)
        {
            out = replaced;
        }
    }
    out
}

/// Replaces the values of sensitive query parameters, leaving everything
/// else byte-identical. A URL that does not carry a sensitive parameter is
/// returned unchanged; an unparseable one falls back to plain scrubbing.
pub fn sanitize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return scrub(raw);
    };

    let has_sensitive = url.query_pairs().any(|(name, _)| {
        SENSITIVE_QUERY_PARAMS
            .iter()
            .any(|p| name.eq_ignore_ascii_case(p))
    });
    if !has_sensitive {
        return raw.to_string();
    }

    let sanitized: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            let redact = SENSITIVE_QUERY_PARAMS
                .iter()
                .any(|p| name.eq_ignore_ascii_case(p));
            let value = if redact {
                URL_REDACTION_MARKER.to_string()
            } else {
                value.into_owned()
            };
            (name.into_owned(), value)
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(sanitized);
    url.to_string()
}
