use uuid::Uuid;

/// Row ids are v7 UUIDs so the analytical store can sort inserts by time
/// without a secondary index.
pub fn uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Lowercase host extracted from an Origin header value, tolerating a bare
/// hostname without a scheme.
pub fn origin_host(origin: &str) -> Option<String> {
    let trimmed = origin.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = url::Url::parse(trimmed) {
        if let Some(host) = parsed.host_str() {
            return Some(host.to_ascii_lowercase());
        }
    }
    // "example.com" or "example.com:8080" without a scheme
    let without_port = trimmed.split(':').next().unwrap_or(trimmed);
    if without_port.is_empty() || without_port.contains('/') {
        return None;
    }
    Some(without_port.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_v7_is_version_7() {
        assert_eq!(uuid_v7().get_version_num(), 7);
    }

    #[test]
    fn origin_host_strips_scheme_and_port() {
        assert_eq!(
            origin_host("https://app.example.com:8443"),
            Some("app.example.com".to_string())
        );
        assert_eq!(
            origin_host("http://example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(origin_host("example.com"), Some("example.com".to_string()));
        assert_eq!(origin_host(""), None);
    }
}
