//! Image URL parsing.
//!
//! Cache keys handed to the network pipeline are URLs; two spellings of the
//! same resource should land on the same disk key.

/// Error type for keys that are not fetchable image URLs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("invalid URL: {0}")]
    Invalid(String),
}

/// Parse a cache key into the URL that will be fetched.
///
/// Surrounding whitespace is ignored, a missing scheme means `https`, only
/// `http` and `https` are accepted and the fragment is dropped. The host is
/// lowercased by the parser; path and query are kept byte for byte.
pub fn parse_image_url(key: &str) -> Result<url::Url, UrlError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(UrlError::Empty);
    }

    let with_scheme = if key.contains("://") { key.to_string() } else { format!("https://{key}") };
    let mut parsed = url::Url::parse(&with_scheme).map_err(|e| UrlError::Invalid(e.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlError::UnsupportedScheme(parsed.scheme().to_string()));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    parsed.set_fragment(None);
    Ok(parsed)
}
