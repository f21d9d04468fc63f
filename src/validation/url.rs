//! Endpoint URL validation for configured SAML endpoints.
//!
//! The ACS URL and the IdP SSO URL are embedded in protocol messages and used
//! as redirect targets, so they must be absolute `http`/`https` URLs with a
//! host.

/// Errors from URL validation.
#[derive(Debug, thiserror::Error)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL scheme must be http or https")]
    InvalidScheme,

    #[error("URL scheme must be https")]
    InsecureScheme,

    #[error("URL must include a hostname")]
    MissingHost,
}

/// Validate an endpoint URL: absolute, `http` or `https`, with a host.
pub fn validate_endpoint_url(url: &str) -> Result<url::Url, UrlValidationError> {
    let parsed = url::Url::parse(url).map_err(|e| UrlValidationError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(UrlValidationError::InvalidScheme),
    }

    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(UrlValidationError::MissingHost),
    }
}

/// Validate that a URL uses HTTPS scheme.
pub fn require_https(url: &str) -> Result<(), UrlValidationError> {
    let parsed = url::Url::parse(url).map_err(|e| UrlValidationError::InvalidUrl(e.to_string()))?;
    if parsed.scheme() != "https" {
        return Err(UrlValidationError::InsecureScheme);
    }
    Ok(())
}
