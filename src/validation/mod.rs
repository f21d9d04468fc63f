//! Validation helpers for configuration values.

pub mod url;

pub use url::{UrlValidationError, require_https, validate_endpoint_url};
