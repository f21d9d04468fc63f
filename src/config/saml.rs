use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::{
    saml::TrustAnchor,
    validation::{require_https, validate_endpoint_url},
    xml::ParseLimits,
};

pub const NAME_ID_FORMAT_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:unspecified";
pub const AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT: &str =
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";

// ─────────────────────────────────────────────────────────────────────────────
// Service Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Identity of this service provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// SP entity ID, sent as the request `Issuer`.
    pub issuer: String,

    /// Assertion Consumer Service URL the IdP posts responses to.
    pub acs_url: String,

    /// NameID format requested from the IdP.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    /// Requested authentication context class.
    #[serde(default = "default_authn_context_class_ref")]
    pub authn_context_class_ref: String,

    /// Ask the IdP to re-authenticate the user even with a live session.
    #[serde(default)]
    pub force_authn: bool,
}

impl SpConfig {
    pub fn new(issuer: impl Into<String>, acs_url: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            acs_url: acs_url.into(),
            name_id_format: default_name_id_format(),
            authn_context_class_ref: default_authn_context_class_ref(),
            force_authn: false,
        }
    }

    pub fn validate(&self, https_only: bool) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Validation("sp.issuer cannot be empty".into()));
        }
        validate_url("sp.acs_url", &self.acs_url, https_only)?;
        if self.name_id_format.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sp.name_id_format cannot be empty".into(),
            ));
        }
        if self.authn_context_class_ref.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sp.authn_context_class_ref cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_name_id_format() -> String {
    NAME_ID_FORMAT_UNSPECIFIED.to_string()
}

fn default_authn_context_class_ref() -> String {
    AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT.to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Trust configuration for the single IdP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    /// IdP signing certificate: base64 DER or PEM.
    pub certificate: String,

    /// IdP Single Sign-On service URL.
    pub sso_url: String,
}

impl IdpConfig {
    pub fn validate(&self, https_only: bool) -> Result<(), ConfigError> {
        validate_url("idp.sso_url", &self.sso_url, https_only)?;
        TrustAnchor::parse(&self.certificate)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response validation
// ─────────────────────────────────────────────────────────────────────────────

/// Hardening limits applied to inbound responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Largest accepted response, measured as XML bytes after decoding.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,

    /// Largest accepted number of XML nodes.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Deepest accepted element nesting.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Attribute names treated as element identifiers for `#id` references.
    #[serde(default = "default_id_attributes")]
    pub id_attributes: Vec<String>,

    /// Accept SHA-1 digests and signatures.
    #[serde(default = "default_allow_sha1")]
    pub allow_sha1: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: default_max_response_bytes(),
            max_nodes: default_max_nodes(),
            max_depth: default_max_depth(),
            id_attributes: default_id_attributes(),
            allow_sha1: default_allow_sha1(),
        }
    }
}

impl ValidationConfig {
    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_nodes: self.max_nodes,
            max_depth: self.max_depth,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Validation(
                "validation.max_response_bytes must be greater than 0".into(),
            ));
        }
        if self.max_nodes == 0 || self.max_depth == 0 {
            return Err(ConfigError::Validation(
                "validation.max_nodes and validation.max_depth must be greater than 0".into(),
            ));
        }
        if self.id_attributes.is_empty() {
            return Err(ConfigError::Validation(
                "validation.id_attributes must name at least one attribute".into(),
            ));
        }
        if let Some(bad) = self
            .id_attributes
            .iter()
            .find(|name| name.is_empty() || name.contains(':') || name.contains(char::is_whitespace))
        {
            return Err(ConfigError::Validation(format!(
                "validation.id_attributes contains invalid attribute name '{bad}'"
            )));
        }
        Ok(())
    }
}

fn default_max_response_bytes() -> usize {
    256 * 1024
}

fn default_max_nodes() -> usize {
    ParseLimits::default().max_nodes
}

fn default_max_depth() -> usize {
    ParseLimits::default().max_depth
}

fn default_id_attributes() -> Vec<String> {
    vec!["ID".to_string()]
}

fn default_allow_sha1() -> bool {
    true
}

fn validate_url(field: &str, url: &str, https_only: bool) -> Result<(), ConfigError> {
    validate_endpoint_url(url)
        .map_err(|e| ConfigError::Validation(format!("{field}: {e}")))?;
    if https_only {
        require_https(url).map_err(|e| ConfigError::Validation(format!("{field}: {e}")))?;
    }
    Ok(())
}
