//! Configuration for the SAML service provider.
//!
//! The service provider is configured via a TOML file, with support for
//! environment variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! require_https = true
//!
//! [sp]
//! issuer = "https://app.example.com/saml/metadata"
//! acs_url = "https://app.example.com/saml/acs"
//!
//! [idp]
//! certificate = "${IDP_CERTIFICATE}"
//! sso_url = "https://idp.example.com/sso"
//! ```

mod observability;
mod saml;

use std::{path::Path, sync::LazyLock};

pub use observability::*;
pub use saml::*;
use serde::{Deserialize, Serialize};

use crate::saml::CertificateError;

/// Root configuration file.
///
/// `[sp]` and `[idp]` are required; the remaining sections have defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlSpConfig {
    /// Reject plain `http` endpoint URLs.
    #[serde(default)]
    pub require_https: bool,

    /// Service provider identity.
    pub sp: SpConfig,

    /// Identity provider trust configuration.
    pub idp: IdpConfig,

    /// Response parsing and signature policy.
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SamlSpConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: SamlSpConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, including that the IdP certificate loads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sp.validate(self.require_https)?;
        self.idp.validate(self.require_https)?;
        self.validation.validate()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Invalid IdP certificate: {0}")]
    Certificate(#[from] CertificateError),
}

static ENV_VAR: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern is valid"));

/// Expand `${VAR}` references, leaving anything after a `#` on the same line
/// untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::tests::fixtures::TestIdp;

    fn minimal_toml(certificate: &str) -> String {
        format!(
            r#"
            [sp]
            issuer = "https://sp.example.com/metadata"
            acs_url = "https://sp.example.com/saml/acs"

            [idp]
            certificate = "{certificate}"
            sso_url = "https://idp.example.com/sso"
        "#
        )
    }

    #[test]
    fn test_minimal_config() {
        let idp = TestIdp::rsa();
        let config = SamlSpConfig::from_str(&minimal_toml(&idp.certificate_base64())).unwrap();

        assert_eq!(config.sp.issuer, "https://sp.example.com/metadata");
        assert_eq!(config.sp.name_id_format, NAME_ID_FORMAT_UNSPECIFIED);
        assert_eq!(
            config.sp.authn_context_class_ref,
            AUTHN_CONTEXT_PASSWORD_PROTECTED_TRANSPORT
        );
        assert!(!config.sp.force_authn);
        assert_eq!(config.validation, ValidationConfig::default());
        assert_eq!(config.validation.max_response_bytes, 262_144);
        assert_eq!(config.validation.id_attributes, vec!["ID".to_string()]);
        assert_eq!(config.observability.logging.format, LogFormat::Compact);
    }

    #[test]
    fn test_full_config() {
        let idp = TestIdp::rsa();
        let toml = format!(
            r#"
            require_https = true

            [sp]
            issuer = "urn:example:sp"
            acs_url = "https://sp.example.com/saml/acs"
            name_id_format = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress"
            force_authn = true

            [idp]
            certificate = '''
{pem}'''
            sso_url = "https://idp.example.com/sso"

            [validation]
            max_response_bytes = 65536
            id_attributes = ["ID", "AssertionID"]
            allow_sha1 = false

            [observability.logging]
            level = "debug"
            format = "json"
            filter = "saml_sp=trace"
        "#,
            pem = idp.certificate_pem()
        );
        let config = SamlSpConfig::from_str(&toml).unwrap();

        assert!(config.require_https);
        assert!(config.sp.force_authn);
        assert_eq!(config.validation.max_response_bytes, 65536);
        assert!(!config.validation.allow_sha1);
        assert_eq!(config.validation.id_attributes.len(), 2);
        assert_eq!(config.observability.logging.level, LogLevel::Debug);
        assert_eq!(config.observability.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let idp = TestIdp::rsa();
        let toml = minimal_toml(&idp.certificate_base64()).replace(
            "[idp]",
            "entity_id = \"extra\"\n\n            [idp]",
        );
        assert!(matches!(
            SamlSpConfig::from_str(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_acs_url() {
        let idp = TestIdp::rsa();
        let toml = minimal_toml(&idp.certificate_base64())
            .replace("https://sp.example.com/saml/acs", "/saml/acs");
        assert!(matches!(
            SamlSpConfig::from_str(&toml),
            Err(ConfigError::Validation(msg)) if msg.starts_with("sp.acs_url")
        ));
    }

    #[test]
    fn test_require_https() {
        let idp = TestIdp::rsa();
        let toml = format!(
            "require_https = true\n{}",
            minimal_toml(&idp.certificate_base64())
                .replace("https://idp.example.com/sso", "http://idp.example.com/sso")
        );
        assert!(matches!(
            SamlSpConfig::from_str(&toml),
            Err(ConfigError::Validation(msg)) if msg.starts_with("idp.sso_url")
        ));
    }

    #[test]
    fn test_invalid_certificate() {
        assert!(matches!(
            SamlSpConfig::from_str(&minimal_toml("bm90IGEgY2VydGlmaWNhdGU=")),
            Err(ConfigError::Certificate(_))
        ));
    }

    #[test]
    fn test_invalid_id_attribute_name() {
        let config = ValidationConfig {
            id_attributes: vec!["xml:id".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let idp = TestIdp::rsa();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml(&idp.certificate_base64()).as_bytes())
            .unwrap();

        let config = SamlSpConfig::from_file(file.path()).unwrap();
        assert_eq!(config.idp.sso_url, "https://idp.example.com/sso");
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            SamlSpConfig::from_file("/nonexistent/saml-sp.toml"),
            Err(ConfigError::Io(_, _))
        ));
    }

    #[test]
    fn test_certificate_from_env() {
        let idp = TestIdp::rsa();
        temp_env::with_var("TEST_IDP_CERTIFICATE", Some(idp.certificate_base64()), || {
            let config = SamlSpConfig::from_str(&minimal_toml("${TEST_IDP_CERTIFICATE}")).unwrap();
            assert_eq!(config.idp.certificate, idp.certificate_base64());
        });
    }

    #[test]
    fn test_missing_env_var() {
        temp_env::with_var_unset("TEST_MISSING_CERTIFICATE", || {
            assert!(matches!(
                SamlSpConfig::from_str(&minimal_toml("${TEST_MISSING_CERTIFICATE}")),
                Err(ConfigError::EnvVarNotFound(name)) if name == "TEST_MISSING_CERTIFICATE"
            ));
        });
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_SP_ISSUER", Some("urn:example:sp"), || {
            let result = expand_env_vars("issuer = \"${TEST_SP_ISSUER}\"").unwrap();
            assert_eq!(result, "issuer = \"urn:example:sp\"");
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# certificate = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# certificate = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_multiline_with_comments() {
        temp_env::with_var("TEST_MULTI", Some("value1"), || {
            let input = r#"key1 = "${TEST_MULTI}"
# key2 = "${NONEXISTENT}"
key3 = "literal""#;
            let result = expand_env_vars(input).unwrap();
            assert_eq!(
                result,
                r#"key1 = "value1"
# key2 = "${NONEXISTENT}"
key3 = "literal""#
            );
        });
    }
}
