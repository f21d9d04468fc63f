//! Service-provider side of SAML 2.0 Web Browser SSO.
//!
//! Builds `AuthnRequest` messages for an identity provider and validates the
//! signed `Response` it sends back against a pinned X.509 certificate.
//!
//! ```no_run
//! use saml_sp::{config::SamlSpConfig, saml::{AuthRequest, Binding, ResponseValidator}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SamlSpConfig::from_file("saml-sp.toml")?;
//!
//! let url = AuthRequest::new(&config.sp).redirect_url(Binding::HttpRedirect, &config.idp, None)?;
//! println!("redirect the browser to {url}");
//!
//! # let posted = String::new();
//! let validator = ResponseValidator::from_idp_config(&config.idp, config.validation.clone())?;
//! let response = validator.load_base64(&posted)?;
//! let user = response.verified()?.name_id()?;
//! # let _ = user;
//! # Ok(())
//! # }
//! ```

pub mod config;
#[cfg(feature = "cli")]
pub mod observability;
pub mod saml;
pub mod validation;
pub mod xml;

#[cfg(test)]
mod tests;

pub use config::SamlSpConfig;
pub use saml::{AuthRequest, ResponseValidator, SamlResponse, TrustAnchor, VerifiedResponse};
