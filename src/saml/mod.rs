//! SAML 2.0 Web Browser SSO, service-provider side.
//!
//! - [`AuthRequest`] builds the `AuthnRequest` sent to the IdP
//! - [`encoding`] holds the transport encodings of both directions
//! - [`ResponseValidator`] parses a response and verifies its enveloped
//!   signature against a pinned [`TrustAnchor`]
//!
//! Data taken from a response is only trusted through [`VerifiedResponse`],
//! which can only be obtained from a response whose signature verified.

pub mod authn_request;
pub mod certificate;
pub mod encoding;
pub mod response;

pub use authn_request::{AuthRequest, AuthRequestError, Binding, RequestEncoding};
pub use certificate::{CertificateError, TrustAnchor};
pub use encoding::EncodingError;
pub use response::{
    ConditionError, ResponseError, ResponseValidator, SamlResponse, Validity, VerifiedResponse,
};

pub const PROTOCOL_NAMESPACE: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NAMESPACE: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
