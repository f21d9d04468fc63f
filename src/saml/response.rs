//! Inbound response validation.
//!
//! A [`ResponseValidator`] turns response text into a [`SamlResponse`] whose
//! signature validity is computed once, at load time. Malformed input is an
//! error; a well-formed response with a missing or bad signature loads fine
//! but is `Invalid`, and refuses to hand out trusted data.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::{
    ASSERTION_NAMESPACE, PROTOCOL_NAMESPACE,
    certificate::{CertificateError, TrustAnchor},
    encoding::{EncodingError, decode_inbound},
};
use crate::{
    config::{IdpConfig, ValidationConfig},
    xml::{Document, NodeId, SignatureError, SignedReference, VerifyOptions, XmlError, dsig},
};

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("invalid trust anchor: {0}")]
    Certificate(#[from] CertificateError),

    #[error("response of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("failed to decode response: {0}")]
    Encoding(#[from] EncodingError),

    #[error("failed to parse response XML: {0}")]
    Parse(#[from] XmlError),

    #[error("no NameID found")]
    NameIdNotFound,

    #[error("NameID has element content")]
    NameIdNotText,

    #[error("response is not trusted: {0}")]
    Untrusted(SignatureError),
}

/// Failures of [`VerifiedResponse::check_conditions`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("assertion is not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    #[error("assertion expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("assertion is not addressed to audience '{0}'")]
    AudienceMismatch(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Outcome of signature validation, fixed when the response is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid(SignedReference),
    Invalid(SignatureError),
}

/// Loads responses and checks their signatures against one trust anchor.
#[derive(Debug, Clone)]
pub struct ResponseValidator {
    trust_anchor: Arc<TrustAnchor>,
    config: ValidationConfig,
}

impl ResponseValidator {
    pub fn new(trust_anchor: Arc<TrustAnchor>, config: ValidationConfig) -> Self {
        Self {
            trust_anchor,
            config,
        }
    }

    pub fn from_idp_config(idp: &IdpConfig, config: ValidationConfig) -> Result<Self, ResponseError> {
        let trust_anchor = TrustAnchor::parse(&idp.certificate)?;
        Ok(Self::new(Arc::new(trust_anchor), config))
    }

    pub fn trust_anchor(&self) -> &Arc<TrustAnchor> {
        &self.trust_anchor
    }

    /// Parse response XML text and validate its signature.
    pub fn load_xml(&self, xml: &str) -> Result<SamlResponse, ResponseError> {
        let limit = self.config.max_response_bytes;
        if xml.len() > limit {
            return Err(ResponseError::TooLarge {
                size: xml.len(),
                limit,
            });
        }

        tracing::debug!(xml_len = xml.len(), "Parsing SAML response");
        let mut document =
            Document::parse_with_limits(xml, self.config.parse_limits()).map_err(|e| {
                tracing::debug!(error = %e, "SAML response is not well-formed XML");
                ResponseError::Parse(e)
            })?;

        let validity = match self.verify(&mut document) {
            Ok(signed) => {
                tracing::debug!(
                    reference = %signed.uri,
                    algorithm = signed.signature_algorithm.uri(),
                    "SAML response signature verified"
                );
                Validity::Valid(signed)
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "SAML response signature rejected");
                Validity::Invalid(reason)
            }
        };

        Ok(SamlResponse { document, validity })
    }

    /// Decode a base64 `SAMLResponse` value, then [`Self::load_xml`].
    pub fn load_base64(&self, encoded: &str) -> Result<SamlResponse, ResponseError> {
        self.load_encoded(encoded, false)
    }

    /// Like [`Self::load_base64`], optionally percent-decoding first.
    pub fn load_encoded(&self, input: &str, url_encoded: bool) -> Result<SamlResponse, ResponseError> {
        // Percent-encoded base64 is at most about four times the XML size;
        // anything longer cannot decode to an acceptable response.
        let limit = self.config.max_response_bytes.saturating_mul(4);
        if input.len() > limit {
            return Err(ResponseError::TooLarge {
                size: input.len(),
                limit,
            });
        }
        let xml = decode_inbound(input, url_encoded)?;
        self.load_xml(&xml)
    }

    fn verify(&self, document: &mut Document) -> Result<SignedReference, SignatureError> {
        let signature = dsig::find_signature(document).ok_or(SignatureError::Missing)?;
        let tagged = document
            .tag_id_attributes(&self.config.id_attributes)
            .map_err(|e| match e {
                XmlError::DuplicateId(id) => SignatureError::DuplicateId(id),
                other => SignatureError::Malformed(other.to_string()),
            })?;
        tracing::debug!(tagged, "Tagged ID attributes");

        dsig::verify_enveloped(
            document,
            signature,
            self.trust_anchor.public_key(),
            VerifyOptions {
                allow_sha1: self.config.allow_sha1,
            },
        )
    }
}

/// One parsed response and its signature validity.
#[derive(Debug)]
pub struct SamlResponse {
    document: Document,
    validity: Validity,
}

impl SamlResponse {
    pub fn is_valid(&self) -> bool {
        matches!(self.validity, Validity::Valid(_))
    }

    pub fn validity(&self) -> &Validity {
        &self.validity
    }

    pub fn invalid_reason(&self) -> Option<&SignatureError> {
        match &self.validity {
            Validity::Valid(_) => None,
            Validity::Invalid(reason) => Some(reason),
        }
    }

    /// Proof that the signature verified, giving access to trusted data.
    pub fn verified(&self) -> Result<VerifiedResponse<'_>, ResponseError> {
        match &self.validity {
            Validity::Valid(signed) => Ok(VerifiedResponse {
                document: &self.document,
                signed,
            }),
            Validity::Invalid(reason) => Err(ResponseError::Untrusted(reason.clone())),
        }
    }

    /// The subject NameID, only from a response whose signature verified.
    pub fn name_id(&self) -> Result<String, ResponseError> {
        self.verified()?.name_id()
    }

    /// The first `saml:NameID` anywhere in the document, whatever the
    /// signature state.
    ///
    /// This value is NOT trusted: it may sit outside the signed element or
    /// in a response with no valid signature at all. Use it for diagnostics
    /// only.
    pub fn untrusted_name_id(&self) -> Option<String> {
        self.document
            .find_descendant(self.document.root(), ASSERTION_NAMESPACE, "NameID")
            .map(|id| self.document.text_content(id).trim().to_string())
    }
}

/// Read access to a response whose signature verified.
///
/// Values are read from inside the signed element unless noted otherwise.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedResponse<'a> {
    document: &'a Document,
    signed: &'a SignedReference,
}

impl<'a> VerifiedResponse<'a> {
    pub fn signed_reference(&self) -> &'a SignedReference {
        self.signed
    }

    pub fn signed_element(&self) -> NodeId {
        self.signed.element
    }

    /// Identifier attribute value of the signed element.
    pub fn signed_element_id(&self) -> Option<&'a str> {
        self.document
            .element(self.signed.element)
            .and_then(|e| e.id_attribute())
            .map(|a| a.value())
    }

    /// First `saml:NameID` inside the signed element. Only its own character
    /// data counts; a NameID with child elements is rejected.
    pub fn name_id(&self) -> Result<String, ResponseError> {
        let id = self
            .find(ASSERTION_NAMESPACE, "NameID")
            .ok_or(ResponseError::NameIdNotFound)?;
        let value = self
            .document
            .leaf_text(id)
            .ok_or(ResponseError::NameIdNotText)?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ResponseError::NameIdNotFound);
        }
        Ok(value.to_string())
    }

    /// `Issuer` of the signed element.
    pub fn issuer(&self) -> Option<String> {
        self.document
            .find_child(self.signed.element, ASSERTION_NAMESPACE, "Issuer")
            .and_then(|id| self.document.leaf_text(id))
            .map(|value| value.trim().to_string())
    }

    /// Top-level `StatusCode` of the enclosing `Response`. It is covered by
    /// the signature only when the `Response` itself is the signed element.
    pub fn status_code(&self) -> Option<&'a str> {
        let root = self.document.root();
        let status = self.document.find_child(root, PROTOCOL_NAMESPACE, "Status")?;
        let code = self
            .document
            .find_child(status, PROTOCOL_NAMESPACE, "StatusCode")?;
        self.document.element(code)?.attribute("Value")
    }

    /// `InResponseTo` of the signed `Response`, or of the bearer
    /// `SubjectConfirmationData` when only the assertion is signed.
    pub fn in_response_to(&self) -> Option<&'a str> {
        let element = self.document.element(self.signed.element)?;
        if element.is(PROTOCOL_NAMESPACE, "Response") {
            return element.attribute("InResponseTo");
        }
        let data = self.find(ASSERTION_NAMESPACE, "SubjectConfirmationData")?;
        self.document.element(data)?.attribute("InResponseTo")
    }

    /// `SessionIndex` of the first `AuthnStatement`.
    pub fn session_index(&self) -> Option<&'a str> {
        let statement = self.find(ASSERTION_NAMESPACE, "AuthnStatement")?;
        self.document.element(statement)?.attribute("SessionIndex")
    }

    /// Check the assertion's `Conditions`: the validity window, widened by
    /// `skew` on both ends, and, when `audience` is given, every
    /// `AudienceRestriction`. A missing `Conditions` element imposes nothing.
    pub fn check_conditions(
        &self,
        now: DateTime<Utc>,
        audience: Option<&str>,
        skew: Duration,
    ) -> Result<(), ConditionError> {
        let Some(conditions) = self.find(ASSERTION_NAMESPACE, "Conditions") else {
            return Ok(());
        };
        let Some(element) = self.document.element(conditions) else {
            return Ok(());
        };

        if let Some(value) = element.attribute("NotBefore") {
            let not_before = parse_instant(value)?;
            if now + skew < not_before {
                return Err(ConditionError::NotYetValid(not_before));
            }
        }
        if let Some(value) = element.attribute("NotOnOrAfter") {
            let not_on_or_after = parse_instant(value)?;
            if now - skew >= not_on_or_after {
                return Err(ConditionError::Expired(not_on_or_after));
            }
        }

        if let Some(expected) = audience {
            let restrictions = self.document.child_elements(conditions).filter(|id| {
                self.document
                    .element(*id)
                    .is_some_and(|e| e.is(ASSERTION_NAMESPACE, "AudienceRestriction"))
            });
            for restriction in restrictions {
                let matched = self.document.child_elements(restriction).any(|id| {
                    self.document
                        .element(id)
                        .is_some_and(|e| e.is(ASSERTION_NAMESPACE, "Audience"))
                        && self
                            .document
                            .leaf_text(id)
                            .is_some_and(|value| value.trim() == expected)
                });
                if !matched {
                    return Err(ConditionError::AudienceMismatch(expected.to_string()));
                }
            }
        }

        Ok(())
    }

    fn find(&self, namespace: &str, local_name: &str) -> Option<NodeId> {
        self.document
            .find_descendant(self.signed.element, namespace, local_name)
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, ConditionError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|_| ConditionError::InvalidTimestamp(value.to_string()))
}
