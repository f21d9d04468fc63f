//! XML-DSig core validation for enveloped signatures.
//!
//! Supports a single same-document `Reference` (`URI=""` or `URI="#id"`)
//! with the enveloped-signature transform and one canonicalization
//! transform. Digests and signature checks are delegated to OpenSSL.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::{MessageDigest, hash},
    memcmp,
    pkey::{Id, PKeyRef, Public},
    sign::Verifier,
};
use tracing::debug;

use super::{
    c14n::{C14nAlgorithm, Canonicalizer},
    document::{Document, NodeId},
};

pub const DSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const EXC_C14N_NAMESPACE: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Reasons an enveloped signature fails core validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("no XML-DSig Signature element found")]
    Missing,

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("ID value '{0}' is used by more than one element")]
    DuplicateId(String),

    #[error("expected exactly one Reference, found {0}")]
    ReferenceCount(usize),

    #[error("unsupported reference URI '{0}'")]
    UnsupportedReference(String),

    #[error("reference '{0}' does not resolve to an element")]
    UnresolvedReference(String),

    #[error("signature is not a child of the element it references")]
    NotEnveloped,

    #[error("unsupported transform '{0}'")]
    UnsupportedTransform(String),

    #[error("unsupported canonicalization method '{0}'")]
    UnsupportedCanonicalization(String),

    #[error("unsupported digest method '{0}'")]
    UnsupportedDigest(String),

    #[error("unsupported signature method '{0}'")]
    UnsupportedSignatureMethod(String),

    #[error("SHA-1 based algorithms are disabled")]
    Sha1Disabled,

    #[error("digest of the referenced content does not match DigestValue")]
    DigestMismatch,

    #[error("trust anchor key does not match signature method '{0}'")]
    KeyMismatch(String),

    #[error("signature value does not verify against the trust anchor")]
    BadSignature,

    #[error("cryptographic backend error: {0}")]
    Crypto(String),
}

impl From<openssl::error::ErrorStack> for SignatureError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::Crypto(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(Self::Sha1),
            "http://www.w3.org/2001/04/xmldsig-more#sha224" => Some(Self::Sha224),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(Self::Sha256),
            "http://www.w3.org/2001/04/xmldsig-more#sha384" => Some(Self::Sha384),
            "http://www.w3.org/2001/04/xmlenc#sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha224 => "http://www.w3.org/2001/04/xmldsig-more#sha224",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha224 => MessageDigest::sha224(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Rsa(DigestAlgorithm),
    Ecdsa(DigestAlgorithm),
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        use DigestAlgorithm::*;
        match uri {
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Some(Self::Rsa(Sha1)),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha224" => Some(Self::Rsa(Sha224)),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Some(Self::Rsa(Sha256)),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Some(Self::Rsa(Sha384)),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Some(Self::Rsa(Sha512)),
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha1" => Some(Self::Ecdsa(Sha1)),
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha224" => Some(Self::Ecdsa(Sha224)),
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256" => Some(Self::Ecdsa(Sha256)),
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384" => Some(Self::Ecdsa(Sha384)),
            "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512" => Some(Self::Ecdsa(Sha512)),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        use DigestAlgorithm::*;
        match self {
            Self::Rsa(Sha1) => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::Rsa(Sha224) => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha224",
            Self::Rsa(Sha256) => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::Rsa(Sha384) => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            Self::Rsa(Sha512) => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            Self::Ecdsa(Sha1) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha1",
            Self::Ecdsa(Sha224) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha224",
            Self::Ecdsa(Sha256) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
            Self::Ecdsa(Sha384) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384",
            Self::Ecdsa(Sha512) => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512",
        }
    }

    pub fn digest(self) -> DigestAlgorithm {
        match self {
            Self::Rsa(digest) | Self::Ecdsa(digest) => digest,
        }
    }
}

/// Verification policy knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOptions {
    pub allow_sha1: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self { allow_sha1: true }
    }
}

/// Outcome of a successful core validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedReference {
    /// The `ds:Signature` element that was checked.
    pub signature: NodeId,
    /// The element covered by the signature.
    pub element: NodeId,
    /// The `Reference/@URI` as written.
    pub uri: String,
    pub digest_algorithm: DigestAlgorithm,
    pub signature_algorithm: SignatureAlgorithm,
}

/// First `ds:Signature` element in document order.
pub fn find_signature(document: &Document) -> Option<NodeId> {
    document.find_descendant(document.root(), DSIG_NAMESPACE, "Signature")
}

/// Run core validation of the enveloped signature at `signature` against
/// `key`. Identifier attributes must already be tagged on `document` for
/// `#id` references to resolve.
pub fn verify_enveloped(
    document: &Document,
    signature: NodeId,
    key: &PKeyRef<Public>,
    options: VerifyOptions,
) -> Result<SignedReference, SignatureError> {
    let signed_info = document
        .child_elements(signature)
        .next()
        .filter(|id| {
            document
                .element(*id)
                .is_some_and(|e| e.is(DSIG_NAMESPACE, "SignedInfo"))
        })
        .ok_or_else(|| malformed("Signature must start with SignedInfo"))?;

    let c14n_method = child(document, signed_info, "CanonicalizationMethod")?;
    let c14n_uri = algorithm_attribute(document, c14n_method)?;
    let signed_info_c14n = C14nAlgorithm::from_uri(c14n_uri)
        .ok_or_else(|| SignatureError::UnsupportedCanonicalization(c14n_uri.to_string()))?;
    let signed_info_prefixes = inclusive_prefixes(document, c14n_method);

    let signature_method = child(document, signed_info, "SignatureMethod")?;
    let signature_uri = algorithm_attribute(document, signature_method)?;
    let signature_algorithm = SignatureAlgorithm::from_uri(signature_uri)
        .ok_or_else(|| SignatureError::UnsupportedSignatureMethod(signature_uri.to_string()))?;
    check_sha1(signature_algorithm.digest(), options)?;

    let references: Vec<NodeId> = document
        .child_elements(signed_info)
        .filter(|id| {
            document
                .element(*id)
                .is_some_and(|e| e.is(DSIG_NAMESPACE, "Reference"))
        })
        .collect();
    let &[reference] = references.as_slice() else {
        return Err(SignatureError::ReferenceCount(references.len()));
    };

    let uri = document
        .element(reference)
        .and_then(|e| e.attribute("URI"))
        .ok_or_else(|| malformed("Reference has no URI attribute"))?;
    let element = resolve_reference(document, uri)?;
    // Enveloped means a direct child of the signed element.
    if document.node(signature).parent() != Some(element) {
        return Err(SignatureError::NotEnveloped);
    }

    let canonicalizer = reference_canonicalizer(document, reference, signature)?;

    let digest_method = child(document, reference, "DigestMethod")?;
    let digest_uri = algorithm_attribute(document, digest_method)?;
    let digest_algorithm = DigestAlgorithm::from_uri(digest_uri)
        .ok_or_else(|| SignatureError::UnsupportedDigest(digest_uri.to_string()))?;
    check_sha1(digest_algorithm, options)?;

    let expected_digest = base64_child(document, reference, "DigestValue")?;
    let canonical = canonicalizer.canonicalize(document, element);
    let actual_digest = hash(digest_algorithm.message_digest(), canonical.as_bytes())?;
    debug!(
        uri,
        canonical_len = canonical.len(),
        digest = ?digest_algorithm,
        "Computed reference digest"
    );
    if expected_digest.len() != actual_digest.len()
        || !memcmp::eq(&expected_digest, &actual_digest)
    {
        return Err(SignatureError::DigestMismatch);
    }

    let signed_info_bytes = Canonicalizer::new(signed_info_c14n)
        .with_inclusive_prefixes(signed_info_prefixes)
        .canonicalize(document, signed_info);
    let signature_value = base64_child(document, signature, "SignatureValue")?;
    verify_signature_value(
        signature_algorithm,
        key,
        &signature_value,
        signed_info_bytes.as_bytes(),
    )?;

    debug!(uri, algorithm = signature_algorithm.uri(), "Signature verified");
    Ok(SignedReference {
        signature,
        element,
        uri: uri.to_string(),
        digest_algorithm,
        signature_algorithm,
    })
}

fn malformed(message: &str) -> SignatureError {
    SignatureError::Malformed(message.to_string())
}

fn child(document: &Document, parent: NodeId, local_name: &str) -> Result<NodeId, SignatureError> {
    document
        .find_child(parent, DSIG_NAMESPACE, local_name)
        .ok_or_else(|| SignatureError::Malformed(format!("missing {local_name} element")))
}

fn algorithm_attribute(document: &Document, node: NodeId) -> Result<&str, SignatureError> {
    document
        .element(node)
        .and_then(|e| e.attribute("Algorithm"))
        .ok_or_else(|| malformed("missing Algorithm attribute"))
}

/// `ec:InclusiveNamespaces/@PrefixList` below a method or transform element.
fn inclusive_prefixes(document: &Document, node: NodeId) -> Vec<String> {
    document
        .find_child(node, EXC_C14N_NAMESPACE, "InclusiveNamespaces")
        .and_then(|id| document.element(id))
        .and_then(|e| e.attribute("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn check_sha1(digest: DigestAlgorithm, options: VerifyOptions) -> Result<(), SignatureError> {
    if digest == DigestAlgorithm::Sha1 && !options.allow_sha1 {
        return Err(SignatureError::Sha1Disabled);
    }
    Ok(())
}

fn resolve_reference(document: &Document, uri: &str) -> Result<NodeId, SignatureError> {
    if uri.is_empty() {
        return Ok(document.root());
    }
    let Some(fragment) = uri.strip_prefix('#') else {
        return Err(SignatureError::UnsupportedReference(uri.to_string()));
    };
    if fragment.is_empty() || fragment.starts_with("xpointer(") {
        return Err(SignatureError::UnsupportedReference(uri.to_string()));
    }
    document
        .element_by_id(fragment)
        .ok_or_else(|| SignatureError::UnresolvedReference(uri.to_string()))
}

/// Build the canonicalizer described by the reference's transform chain.
/// The chain must contain the enveloped-signature transform and at most one
/// canonicalization transform; inclusive C14N 1.0 applies when none is given.
fn reference_canonicalizer(
    document: &Document,
    reference: NodeId,
    signature: NodeId,
) -> Result<Canonicalizer, SignatureError> {
    let mut enveloped = false;
    let mut c14n: Option<(C14nAlgorithm, Vec<String>)> = None;

    if let Some(transforms) = document.find_child(reference, DSIG_NAMESPACE, "Transforms") {
        for transform in document.child_elements(transforms) {
            let is_transform = document
                .element(transform)
                .is_some_and(|e| e.is(DSIG_NAMESPACE, "Transform"));
            if !is_transform {
                continue;
            }
            let algorithm = algorithm_attribute(document, transform)?;
            if algorithm == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else if let Some(method) = C14nAlgorithm::from_uri(algorithm) {
                if c14n.is_some() {
                    return Err(malformed("more than one canonicalization transform"));
                }
                c14n = Some((method, inclusive_prefixes(document, transform)));
            } else {
                return Err(SignatureError::UnsupportedTransform(algorithm.to_string()));
            }
        }
    }

    if !enveloped {
        return Err(SignatureError::NotEnveloped);
    }
    let (method, prefixes) = c14n.unwrap_or((C14nAlgorithm::Inclusive, Vec::new()));
    Ok(Canonicalizer::new(method)
        .with_inclusive_prefixes(prefixes)
        .excluding(signature)
        .without_comments())
}

fn base64_child(
    document: &Document,
    parent: NodeId,
    local_name: &str,
) -> Result<Vec<u8>, SignatureError> {
    let node = child(document, parent, local_name)?;
    let text: String = document
        .text_content(node)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(text)
        .map_err(|e| SignatureError::Malformed(format!("{local_name} is not base64: {e}")))
}

fn verify_signature_value(
    algorithm: SignatureAlgorithm,
    key: &PKeyRef<Public>,
    signature: &[u8],
    data: &[u8],
) -> Result<(), SignatureError> {
    let signature = match algorithm {
        SignatureAlgorithm::Rsa(_) => {
            if key.id() != Id::RSA {
                return Err(SignatureError::KeyMismatch(algorithm.uri().to_string()));
            }
            signature.to_vec()
        }
        SignatureAlgorithm::Ecdsa(_) => {
            if key.id() != Id::EC {
                return Err(SignatureError::KeyMismatch(algorithm.uri().to_string()));
            }
            ecdsa_to_der(signature)?
        }
    };

    let mut verifier = Verifier::new(algorithm.digest().message_digest(), key)?;
    match verifier.verify_oneshot(&signature, data) {
        Ok(true) => Ok(()),
        Ok(false) => Err(SignatureError::BadSignature),
        Err(e) => {
            debug!(error = %e, "Signature verification rejected by OpenSSL");
            Err(SignatureError::BadSignature)
        }
    }
}

/// XML-DSig carries ECDSA signatures as the raw `r || s` concatenation;
/// OpenSSL expects a DER `ECDSA-Sig-Value`.
fn ecdsa_to_der(raw: &[u8]) -> Result<Vec<u8>, SignatureError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(SignatureError::BadSignature);
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let signature = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
    Ok(signature.to_der()?)
}
