//! Pinned IdP signing certificate.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, PKeyRef, Public},
    x509::X509,
};

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("certificate is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("certificate is empty")]
    Empty,

    #[error("not a DER-encoded X.509 certificate: {0}")]
    X509(openssl::error::ErrorStack),

    #[error("failed to extract certificate public key: {0}")]
    PublicKey(openssl::error::ErrorStack),
}

/// The single X.509 certificate an IdP's responses are verified against.
///
/// No chain, expiry or revocation checks are made: the certificate is
/// trusted because it was configured, and only its public key is used.
pub struct TrustAnchor {
    certificate: X509,
    public_key: PKey<Public>,
    fingerprint: String,
}

impl std::fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("subject", &self.subject())
            .field("fingerprint_sha256", &self.fingerprint)
            .finish()
    }
}

impl TrustAnchor {
    /// Load from base64-encoded DER. ASCII whitespace (including the line
    /// breaks of wrapped metadata values) is ignored.
    pub fn from_base64(encoded: impl AsRef<[u8]>) -> Result<Self, CertificateError> {
        let compact: Vec<u8> = encoded
            .as_ref()
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if compact.is_empty() {
            return Err(CertificateError::Empty);
        }
        let der = STANDARD.decode(&compact)?;
        Self::from_der(&der)
    }

    /// Load from PEM-armored text. The armor lines are dropped and the body
    /// is decoded as base64.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        Self::from_base64(strip_pem_armor(pem))
    }

    /// Load from either PEM or bare base64, detected by the presence of armor.
    pub fn parse(value: &str) -> Result<Self, CertificateError> {
        if value.contains("-----BEGIN") {
            Self::from_pem(value)
        } else {
            Self::from_base64(value)
        }
    }

    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let certificate = X509::from_der(der).map_err(CertificateError::X509)?;
        let public_key = certificate
            .public_key()
            .map_err(CertificateError::PublicKey)?;
        let fingerprint = certificate
            .digest(MessageDigest::sha256())
            .map(|digest| hex::encode(&digest[..]))
            .map_err(CertificateError::X509)?;

        tracing::debug!(fingerprint_sha256 = %fingerprint, "Loaded IdP trust anchor");

        Ok(Self {
            certificate,
            public_key,
            fingerprint,
        })
    }

    /// The verification key. Only the public half is ever held.
    pub fn public_key(&self) -> &PKeyRef<Public> {
        &self.public_key
    }

    /// Lowercase hex SHA-256 of the DER certificate.
    pub fn fingerprint_sha256(&self) -> &str {
        &self.fingerprint
    }

    /// Subject common name, falling back to the first subject entry.
    pub fn subject(&self) -> String {
        let name = self.certificate.subject_name();
        name.entries_by_nid(Nid::COMMONNAME)
            .next()
            .or_else(|| name.entries().next())
            .and_then(|entry| entry.data().to_string().ok())
            .unwrap_or_default()
    }
}

fn strip_pem_armor(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use openssl::{
        asn1::Asn1Time,
        bn::BigNum,
        rsa::Rsa,
        x509::{X509Builder, X509NameBuilder},
    };

    use super::*;
    use crate::tests::fixtures::{JSR105_EC_CERTIFICATE, JSR105_RSA_CERTIFICATE, TestIdp};

    #[test]
    fn test_strip_pem_armor() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\nkTCB\n-----END CERTIFICATE-----\n";
        assert_eq!(strip_pem_armor(pem), "MIIBkTCB");
    }

    #[test]
    fn test_from_base64_and_pem_agree() {
        let idp = TestIdp::rsa();
        let from_b64 = TrustAnchor::from_base64(idp.certificate_base64()).unwrap();
        let from_pem = TrustAnchor::from_pem(&idp.certificate_pem()).unwrap();
        assert_eq!(from_b64.fingerprint_sha256(), from_pem.fingerprint_sha256());
        assert_eq!(from_b64.fingerprint_sha256().len(), 64);
        assert!(from_b64.public_key().public_eq(&idp.public_key()));
    }

    #[test]
    fn test_parse_detects_armor() {
        let idp = TestIdp::rsa();
        let pem = TrustAnchor::parse(&idp.certificate_pem()).unwrap();
        let bare = TrustAnchor::parse(&idp.certificate_base64()).unwrap();
        assert_eq!(pem.fingerprint_sha256(), bare.fingerprint_sha256());
        assert_eq!(pem.subject(), "test-idp.example.com");
    }

    #[test]
    fn test_subject_of_externally_issued_certificates() {
        let rsa = TrustAnchor::parse(JSR105_RSA_CERTIFICATE).unwrap();
        assert_eq!(rsa.subject(), "jsr105-idp.example.com");
        let ec = TrustAnchor::parse(JSR105_EC_CERTIFICATE).unwrap();
        assert_eq!(ec.subject(), "jsr105-ec-idp.example.com");
    }

    #[test]
    fn test_subject_keeps_non_ascii_common_name() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "Identité Société").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let der = builder.build().to_der().unwrap();

        let anchor = TrustAnchor::from_der(&der).unwrap();
        assert_eq!(anchor.subject(), "Identité Société");
    }

    #[test]
    fn test_wrapped_base64_is_accepted() {
        let idp = TestIdp::rsa();
        let wrapped: String = idp
            .certificate_base64()
            .as_bytes()
            .chunks(64)
            .map(|chunk| format!("  {}\r\n", std::str::from_utf8(chunk).unwrap()))
            .collect();
        assert!(TrustAnchor::from_base64(wrapped).is_ok());
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            TrustAnchor::from_base64("not base64!"),
            Err(CertificateError::Base64(_))
        ));
        assert!(matches!(
            TrustAnchor::from_base64("aGVsbG8gd29ybGQ="),
            Err(CertificateError::X509(_))
        ));
        assert!(matches!(
            TrustAnchor::from_base64(" \n "),
            Err(CertificateError::Empty)
        ));
    }
}
