//! Outbound `AuthnRequest` construction.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::{
    Writer,
    events::{BytesEnd, BytesStart, BytesText, Event},
};
use uuid::Uuid;

use super::{
    ASSERTION_NAMESPACE, PROTOCOL_NAMESPACE,
    encoding::{base64_encode, encode_outbound, url_encode},
};
use crate::config::{IdpConfig, SpConfig};

/// SAML 2.0 protocol binding the IdP should answer with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Binding {
    #[default]
    HttpRedirect,
    HttpPost,
}

impl Binding {
    pub fn urn(self) -> &'static str {
        match self {
            Binding::HttpRedirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Binding::HttpPost => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
        }
    }
}

/// Transport encoding of a serialized request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestEncoding {
    /// The XML text itself.
    Raw,
    /// Chunked base64 (CRLF after every 76 characters).
    Base64,
    /// Percent-encoded XML text.
    Url,
    /// Base64 with line breaks removed, then percent-encoded.
    #[default]
    Base64Url,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthRequestError {
    #[error("failed to serialize AuthnRequest: {0}")]
    Serialize(#[from] std::io::Error),

    #[error("serialized AuthnRequest is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid IdP SSO URL: {0}")]
    InvalidSsoUrl(#[from] url::ParseError),
}

/// One outbound authentication request.
///
/// The identifier and issue instant are fixed at construction, so repeated
/// serialization yields the same document.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    id: String,
    issue_instant: DateTime<Utc>,
    sp: SpConfig,
}

impl AuthRequest {
    pub fn new(sp: &SpConfig) -> Self {
        Self {
            id: format!("_{}", Uuid::new_v4()),
            issue_instant: Utc::now(),
            sp: sp.clone(),
        }
    }

    /// The request `ID`, to be matched against a response's `InResponseTo`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `IssueInstant` in UTC with second precision, e.g. `2026-01-01T09:30:00Z`.
    pub fn issue_instant(&self) -> String {
        self.issue_instant.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    pub fn serialize(&self, binding: Binding) -> Result<Vec<u8>, AuthRequestError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let issue_instant = self.issue_instant();

        let mut root = BytesStart::new("samlp:AuthnRequest");
        root.push_attribute(("xmlns:samlp", PROTOCOL_NAMESPACE));
        root.push_attribute(("xmlns:saml", ASSERTION_NAMESPACE));
        root.push_attribute(("ID", self.id.as_str()));
        root.push_attribute(("Version", "2.0"));
        root.push_attribute(("IssueInstant", issue_instant.as_str()));
        root.push_attribute(("ProtocolBinding", binding.urn()));
        root.push_attribute(("AssertionConsumerServiceURL", self.sp.acs_url.as_str()));
        if self.sp.force_authn {
            root.push_attribute(("ForceAuthn", "true"));
        }
        writer.write_event(Event::Start(root))?;

        writer.write_event(Event::Start(BytesStart::new("saml:Issuer")))?;
        writer.write_event(Event::Text(BytesText::new(&self.sp.issuer)))?;
        writer.write_event(Event::End(BytesEnd::new("saml:Issuer")))?;

        let mut policy = BytesStart::new("samlp:NameIDPolicy");
        policy.push_attribute(("Format", self.sp.name_id_format.as_str()));
        policy.push_attribute(("AllowCreate", "true"));
        writer.write_event(Event::Empty(policy))?;

        let mut context = BytesStart::new("samlp:RequestedAuthnContext");
        context.push_attribute(("Comparison", "exact"));
        writer.write_event(Event::Start(context))?;
        writer.write_event(Event::Start(BytesStart::new("saml:AuthnContextClassRef")))?;
        writer.write_event(Event::Text(BytesText::new(&self.sp.authn_context_class_ref)))?;
        writer.write_event(Event::End(BytesEnd::new("saml:AuthnContextClassRef")))?;
        writer.write_event(Event::End(BytesEnd::new("samlp:RequestedAuthnContext")))?;

        writer.write_event(Event::End(BytesEnd::new("samlp:AuthnRequest")))?;

        let xml = writer.into_inner().into_inner();
        tracing::debug!(
            request_id = %self.id,
            binding = binding.urn(),
            xml_len = xml.len(),
            "Serialized AuthnRequest"
        );
        Ok(xml)
    }

    pub fn encode(
        &self,
        binding: Binding,
        encoding: RequestEncoding,
    ) -> Result<String, AuthRequestError> {
        let xml = self.serialize(binding)?;
        Ok(match encoding {
            RequestEncoding::Raw => String::from_utf8(xml)?,
            RequestEncoding::Base64 => base64_encode(&xml, true),
            RequestEncoding::Url => url_encode(&String::from_utf8(xml)?),
            RequestEncoding::Base64Url => encode_outbound(&xml),
        })
    }

    /// The IdP SSO URL carrying this request as `SAMLRequest` (unchunked
    /// base64) and, when given, `RelayState`. Existing query parameters of
    /// the SSO URL are kept.
    pub fn redirect_url(
        &self,
        binding: Binding,
        idp: &IdpConfig,
        relay_state: Option<&str>,
    ) -> Result<url::Url, AuthRequestError> {
        let mut url = url::Url::parse(&idp.sso_url)?;
        let request = base64_encode(&self.serialize(binding)?, false);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("SAMLRequest", &request);
            if let Some(relay_state) = relay_state.filter(|s| !s.is_empty()) {
                query.append_pair("RelayState", relay_state);
            }
        }
        tracing::debug!(
            request_id = %self.id,
            sso_url = %idp.sso_url,
            "Generated SAML AuthnRequest URL"
        );
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rstest::rstest;

    use super::*;
    use crate::{
        saml::encoding::{base64_decode, decode_inbound, url_decode},
        xml::Document,
    };

    fn sp() -> SpConfig {
        SpConfig::new(
            "https://sp.example.com/metadata",
            "https://sp.example.com/saml/acs?tenant=a&b=c",
        )
    }

    fn idp() -> IdpConfig {
        IdpConfig {
            certificate: String::new(),
            sso_url: "https://idp.example.com/sso?app=42".to_string(),
        }
    }

    fn parse(xml: &str) -> Document {
        Document::parse(xml).unwrap()
    }

    #[test]
    fn test_document_structure() {
        let request = AuthRequest::new(&sp());
        let xml = String::from_utf8(request.serialize(Binding::HttpPost).unwrap()).unwrap();
        let doc = parse(&xml);

        let root = doc.element(doc.root()).unwrap();
        assert!(root.is(PROTOCOL_NAMESPACE, "AuthnRequest"));
        assert_eq!(root.prefix(), Some("samlp"));
        assert_eq!(root.attribute("ID"), Some(request.id()));
        assert_eq!(root.attribute("Version"), Some("2.0"));
        assert_eq!(
            root.attribute("IssueInstant"),
            Some(request.issue_instant().as_str())
        );
        assert_eq!(root.attribute("ProtocolBinding"), Some(Binding::HttpPost.urn()));
        assert_eq!(
            root.attribute("AssertionConsumerServiceURL"),
            Some("https://sp.example.com/saml/acs?tenant=a&b=c")
        );
        assert_eq!(root.attribute("ForceAuthn"), None);

        let children: Vec<String> = doc
            .child_elements(doc.root())
            .map(|id| doc.element(id).unwrap().qualified_name())
            .collect();
        assert_eq!(
            children,
            ["saml:Issuer", "samlp:NameIDPolicy", "samlp:RequestedAuthnContext"]
        );

        let policy = doc
            .find_child(doc.root(), PROTOCOL_NAMESPACE, "NameIDPolicy")
            .unwrap();
        let policy = doc.element(policy).unwrap();
        assert_eq!(
            policy.attribute("Format"),
            Some("urn:oasis:names:tc:SAML:2.0:nameid-format:unspecified")
        );
        assert_eq!(policy.attribute("AllowCreate"), Some("true"));

        let context = doc
            .find_child(doc.root(), PROTOCOL_NAMESPACE, "RequestedAuthnContext")
            .unwrap();
        assert_eq!(doc.element(context).unwrap().attribute("Comparison"), Some("exact"));
        let class_ref = doc
            .find_child(context, ASSERTION_NAMESPACE, "AuthnContextClassRef")
            .unwrap();
        assert_eq!(
            doc.text_content(class_ref),
            "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport"
        );
    }

    #[test]
    fn test_force_authn() {
        let sp = SpConfig {
            force_authn: true,
            ..sp()
        };
        let xml = AuthRequest::new(&sp)
            .encode(Binding::HttpRedirect, RequestEncoding::Raw)
            .unwrap();
        let doc = parse(&xml);
        assert_eq!(
            doc.element(doc.root()).unwrap().attribute("ForceAuthn"),
            Some("true")
        );
    }

    #[test]
    fn test_encoded_request_round_trips() {
        let sp = sp();
        let encoded = AuthRequest::new(&sp)
            .encode(Binding::HttpRedirect, RequestEncoding::Base64Url)
            .unwrap();
        assert!(!encoded.contains('\r') && !encoded.contains('\n'));

        let xml = decode_inbound(&encoded, true).unwrap();
        assert_eq!(xml.matches("AssertionConsumerServiceURL=").count(), 1);

        let doc = parse(&xml);
        assert_eq!(
            doc.element(doc.root()).unwrap().attribute("AssertionConsumerServiceURL"),
            Some(sp.acs_url.as_str())
        );
        let issuers: Vec<_> = doc
            .descendants(doc.root())
            .filter(|id| {
                doc.element(*id)
                    .is_some_and(|e| e.is(ASSERTION_NAMESPACE, "Issuer"))
            })
            .collect();
        assert_eq!(issuers.len(), 1);
        assert_eq!(doc.text_content(issuers[0]), sp.issuer);
    }

    #[rstest]
    #[case(RequestEncoding::Raw)]
    #[case(RequestEncoding::Base64)]
    #[case(RequestEncoding::Url)]
    #[case(RequestEncoding::Base64Url)]
    fn test_encodings_reverse_to_the_same_document(#[case] encoding: RequestEncoding) {
        let request = AuthRequest::new(&sp());
        let raw = String::from_utf8(request.serialize(Binding::HttpRedirect).unwrap()).unwrap();
        let encoded = request.encode(Binding::HttpRedirect, encoding).unwrap();
        let decoded = match encoding {
            RequestEncoding::Raw => encoded,
            RequestEncoding::Base64 => {
                String::from_utf8(base64_decode(&encoded).unwrap()).unwrap()
            }
            RequestEncoding::Url => url_decode(&encoded).unwrap(),
            RequestEncoding::Base64Url => decode_inbound(&encoded, true).unwrap(),
        };
        assert_eq!(decoded, raw);
    }

    #[test]
    fn test_ids_are_unique() {
        let sp = sp();
        let ids: HashSet<String> = (0..10_000)
            .map(|_| AuthRequest::new(&sp).id().to_string())
            .collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| id.starts_with('_')));
    }

    #[test]
    fn test_issue_instant_format() {
        let pattern = regex::Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$").unwrap();
        let instant = AuthRequest::new(&sp()).issue_instant();
        assert!(pattern.is_match(&instant), "{instant}");
    }

    #[test]
    fn test_special_characters_are_escaped() {
        let sp = SpConfig::new("urn:example:<sp>&\"co\"", "https://sp.example.com/acs");
        let xml = AuthRequest::new(&sp)
            .encode(Binding::HttpRedirect, RequestEncoding::Raw)
            .unwrap();
        let doc = parse(&xml);
        let issuer = doc
            .find_child(doc.root(), ASSERTION_NAMESPACE, "Issuer")
            .unwrap();
        assert_eq!(doc.text_content(issuer), "urn:example:<sp>&\"co\"");
    }

    #[test]
    fn test_redirect_url() {
        let request = AuthRequest::new(&sp());
        let url = request
            .redirect_url(Binding::HttpRedirect, &idp(), Some("/dashboard?tab=1"))
            .unwrap();
        assert_eq!(url.host_str(), Some("idp.example.com"));

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("app".to_string(), "42".to_string()));
        assert_eq!(pairs[1].0, "SAMLRequest");
        assert_eq!(pairs[2], ("RelayState".to_string(), "/dashboard?tab=1".to_string()));

        let xml = String::from_utf8(base64_decode(&pairs[1].1).unwrap()).unwrap();
        let doc = parse(&xml);
        assert_eq!(
            doc.element(doc.root()).unwrap().attribute("ID"),
            Some(request.id())
        );
    }

    #[test]
    fn test_redirect_url_without_relay_state() {
        let url = AuthRequest::new(&sp())
            .redirect_url(Binding::HttpRedirect, &idp(), None)
            .unwrap();
        assert!(url.query_pairs().all(|(key, _)| key != "RelayState"));
    }

    #[test]
    fn test_redirect_url_rejects_invalid_sso_url() {
        let idp = IdpConfig {
            certificate: String::new(),
            sso_url: "not a url".to_string(),
        };
        assert!(matches!(
            AuthRequest::new(&sp()).redirect_url(Binding::HttpRedirect, &idp, None),
            Err(AuthRequestError::InvalidSsoUrl(_))
        ));
    }
}
