//! Transport encodings for SAML messages.
//!
//! Outbound requests are base64-encoded in MIME-chunked form, stripped of
//! line breaks and percent-encoded. Inbound responses are optionally
//! percent-decoded and then base64-decoded.

use base64::{Engine, engine::general_purpose::STANDARD};

/// Line length of chunked base64 output (RFC 2045).
pub const CHUNK_SIZE: usize = 76;

const CRLF: &str = "\r\n";

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Standard base64 with padding. In chunked mode every line of at most
/// [`CHUNK_SIZE`] characters, including the last, ends with CRLF.
pub fn base64_encode(bytes: &[u8], chunked: bool) -> String {
    let encoded = STANDARD.encode(bytes);
    if !chunked || encoded.is_empty() {
        return encoded;
    }

    let mut out = String::with_capacity(encoded.len() + encoded.len() / CHUNK_SIZE * 2 + 2);
    for line in encoded.as_bytes().chunks(CHUNK_SIZE) {
        out.extend(line.iter().map(|b| char::from(*b)));
        out.push_str(CRLF);
    }
    out
}

/// Decode standard base64, ignoring ASCII whitespace anywhere in the input.
pub fn base64_decode(encoded: &str) -> Result<Vec<u8>, EncodingError> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    Ok(STANDARD.decode(compact)?)
}

/// Remove every CRLF pair.
pub fn strip_crlf(value: &str) -> String {
    value.replace(CRLF, "")
}

/// RFC 3986 percent-encoding of the UTF-8 bytes of `value`.
pub fn url_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Percent-decoding. `+` is left as is, so decoding base64 text that was
/// never URL-encoded is harmless.
pub fn url_decode(value: &str) -> Result<String, EncodingError> {
    Ok(urlencoding::decode(value)?.into_owned())
}

/// Encoding applied to an outbound `SAMLRequest` value.
pub fn encode_outbound(xml: &[u8]) -> String {
    url_encode(&strip_crlf(&base64_encode(xml, true)))
}

/// Decode an inbound `SAMLResponse` value to XML text.
pub fn decode_inbound(input: &str, url_encoded: bool) -> Result<String, EncodingError> {
    let bytes = if url_encoded {
        base64_decode(&url_decode(input)?)?
    } else {
        base64_decode(input)?
    };
    Ok(String::from_utf8(bytes)?)
}
