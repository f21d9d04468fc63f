//! XML substrate for response validation: a namespace-aware document tree,
//! the canonicalization serializers and enveloped-signature verification.

pub mod c14n;
pub mod document;
pub mod dsig;

pub use c14n::{C14nAlgorithm, Canonicalizer};
pub use document::{Document, NodeId, ParseLimits, XmlError};
pub use dsig::{SignatureError, SignedReference, VerifyOptions};
