//! Stream, IQ and feature-negotiation records.

use crate::namespace;

/// Endpoint names exchanged when a stream is opened.
///
/// `identity` comes from the wire `to` attribute (the name the peer uses for
/// us) and `other` from the wire `from` attribute (the peer's own name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stream {
    pub identity: String,
    pub other: String,
}

impl Stream {
    pub fn new(identity: impl Into<String>, other: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            other: other.into(),
        }
    }
}

/// Context of the IQ stanza currently being parsed.
///
/// Nested payloads (`<file>`, `<feature>`, `<query>`) recover the request id
/// and the endpoint names from here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IqContext {
    pub identity: String,
    pub other: String,
    pub id: String,
    pub kind: String,
}

/// One feature-negotiation exchange tied to an IQ request id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureNeg {
    /// Id of the enclosing IQ request
    pub request_id: String,

    /// Offered option values, in document order
    pub offered: Vec<String>,
}

impl FeatureNeg {
    pub fn new(iq: &IqContext) -> Self {
        Self {
            request_id: iq.id.clone(),
            offered: Vec::new(),
        }
    }

    /// Returns true if SOCKS5 bytestreams is among the offered methods.
    pub fn offers_bytestreams(&self) -> bool {
        self.offered.iter().any(|v| v == namespace::BYTESTREAMS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_neg_from_iq() {
        let iq = IqContext {
            identity: "me".into(),
            other: "you".into(),
            id: "req-1".into(),
            kind: "set".into(),
        };
        let mut fneg = FeatureNeg::new(&iq);
        assert_eq!(fneg.request_id, "req-1");
        assert!(!fneg.offers_bytestreams());

        fneg.offered.push("http://jabber.org/protocol/ibb".into());
        fneg.offered.push(namespace::BYTESTREAMS.into());
        assert!(fneg.offers_bytestreams());
    }
}
