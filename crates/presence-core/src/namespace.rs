//! XML namespaces and fixed protocol identifiers.

/// Client stream namespace (default namespace of `<stream:stream>`)
pub const JABBER_CLIENT: &str = "jabber:client";

/// Stream prefix namespace
pub const STREAMS: &str = "http://etherx.jabber.org/streams";

/// XHTML-IM payload namespace
pub const XHTML: &str = "http://www.w3.org/1999/xhtml";

/// SOCKS5 bytestreams (XEP-0065)
pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";

/// Feature negotiation (XEP-0020)
pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";

/// Stream initiation (XEP-0095)
pub const SI: &str = "http://jabber.org/protocol/si";

/// SI file transfer profile (XEP-0096)
pub const SI_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";

/// Out-of-band data, message extension form (XEP-0066)
pub const X_OOB: &str = "jabber:x:oob";

/// Out-of-band data, IQ form (XEP-0066)
pub const IQ_OOB: &str = "jabber:iq:oob";

/// Data forms (XEP-0004)
pub const X_DATA: &str = "jabber:x:data";

/// Stanza error conditions
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
